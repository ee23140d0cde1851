//! Hex-encoded pinned material.
//!
//! Server pins are a hex string of one or more concatenated DER
//! certificates. Client-auth material is `<hex PKCS8 key>,<hex certificate(s)>`.

use rustls::PrivateKey;
use thiserror::Error;
use x509_parser::parse_x509_certificate;

use crate::cert::CertificateChain;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("no certificate data")]
    Empty,
    #[error("malformed X.509 certificate at byte {offset}: {reason}")]
    Certificate { offset: usize, reason: String },
    #[error("client key material must be `<hex key>,<hex certificate(s)>`")]
    MissingSeparator,
    #[error("unsupported or malformed PKCS8 private key")]
    PrivateKey,
}

/// Decode a hex string of concatenated DER certificates.
///
/// Decoding is strict: odd length or any non-hex character rejects the
/// whole input rather than skipping the bad pair.
pub fn decode_chain(hex_str: &str) -> Result<CertificateChain, DecodeError> {
    let der = hex::decode(hex_str.trim())?;
    split_der_chain(&der)
}

/// Decode `<hex key>,<hex certificate(s)>`, splitting on the first comma.
pub fn decode_key_and_chain(material: &str) -> Result<(PrivateKey, CertificateChain), DecodeError> {
    let (key_hex, certs_hex) = material
        .split_once(',')
        .ok_or(DecodeError::MissingSeparator)?;

    let key = PrivateKey(hex::decode(key_hex.trim())?);
    rustls::sign::any_supported_type(&key).map_err(|_| DecodeError::PrivateKey)?;

    let chain = decode_chain(certs_hex)?;
    Ok((key, chain))
}

/// Hex form of a chain, the inverse of [`decode_chain`].
pub fn encode_chain(chain: &CertificateChain) -> String {
    hex::encode(chain.concatenated_der())
}

/// Split back-to-back DER certificates, validating each one.
pub fn split_der_chain(der: &[u8]) -> Result<CertificateChain, DecodeError> {
    if der.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut certs = Vec::new();
    let mut rest = der;
    while !rest.is_empty() {
        let offset = der.len() - rest.len();
        let (remaining, _) = parse_x509_certificate(rest).map_err(|e| DecodeError::Certificate {
            offset,
            reason: e.to_string(),
        })?;
        let consumed = rest.len() - remaining.len();
        certs.push(rest[..consumed].to_vec());
        rest = remaining;
    }

    Ok(CertificateChain::new(certs))
}
