//! Chain comparison and subject scraping for display.
//!
//! Nothing in here feeds a trust decision except [`chains_equal`]; the
//! field extraction is for the text shown to a human.

use x509_parser::parse_x509_certificate;

use crate::cert::CertificateChain;

/// Subject fields shown to the user, in display order.
pub const SUBJECT_FIELDS: [&str; 5] = ["CN", "OU", "O", "L", "C"];

/// Strict ordered equality: same length, byte-identical elements.
pub fn chains_equal(a: &CertificateChain, b: &CertificateChain) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

/// Index of the first differing element, or `None` when the chains are equal.
pub fn first_difference(a: &CertificateChain, b: &CertificateChain) -> Option<usize> {
    if let Some(index) = a.iter().zip(b.iter()).position(|(x, y)| x != y) {
        return Some(index);
    }
    if a.len() != b.len() {
        return Some(a.len().min(b.len()));
    }
    None
}

/// Printable multi-line representation of one DER certificate.
pub fn printable(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    let validity = cert.validity();
    Some(format!(
        "Subject: {}\nIssuer: {}\nSerial: {}\nNot before: {}\nNot after: {}\nSignature algorithm: {}\n",
        cert.subject(),
        cert.issuer(),
        cert.raw_serial_as_string(),
        validity.not_before,
        validity.not_after,
        cert.signature_algorithm.algorithm,
    ))
}

/// Printable subject name alone, one line.
pub fn subject_text(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    Some(format!("{}\n", cert.subject()))
}

/// Value of `field` (e.g. `CN`) in the certificate's printable subject.
pub fn extract_field(der: &[u8], field: &str) -> Option<String> {
    scan_field(&subject_text(der)?, field)
}

/// Find a `FIELD=value` token and return `value`, bounded by the next
/// `", "` or line break.
pub fn scan_field(text: &str, field: &str) -> Option<String> {
    let needle = format!("{}=", field);
    let mut search_from = 0;

    while let Some(found) = text[search_from..].find(&needle) {
        let start = search_from + found;
        search_from = start + needle.len();

        let at_boundary = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| matches!(c, ' ' | ',' | '\n' | ':'));
        if !at_boundary {
            continue;
        }

        let value_start = start + needle.len();
        let tail = &text[value_start..];
        let end = [tail.find(", "), tail.find('\n')]
            .into_iter()
            .flatten()
            .min()?;
        if end == 0 {
            return None;
        }
        return Some(tail[..end].to_string());
    }

    None
}

/// Indented `FIELD=value` lines for the leaf certificate.
pub fn subject_summary(chain: &CertificateChain) -> String {
    let Some(text) = chain.leaf().and_then(subject_text) else {
        return String::new();
    };

    SUBJECT_FIELDS
        .iter()
        .filter_map(|field| scan_field(&text, field).map(|value| format!("        {}={}\n", field, value)))
        .collect()
}

/// One block per certificate, as shown by a "view certificate" action.
pub fn describe_chain(chain: &CertificateChain) -> String {
    let mut out = String::new();
    for (i, der) in chain.iter().enumerate() {
        out.push_str(&format!("Certificate[{}]\n\n", i + 1));
        match printable(der) {
            Some(text) => out.push_str(&text),
            None => out.push_str(&format!("<{} bytes, not parseable>\n", der.len())),
        }
        out.push_str("\n---------------------------------------------------\n\n");
    }
    out
}
