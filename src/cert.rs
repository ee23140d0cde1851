use rustls::Certificate;

/// Ordered sequence of DER-encoded certificates, leaf first.
///
/// Two chains are equal only when they have the same length and every
/// element is byte-identical at the same position. Reordered chains are
/// different chains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain(Vec<Vec<u8>>);

impl CertificateChain {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    /// Snapshot of the chain a TLS peer presented.
    pub fn from_rustls(certs: &[Certificate]) -> Self {
        Self(certs.iter().map(|c| c.0.clone()).collect())
    }

    pub fn to_rustls(&self) -> Vec<Certificate> {
        self.0.iter().cloned().map(Certificate).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.0.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().map(Vec::as_slice)
    }

    /// Raw DER bytes of every certificate, concatenated in chain order.
    pub fn concatenated_der(&self) -> Vec<u8> {
        self.0.concat()
    }
}

impl From<Vec<Vec<u8>>> for CertificateChain {
    fn from(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }
}
