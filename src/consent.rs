//! The human in the loop.
//!
//! Every interactive decision goes through [`UserConsentGateway`]. Calls
//! block until the user answers, so implementations must not be driven
//! from a latency-sensitive thread.

use crate::cert::CertificateChain;
use crate::compare;
use crate::proxy::{ProxyCredentials, ProxyEndpoint};
use crate::trust::MismatchReason;

/// Answer to "the platform verified this server, connect to it?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoTrustDecision {
    #[default]
    Connect,
    /// Show the certificate first; the negotiation continues as if
    /// automatic trust had failed.
    ShowCertificate,
}

pub trait UserConsentGateway {
    /// Present an unverified peer chain. `true` accepts it for this session.
    fn review_certificate(&mut self, review: &CertificateReview) -> bool;

    /// Confirm a peer the platform anchors already accepted.
    fn confirm_verified_peer(&mut self, _host: &str, _port: u16, _subject: Option<&str>) -> AutoTrustDecision {
        AutoTrustDecision::Connect
    }

    /// Proxy address when it could not be discovered. `guess` is what the
    /// user answered on an earlier call, if anything.
    fn proxy_address(&mut self, _guess: Option<&ProxyEndpoint>) -> Option<ProxyEndpoint> {
        None
    }

    /// Credentials after a `407` challenge.
    fn proxy_credentials(&mut self, _proxy: &ProxyEndpoint, _realm: Option<&str>) -> Option<ProxyCredentials> {
        None
    }

    /// Hex `key,cert(s)` when the client key is configured as `PROMPT`.
    fn client_key_material(&mut self) -> Option<String> {
        None
    }
}

/// Everything shown to the user when automatic trust fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateReview {
    pub host: String,
    pub port: u16,
    pub chain: CertificateChain,
    pub reason: Option<MismatchReason>,
}

impl CertificateReview {
    pub fn title(&self) -> String {
        format!("VNC Server {}:{} Not Verified", self.host, self.port)
    }

    pub fn subject(&self) -> String {
        compare::subject_summary(&self.chain)
    }

    /// Dialog body: target, subject summary, reason, and the common causes.
    pub fn render(&self) -> String {
        let mut text = String::new();
        text.push_str("\nUnable to verify the identity of\n\n");
        text.push_str(&format!("        {}:{}\n\n", self.host, self.port));
        text.push_str(&self.subject());
        text.push_str("\nas a trusted VNC server.\n\n");

        if let Some(explanation) = self.reason.and_then(|r| r.explanation()) {
            text.push_str(explanation);
            text.push_str("\n\n");
        }

        text.push_str(
            "This usually means one of:\n\n \
             - the certificate view was requested before accepting\n \
             - the server uses a self-signed certificate or an unknown authority\n \
             - a portal in front of the server presents a different certificate\n \
             - no browser-accepted certificate was available to compare against\n \
             - the certificate does not match the pinned server certificate\n \
             - someone is impersonating the server\n\n\
             Installing the server's certificate (or its authority) in the platform\n\
             trust store lets future connections verify it automatically.\n",
        );
        text
    }

    /// Per-certificate dump for a "view certificate" action.
    pub fn details(&self) -> String {
        compare::describe_chain(&self.chain)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_text_names_target_and_reason() {
        let review = CertificateReview {
            host: "vnc.example.com".to_string(),
            port: 5900,
            chain: CertificateChain::default(),
            reason: Some(MismatchReason::ServerCertMismatch),
        };
        let text = review.render();
        assert!(text.contains("        vnc.example.com:5900\n"));
        assert!(text.contains("pinned server certificate setting"));
        assert_eq!(review.title(), "VNC Server vnc.example.com:5900 Not Verified");
    }

    #[test]
    fn review_includes_leaf_subject() {
        let der = rcgen::generate_simple_self_signed(vec!["vnc.example.com".to_string()])
            .unwrap()
            .serialize_der()
            .unwrap();
        let review = CertificateReview {
            host: "vnc.example.com".to_string(),
            port: 5900,
            chain: CertificateChain::new(vec![der]),
            reason: None,
        };
        assert!(review.render().contains("CN=rcgen self signed cert"));
        assert!(review.details().starts_with("Certificate[1]\n\n"));
    }
}
