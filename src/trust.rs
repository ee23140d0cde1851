//! Trust policies and the pure verification function behind them.
//!
//! Five policies exist. `Local` validates against the platform's trust
//! anchors and is evaluated by the TLS stack itself. `TrustAll` accepts any
//! chain and is only ever used to fetch a peer's certificates. `TrustUrl`,
//! `TrustServer` and `TrustOne` accept exactly one pinned chain.

use std::fmt;

use rustls::PrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::cert::CertificateChain;
use crate::codec;
use crate::compare;
use crate::config::NegotiatorConfig;
use crate::consent::UserConsentGateway;

/// Why automatic trust failed; selects the text shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchReason {
    CertMismatch,
    ServerCertMismatch,
    MissingCerts,
    UserView,
    DidNotFail,
}

impl MismatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchReason::CertMismatch => "cert-mismatch",
            MismatchReason::ServerCertMismatch => "server-cert-mismatch",
            MismatchReason::MissingCerts => "missing-certs",
            MismatchReason::UserView => "user-view",
            MismatchReason::DidNotFail => "did-not-fail",
        }
    }

    /// Paragraph explaining the reason to a human, if there is one to give.
    pub fn explanation(&self) -> Option<&'static str> {
        match self {
            MismatchReason::UserView => Some("You asked to view the certificate."),
            MismatchReason::ServerCertMismatch => Some(
                "The VNC server's certificate does not match the certificate\n\
                 supplied in the pinned server certificate setting.",
            ),
            MismatchReason::CertMismatch => Some(
                "The VNC server's certificate does not match the website's\n\
                 HTTPS certificate that was previously accepted (either\n\
                 manually or automatically via a certificate authority).",
            ),
            MismatchReason::MissingCerts => {
                Some("Not all certificates could be obtained to check.")
            }
            MismatchReason::DidNotFail => None,
        }
    }
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a policy refused a presented chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("no pinned chain available")]
    PinAbsent,
    #[error("pinned chain is empty")]
    PinEmpty,
    #[error("peer presented no certificates")]
    PeerEmpty,
    #[error("peer chain has {presented} certificates, pin has {pinned}")]
    LengthMismatch { pinned: usize, presented: usize },
    #[error("certificate {index} differs from the pin")]
    ElementMismatch { index: usize },
    #[error("chain must be validated against platform trust anchors")]
    AnchorsRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Local,
    TrustAll,
    TrustUrl,
    TrustServer,
    TrustOne,
}

impl PolicyKind {
    pub fn label(&self) -> &'static str {
        match self {
            PolicyKind::Local => "LOC",
            PolicyKind::TrustAll => "ALL",
            PolicyKind::TrustUrl => "URL",
            PolicyKind::TrustServer => "SRV",
            PolicyKind::TrustOne => "ONE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    Local,
    TrustAll,
    /// Pinned to the chain the platform accepted during discovery.
    TrustUrl(Option<CertificateChain>),
    /// Pinned to the operator-supplied server certificate.
    TrustServer(Option<CertificateChain>),
    /// Pinned to the chain fetched by the trust-all probe.
    TrustOne(Option<CertificateChain>),
}

impl TrustPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            TrustPolicy::Local => PolicyKind::Local,
            TrustPolicy::TrustAll => PolicyKind::TrustAll,
            TrustPolicy::TrustUrl(_) => PolicyKind::TrustUrl,
            TrustPolicy::TrustServer(_) => PolicyKind::TrustServer,
            TrustPolicy::TrustOne(_) => PolicyKind::TrustOne,
        }
    }

    pub fn pin(&self) -> Option<&CertificateChain> {
        match self {
            TrustPolicy::TrustUrl(pin) | TrustPolicy::TrustServer(pin) | TrustPolicy::TrustOne(pin) => {
                pin.as_ref()
            }
            TrustPolicy::Local | TrustPolicy::TrustAll => None,
        }
    }

    /// Reason recorded when this policy rejects a chain. `TrustOne` and the
    /// unpinned policies leave the reason untouched.
    pub fn mismatch_reason(&self, rejection: &Rejection) -> Option<MismatchReason> {
        let missing = matches!(
            rejection,
            Rejection::PinAbsent | Rejection::PinEmpty | Rejection::PeerEmpty
        );
        match self.kind() {
            _ if missing => Some(MismatchReason::MissingCerts),
            PolicyKind::TrustUrl => Some(MismatchReason::CertMismatch),
            PolicyKind::TrustServer => Some(MismatchReason::ServerCertMismatch),
            PolicyKind::TrustOne | PolicyKind::Local | PolicyKind::TrustAll => None,
        }
    }
}

/// Evaluate `peer` against `policy`.
///
/// `TrustAll` never rejects. Pinned policies fail closed when the pin is
/// absent or empty, the peer chain is empty, or the chains differ in length
/// or in any element. `Local` cannot be decided without trust anchors and
/// is always refused here.
pub fn verify(policy: &TrustPolicy, peer: &CertificateChain) -> Result<(), Rejection> {
    let pin = match policy {
        TrustPolicy::TrustAll => {
            debug!(certs = peer.len(), "ALL: untrusted connect to grab cert");
            return Ok(());
        }
        TrustPolicy::Local => return Err(Rejection::AnchorsRequired),
        TrustPolicy::TrustUrl(pin) | TrustPolicy::TrustServer(pin) | TrustPolicy::TrustOne(pin) => pin,
    };

    let label = policy.kind().label();
    let pin = pin.as_ref().ok_or(Rejection::PinAbsent)?;
    if pin.is_empty() {
        return Err(Rejection::PinEmpty);
    }
    if peer.is_empty() {
        return Err(Rejection::PeerEmpty);
    }
    if peer.len() != pin.len() {
        return Err(Rejection::LengthMismatch {
            pinned: pin.len(),
            presented: peer.len(),
        });
    }
    if let Some(index) = compare::first_difference(pin, peer) {
        debug!(policy = label, index, "cert mismatch");
        return Err(Rejection::ElementMismatch { index });
    }

    debug!(policy = label, last = peer.len() - 1, "pinned chain matches");
    Ok(())
}

/// Client certificate and key presented on every policy's connections.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    pub key: PrivateKey,
    pub chain: CertificateChain,
}

/// Owns the trust material for one negotiator.
///
/// `Local`, `TrustAll` and `TrustServer` are fixed at construction;
/// `TrustUrl` and `TrustOne` are derived from chains captured at runtime.
#[derive(Debug, Clone)]
pub struct TrustPolicyStore {
    server_pin: Option<CertificateChain>,
    server_pin_configured: bool,
    client_auth: Option<ClientAuth>,
    debug_certs: bool,
}

impl TrustPolicyStore {
    pub fn new(server_pin: Option<CertificateChain>, client_auth: Option<ClientAuth>) -> Self {
        Self {
            server_pin_configured: server_pin.is_some(),
            server_pin,
            client_auth,
            debug_certs: false,
        }
    }

    /// Decode the configured pin and client key.
    ///
    /// Decode failures never abort setup: an unusable client key is dropped
    /// and an unusable server pin stays configured but empty, so it later
    /// fails closed as `missing-certs`.
    pub fn from_config(config: &NegotiatorConfig, gateway: &mut dyn UserConsentGateway) -> Self {
        let mut key_material = config.client_key.clone();
        if key_material.as_deref() == Some("PROMPT") {
            key_material = gateway.client_key_material();
        }

        let client_auth = key_material.and_then(|material| match codec::decode_key_and_chain(&material) {
            Ok((key, chain)) => {
                debug!(certs = chain.len(), "loaded client certificate");
                Some(ClientAuth { key, chain })
            }
            Err(e) => {
                warn!(error = %e, "client key unusable, continuing without client authentication");
                None
            }
        });

        let server_pin = config.server_cert.as_ref().map(|hex| match codec::decode_chain(hex) {
            Ok(chain) => chain,
            Err(e) => {
                warn!(error = %e, "pinned server certificate unusable");
                CertificateChain::default()
            }
        });

        let mut store = Self::new(server_pin, client_auth);
        store.debug_certs = config.debug_certs;
        store
    }

    pub fn client_auth(&self) -> Option<&ClientAuth> {
        self.client_auth.as_ref()
    }

    pub fn has_server_pin(&self) -> bool {
        self.server_pin_configured
    }

    pub fn local(&self) -> TrustPolicy {
        TrustPolicy::Local
    }

    pub fn trust_all(&self) -> TrustPolicy {
        TrustPolicy::TrustAll
    }

    pub fn trust_server(&self) -> TrustPolicy {
        TrustPolicy::TrustServer(self.server_pin.clone())
    }

    pub fn trust_url(&self, browser_chain: Option<&CertificateChain>) -> TrustPolicy {
        TrustPolicy::TrustUrl(browser_chain.cloned())
    }

    pub fn trust_one(&self, probe_chain: &CertificateChain) -> TrustPolicy {
        TrustPolicy::TrustOne(Some(probe_chain.clone()))
    }

    /// Policy for the first attempt: server pin, then the trust-all
    /// override, then the browser-trusted chain, then local anchors.
    pub fn initial_policy(&self, trust_all: bool, browser_chain: Option<&CertificateChain>) -> TrustPolicy {
        if self.server_pin_configured {
            self.trust_server()
        } else if trust_all {
            self.trust_all()
        } else if let Some(chain) = browser_chain {
            self.trust_url(Some(chain))
        } else {
            self.local()
        }
    }

    /// Policy for the HTTPS discovery probe. With a client key the probe
    /// must carry it, and a server pin then decides the peer.
    pub fn probe_policy(&self) -> TrustPolicy {
        if self.client_auth.is_some() && self.server_pin_configured {
            self.trust_server()
        } else {
            self.local()
        }
    }

    /// Dump a chain at trace level when certificate debugging is enabled.
    pub fn trace_chain(&self, what: &str, chain: &CertificateChain) {
        if self.debug_certs {
            trace!(what, "\n{}", compare::describe_chain(chain));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(parts: &[&[u8]]) -> CertificateChain {
        CertificateChain::new(parts.iter().map(|p| p.to_vec()).collect())
    }

    #[test]
    fn trust_all_accepts_anything() {
        assert_eq!(verify(&TrustPolicy::TrustAll, &CertificateChain::default()), Ok(()));
        assert_eq!(verify(&TrustPolicy::TrustAll, &chain(&[b"x"])), Ok(()));
    }

    #[test]
    fn local_is_never_decided_here() {
        assert_eq!(
            verify(&TrustPolicy::Local, &chain(&[b"x"])),
            Err(Rejection::AnchorsRequired)
        );
    }

    #[test]
    fn pinned_policies_fail_closed() {
        let peer = chain(&[b"leaf"]);
        assert_eq!(verify(&TrustPolicy::TrustUrl(None), &peer), Err(Rejection::PinAbsent));
        assert_eq!(
            verify(&TrustPolicy::TrustServer(Some(CertificateChain::default())), &peer),
            Err(Rejection::PinEmpty)
        );
        assert_eq!(
            verify(&TrustPolicy::TrustOne(Some(peer.clone())), &CertificateChain::default()),
            Err(Rejection::PeerEmpty)
        );
    }

    #[test]
    fn pinned_policies_compare_strictly() {
        let pin = chain(&[b"leaf", b"ca"]);
        let policy = TrustPolicy::TrustOne(Some(pin.clone()));
        assert_eq!(verify(&policy, &pin), Ok(()));
        assert_eq!(
            verify(&policy, &chain(&[b"leaf"])),
            Err(Rejection::LengthMismatch { pinned: 2, presented: 1 })
        );
        assert_eq!(
            verify(&policy, &chain(&[b"leaf", b"evil"])),
            Err(Rejection::ElementMismatch { index: 1 })
        );
    }

    #[test]
    fn rejection_maps_to_reason_per_policy() {
        let mismatch = Rejection::ElementMismatch { index: 0 };
        assert_eq!(
            TrustPolicy::TrustUrl(None).mismatch_reason(&mismatch),
            Some(MismatchReason::CertMismatch)
        );
        assert_eq!(
            TrustPolicy::TrustServer(None).mismatch_reason(&mismatch),
            Some(MismatchReason::ServerCertMismatch)
        );
        assert_eq!(TrustPolicy::TrustOne(None).mismatch_reason(&mismatch), None);
        assert_eq!(
            TrustPolicy::TrustServer(None).mismatch_reason(&Rejection::PinEmpty),
            Some(MismatchReason::MissingCerts)
        );
    }

    #[test]
    fn initial_policy_priority() {
        let browser = chain(&[b"web"]);
        let pinned = TrustPolicyStore::new(Some(chain(&[b"pin"])), None);
        assert_eq!(pinned.initial_policy(true, Some(&browser)).kind(), PolicyKind::TrustServer);

        let plain = TrustPolicyStore::new(None, None);
        assert_eq!(plain.initial_policy(true, Some(&browser)).kind(), PolicyKind::TrustAll);
        assert_eq!(
            plain.initial_policy(false, Some(&browser)),
            TrustPolicy::TrustUrl(Some(browser.clone()))
        );
        assert_eq!(plain.initial_policy(false, None), TrustPolicy::Local);
    }

    #[test]
    fn undecodable_pin_stays_configured_but_empty() {
        let config = NegotiatorConfig {
            server_cert: Some("not hex".to_string()),
            client_key: Some("nonsense".to_string()),
            ..NegotiatorConfig::default()
        };
        let mut gateway = crate::consent::testing::ScriptedGateway::default();
        let store = TrustPolicyStore::from_config(&config, &mut gateway);

        assert!(store.has_server_pin());
        assert!(store.client_auth().is_none());
        let policy = store.initial_policy(false, None);
        assert_eq!(verify(&policy, &chain(&[b"x"])), Err(Rejection::PinEmpty));
        assert_eq!(
            policy.mismatch_reason(&Rejection::PinEmpty),
            Some(MismatchReason::MissingCerts)
        );
    }

    #[test]
    fn prompted_client_key_comes_from_gateway() {
        let cert = rcgen::generate_simple_self_signed(vec!["client".to_string()]).unwrap();
        let material = format!(
            "{},{}",
            hex::encode(cert.serialize_private_key_der()),
            hex::encode(cert.serialize_der().unwrap())
        );
        let config = NegotiatorConfig {
            client_key: Some("PROMPT".to_string()),
            ..NegotiatorConfig::default()
        };
        let mut gateway = crate::consent::testing::ScriptedGateway {
            client_key: Some(material),
            ..Default::default()
        };
        let store = TrustPolicyStore::from_config(&config, &mut gateway);
        assert!(store.client_auth().is_some());
        assert_eq!(store.probe_policy(), TrustPolicy::Local);
    }
}
