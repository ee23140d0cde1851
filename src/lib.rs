//! TLS connection negotiation for VNC viewers.
//!
//! A [`Negotiator`] opens a TLS connection to a VNC server under layered
//! trust: an operator-pinned chain, the platform's trust anchors, or a chain
//! the user accepted after seeing it. Proxies are discovered and tunneled
//! through with HTTP `CONNECT`.

pub mod cert;
pub mod codec;
pub mod compare;
pub mod config;
pub mod consent;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod negotiator;
pub mod proxy;
pub mod tls_wrapper;
pub mod transport;
pub mod trust;
pub mod tunnel;

#[cfg(feature = "tokio")]
pub mod async_connect;


pub use cert::CertificateChain;
pub use config::{NegotiatorConfig, ProxyOverride};
pub use consent::{AutoTrustDecision, CertificateReview, UserConsentGateway};
pub use error::NegotiationError;
pub use negotiator::{ConnectionOutcome, Negotiator, SecureConnection};
pub use proxy::{ProxyCredentials, ProxyEndpoint};
pub use tls_wrapper::{NativeHandshaker, TlsStream};
pub use trust::{MismatchReason, PolicyKind, TrustPolicy};
