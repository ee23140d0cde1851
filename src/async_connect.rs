//! Upper bound on a blocking negotiation.
//!
//! `connect()` may stall on a silent peer. Running it on the blocking pool
//! and racing it against a timer gives callers a deadline; on expiry the
//! worker is abandoned, not cancelled.

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::warn;

use crate::consent::UserConsentGateway;
use crate::negotiator::{ConnectionOutcome, Negotiator};
use crate::transport::Handshaker;

#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("negotiation with {target} did not finish within {deadline:?}")]
    Elapsed { target: String, deadline: Duration },
    #[error("negotiation task failed: {0}")]
    Join(#[from] JoinError),
}

/// Negotiate on a blocking worker, giving up after `deadline`. On completion
/// the negotiator is handed back together with the outcome.
pub async fn connect_with_deadline<H, G>(
    mut negotiator: Negotiator<H, G>,
    host: String,
    port: u16,
    deadline: Duration,
) -> Result<(Negotiator<H, G>, ConnectionOutcome<H::Stream>), DeadlineError>
where
    H: Handshaker + Send + 'static,
    H::Stream: Send + 'static,
    G: UserConsentGateway + Send + 'static,
{
    let target = format!("{}:{}", host, port);
    let worker = tokio::task::spawn_blocking(move || {
        let outcome = negotiator.connect(&host, port);
        (negotiator, outcome)
    });

    match tokio::time::timeout(deadline, worker).await {
        Ok(joined) => Ok(joined?),
        Err(_) => {
            warn!(peer = %target, ?deadline, "negotiation deadline elapsed");
            Err(DeadlineError::Elapsed { target, deadline })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateChain;
    use crate::config::NegotiatorConfig;
    use crate::consent::testing::ScriptedGateway;
    use crate::error::AttemptError;
    use crate::transport::testing::{MemoryStream, ScriptedHandshaker};
    use crate::transport::{Established, Route, Target};
    use crate::trust::{PolicyKind, TrustPolicy};

    struct SlowHandshaker {
        inner: ScriptedHandshaker,
        delay: Duration,
    }

    impl Handshaker for SlowHandshaker {
        type Stream = MemoryStream;

        fn handshake(
            &mut self,
            target: &Target,
            route: &Route,
            policy: &TrustPolicy,
            gateway: &mut dyn UserConsentGateway,
        ) -> Result<Established<MemoryStream>, AttemptError> {
            std::thread::sleep(self.delay);
            self.inner.handshake(target, route, policy, gateway)
        }
    }

    fn trust_all() -> NegotiatorConfig {
        NegotiatorConfig {
            trust_all: true,
            ignore_proxy: true,
            ..NegotiatorConfig::default()
        }
    }

    #[tokio::test]
    async fn completes_within_deadline() {
        let handshaker = ScriptedHandshaker::presenting(CertificateChain::new(vec![b"leaf".to_vec()]));
        let negotiator = Negotiator::new(trust_all(), handshaker, ScriptedGateway::default());

        let (negotiator, outcome) =
            connect_with_deadline(negotiator, "vnc.example.com".to_string(), 5900, Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(outcome.ok().map(|c| c.policy), Some(PolicyKind::TrustAll));
        assert_eq!(negotiator.handshaker().attempts.len(), 1);
    }

    #[tokio::test]
    async fn stalled_negotiation_hits_deadline() {
        let handshaker = SlowHandshaker {
            inner: ScriptedHandshaker::default(),
            delay: Duration::from_millis(500),
        };
        let negotiator = Negotiator::new(trust_all(), handshaker, ScriptedGateway::default());

        let err = connect_with_deadline(negotiator, "vnc.example.com".to_string(), 5900, Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeadlineError::Elapsed { .. }));
        assert!(err.to_string().contains("vnc.example.com:5900"));
    }
}
