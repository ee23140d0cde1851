use std::io;

use thiserror::Error;

use crate::trust::{MismatchReason, Rejection};
use crate::tunnel::TunnelError;

/// Failure to produce a byte stream to the peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot resolve {target}: {source}")]
    Resolve { target: String, source: io::Error },
    #[error("{target} resolved to no addresses")]
    NoAddress { target: String },
    #[error("connect to {target} failed: {source}")]
    Connect { target: String, source: io::Error },
    #[error("proxy tunnel to {target} failed: {source}")]
    Tunnel { target: String, source: TunnelError },
    #[error("no proxy address available for {target}")]
    NoProxy { target: String },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single connection attempt under one policy.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// TLS negotiation failed. `rejection` is set when our own policy
    /// refused the peer chain.
    #[error("TLS handshake failed: {message}")]
    Handshake {
        message: String,
        rejection: Option<Rejection>,
    },
}

impl AttemptError {
    pub fn handshake(message: impl Into<String>) -> Self {
        AttemptError::Handshake {
            message: message.into(),
            rejection: None,
        }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        AttemptError::Handshake {
            message: rejection.to_string(),
            rejection: Some(rejection),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            AttemptError::Handshake { rejection, .. } => rejection.as_ref(),
            AttemptError::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AttemptError::Transport(_))
    }
}

/// Terminal outcome of a failed negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{target}: {source}")]
    Transport {
        target: String,
        source: TransportError,
    },
    #[error("{target}: TLS handshake failed: {message}")]
    Handshake { target: String, message: String },
    #[error("{target}: peer not trusted ({reason})")]
    TrustRejected {
        target: String,
        reason: MismatchReason,
        message: String,
    },
    #[error("{target}: certificate rejected by user")]
    UserRejected { target: String },
    #[error("{target}: peer does not match the pinned server certificate ({reason})")]
    FatalPinMismatch {
        target: String,
        reason: MismatchReason,
    },
    #[error("{target}: {message}")]
    Setup { target: String, message: String },
}

impl NegotiationError {
    /// Lift an attempt failure into a terminal error for `target`.
    pub(crate) fn from_attempt(target: &str, error: AttemptError) -> Self {
        match error {
            AttemptError::Transport(source) => NegotiationError::Transport {
                target: target.to_string(),
                source,
            },
            AttemptError::Handshake { message, .. } => NegotiationError::Handshake {
                target: target.to_string(),
                message,
            },
        }
    }

    pub fn target(&self) -> &str {
        match self {
            NegotiationError::Transport { target, .. }
            | NegotiationError::Handshake { target, .. }
            | NegotiationError::TrustRejected { target, .. }
            | NegotiationError::UserRejected { target }
            | NegotiationError::FatalPinMismatch { target, .. }
            | NegotiationError::Setup { target, .. } => target,
        }
    }

    pub fn reason(&self) -> Option<MismatchReason> {
        match self {
            NegotiationError::TrustRejected { reason, .. }
            | NegotiationError::FatalPinMismatch { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
