use std::{io, time::Duration};

use dutrun_utils::cancel::Cancelled;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("authentication to {target} failed (tried {tried})")]
    Auth { target: String, tried: String },
    #[error("{0}")]
    Ssh(#[from] openssh::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("connection is closed")]
    Closed,
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
    #[error("no ping response within {0:?}")]
    PingTimeout(Duration),
}

impl TransportError {
    /// Whether the server explicitly refused the offered credentials.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            TransportError::Auth { .. } => true,
            TransportError::Ssh(e) => mentions_auth_rejection(e),
            _ => false,
        }
    }
}

pub(crate) fn mentions_auth_rejection(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cause = Some(err);
    while let Some(e) = cause {
        if e.to_string().to_lowercase().contains("permission denied") {
            return true;
        }
        cause = e.source();
    }
    false
}
