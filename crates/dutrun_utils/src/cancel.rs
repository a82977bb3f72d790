//! Cancellation scopes and cancellable blocking calls.
//!
//! A [CancelScope] carries an explicit cancellation signal plus an optional deadline. Every
//! operation that may block on the network or a remote process takes a scope, and returns
//! [Cancelled] as soon as the scope is done, even if the underlying primitive has no native
//! cancellation. See [run_cancellable].

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope cancelled whenever this one is, that can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope whose deadline is the earlier of this scope's deadline and `timeout`
    /// from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Cancelled::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    ///
    /// Cancel-safe.
    pub async fn done(&self) -> Cancelled {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Cancelled::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Cancelled::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Cancelled::Cancelled
            }
        }
    }
}

/// Runs `fut` on a background task, racing its completion against `scope`.
///
/// If the scope wins, the caller is unblocked immediately with the cancellation reason. The
/// background task keeps running; once it finishes, its output is handed to `cleanup` so that
/// resources it produced (sessions, child processes) are released rather than leaked.
///
/// Panics inside `fut` are propagated to the caller.
pub async fn run_cancellable<T, F, C>(
    scope: &CancelScope,
    fut: F,
    cleanup: C,
) -> Result<T, Cancelled>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
    C: FnOnce(T) + Send + 'static,
{
    scope.check()?;

    let mut handle = tokio::spawn(fut);

    tokio::select! {
        biased;

        joined = &mut handle => match joined {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Cancelled::Cancelled),
        },

        reason = scope.done() => {
            tracing::debug!(?reason, "abandoning blocking call");
            tokio::spawn(async move {
                if let Ok(value) = handle.await {
                    cleanup(value);
                }
            });
            Err(reason)
        }
    }
}
