use std::time::Duration;

use async_trait::async_trait;
use dutrun_transport::{connect, Connection, SshOptions, TransportError};
use dutrun_utils::cancel::CancelScope;
use tokio::sync::Mutex;

/// Owns the connection to the DUT for a run, and replaces it when it drops.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// The current connection, without checking that it is alive.
    async fn connection(&self) -> Connection;

    /// Checks the current connection and reconnects if it stopped answering. Returns the
    /// connection to use from now on.
    async fn reconnect_if_needed(&self, scope: &CancelScope) -> Result<Connection, TransportError>;
}

pub struct SshConnectionManager {
    opts: SshOptions,
    ping_timeout: Duration,
    conn: Mutex<Connection>,
}

impl SshConnectionManager {
    pub async fn connect(
        scope: &CancelScope,
        opts: SshOptions,
        ping_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let conn = connect(scope, &opts).await?;
        Ok(Self {
            opts,
            ping_timeout,
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ConnectionManager for SshConnectionManager {
    async fn connection(&self) -> Connection {
        self.conn.lock().await.clone()
    }

    async fn reconnect_if_needed(&self, scope: &CancelScope) -> Result<Connection, TransportError> {
        let mut conn = self.conn.lock().await;
        let error = match conn.ping(scope, self.ping_timeout).await {
            Ok(()) => return Ok(conn.clone()),
            Err(error @ TransportError::Cancelled(_)) => return Err(error),
            Err(error) => error,
        };

        tracing::warn!(dut = %conn.target(), %error, "lost connection to DUT; reconnecting");
        if let Err(error) = conn.close().await {
            tracing::debug!(%error, "failed to close dropped connection");
        }
        *conn = connect(scope, &self.opts).await?;
        tracing::info!(dut = %conn.target(), "reconnected to DUT");
        Ok(conn.clone())
    }
}

/// A connection that is never replaced, such as one to this machine.
#[derive(Clone)]
pub struct FixedConnection(pub Connection);

#[async_trait]
impl ConnectionManager for FixedConnection {
    async fn connection(&self) -> Connection {
        self.0.clone()
    }

    async fn reconnect_if_needed(&self, scope: &CancelScope) -> Result<Connection, TransportError> {
        scope.check()?;
        Ok(self.0.clone())
    }
}
