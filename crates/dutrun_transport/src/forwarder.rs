use std::{io, net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::transport::BoxedStream;

/// Opens the far end of a forwarded connection.
pub type DialFn = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

/// Receives the error that ended a forwarded connection.
pub type ErrorFn = Arc<dyn Fn(io::Error) + Send + Sync>;

/// Relays every connection accepted on a local listener to a freshly dialed remote
/// endpoint, copying bytes both ways until both directions reach EOF.
///
/// The first error of a connection, whether dialing or copying, is passed to `on_error`
/// exactly once, from the connection's own task.
pub struct Forwarder {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl Forwarder {
    pub fn new(listener: TcpListener, dial: DialFn, on_error: ErrorFn) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, dial, on_error, shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and releases the listener. Connections already accepted
    /// keep relaying until they finish.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    dial: DialFn,
    on_error: ErrorFn,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (local, peer) = match accepted {
            Ok(conn) => conn,
            Err(error) => {
                tracing::warn!(%error, "forwarder stopped accepting");
                on_error(error);
                return;
            }
        };
        tracing::debug!(%peer, "forwarding connection");

        let dial = dial.clone();
        let on_error = on_error.clone();
        tokio::spawn(async move {
            if let Err(error) = relay(local, dial).await {
                tracing::debug!(%peer, %error, "forwarded connection failed");
                on_error(error);
            }
        });
    }
}

async fn relay(mut local: tokio::net::TcpStream, dial: DialFn) -> io::Result<()> {
    let mut remote = dial().await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    tracing::debug!(sent, received, "forwarded connection closed");
    Ok(())
}
