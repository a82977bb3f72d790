use std::{io, sync::Arc, time::Duration};

use dutrun_utils::{
    cancel::{run_cancellable, CancelScope},
    retry::async_retry_n,
};
use futures::FutureExt;
use openssh::SessionBuilder;
use tokio::net::TcpListener;

use crate::{
    auth::{self, AuthMethod},
    cmd::Cmd,
    error::{mentions_auth_rejection, TransportError},
    forwarder::{ErrorFn, Forwarder},
    options::SshOptions,
    shell::{PosixShell, ShellCommandBuilder},
    transport::{BoxedStream, LocalTransport, SshTransport, Transport},
};

/// Connects to the DUT described by `opts`.
///
/// Makes up to `connect_retries + 1` attempts, starting them at least
/// `connect_retry_interval` apart. Each attempt is bounded by `connect_timeout` and walks the
/// planned authentication methods until one is accepted. Returns early with
/// [TransportError::Cancelled] once `scope` is done.
pub async fn connect(scope: &CancelScope, opts: &SshOptions) -> Result<Connection, TransportError> {
    let methods = auth::plan(opts, auth::agent_socket_from_env());

    async_retry_n(
        opts.connect_retries + 1,
        opts.connect_retry_interval,
        scope,
        |attempt| {
            let methods = &methods;
            async move {
                tracing::debug!(attempt, dut = %opts.target, "connecting");
                connect_once(scope, opts, methods).await
            }
        },
    )
    .await
}

async fn connect_once(
    scope: &CancelScope,
    opts: &SshOptions,
    methods: &[AuthMethod],
) -> Result<Connection, TransportError> {
    let target = opts.target.to_string();

    for method in methods {
        let mut builder = SessionBuilder::default();
        builder
            .user(opts.target.user.clone())
            .port(opts.target.port)
            .known_hosts_check(opts.known_hosts.into())
            .connect_timeout(opts.connect_timeout)
            .control_directory(std::env::temp_dir());
        match method {
            AuthMethod::KeyFile(key) => {
                builder.keyfile(key);
            }
            AuthMethod::Agent(socket) => {
                builder.ssh_auth_sock(socket);
            }
            AuthMethod::Default => {}
        }

        let attempt_scope = scope.with_timeout(opts.connect_timeout);
        let host = opts.target.host.clone();
        let connected = run_cancellable(
            &attempt_scope,
            async move { builder.connect(&host).await },
            |late| {
                if let Ok(session) = late {
                    tokio::spawn(async move {
                        let _ = session.close().await;
                    });
                }
            },
        )
        .await;

        match connected {
            Ok(Ok(session)) => {
                tracing::info!(dut = %target, auth = %method, "connected");
                let transport = Arc::new(SshTransport::new(session));
                return Ok(Connection::new(transport, opts.shell.builder(), target));
            }
            Ok(Err(error)) if mentions_auth_rejection(&error) => {
                tracing::warn!(dut = %target, auth = %method, %error, "authentication rejected");
                continue;
            }
            Ok(Err(error)) => return Err(error.into()),
            Err(reason) => {
                scope.check()?;
                return Err(TransportError::Connect {
                    target,
                    reason: format!("{reason} after {:?}", opts.connect_timeout),
                });
            }
        }
    }

    Err(TransportError::Auth {
        target,
        tried: methods
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// A live connection to a target. Cheap to clone; clones share the underlying transport.
#[derive(Clone)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    shell: Arc<dyn ShellCommandBuilder>,
    target: String,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        shell: Arc<dyn ShellCommandBuilder>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            shell,
            target: target.into(),
        }
    }

    /// A connection to this machine.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalTransport), Arc::new(PosixShell), "localhost")
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn command(&self, program: impl Into<String>) -> Cmd {
        Cmd::new(self.transport.clone(), self.shell.clone(), program)
    }

    /// Checks that the target still answers, within the smaller of `timeout` and the time
    /// left in `scope`.
    pub async fn ping(&self, scope: &CancelScope, timeout: Duration) -> Result<(), TransportError> {
        let ping_scope = scope.with_timeout(timeout);
        let transport = self.transport.clone();
        match run_cancellable(&ping_scope, async move { transport.ping().await }, |_| {}).await {
            Ok(result) => result,
            Err(reason) => {
                scope.check()?;
                tracing::debug!(dut = %self.target, ?reason, "ping timed out");
                Err(TransportError::PingTimeout(timeout))
            }
        }
    }

    /// Opens a byte channel to `host:port` as seen from the target.
    pub async fn dial_remote(
        &self,
        scope: &CancelScope,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, TransportError> {
        let transport = self.transport.clone();
        let host = host.to_string();
        run_cancellable(scope, async move { transport.dial(&host, port).await }, drop).await?
    }

    /// Relays connections accepted on `listener` to `host:port` on the target's side.
    pub fn forward_local(
        &self,
        listener: TcpListener,
        host: impl Into<String>,
        port: u16,
        on_error: ErrorFn,
    ) -> io::Result<Forwarder> {
        let transport = self.transport.clone();
        let host: Arc<str> = host.into().into();
        let dial = Arc::new(move || {
            let transport = transport.clone();
            let host = host.clone();
            async move {
                transport
                    .dial(&host, port)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))
            }
            .boxed()
        });
        Forwarder::new(listener, dial, on_error)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("shell", &self.shell)
            .finish()
    }
}
