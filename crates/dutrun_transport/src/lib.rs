//! Remote command execution and byte forwarding to a DUT.
//!
//! A [Connection] wraps one [Transport] (an OpenSSH multiplexed session, or the local machine
//! in tests) together with the shell-quoting strategy of the target. Commands are built with
//! [Connection::command] and driven through [Cmd]; raw TCP channels are opened with
//! [Connection::dial_remote] and exposed locally with a [Forwarder].

pub mod auth;
pub mod cmd;
pub mod conn;
pub mod error;
pub mod forwarder;
pub mod options;
pub mod shell;
pub mod transport;

pub use cmd::{AbortHandle, Cmd, CmdError};
pub use conn::{connect, Connection};
pub use error::TransportError;
pub use forwarder::Forwarder;
pub use options::{KnownHostsPolicy, SshOptions, Target};
pub use shell::{ShellCommandBuilder, ShellKind};
pub use transport::{LocalTransport, RemoteChild, SshTransport, Transport};
