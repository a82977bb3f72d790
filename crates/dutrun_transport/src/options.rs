use std::{fmt, path::PathBuf, time::Duration};

use serde_derive::{Deserialize, Serialize};

use crate::{error::TransportError, shell::ShellKind};

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PORT: u16 = 22;

/// How to treat host keys that are not yet, or differently, recorded in `known_hosts`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    Strict,
    Add,
    /// DUTs are frequently reflashed, so their host keys change all the time.
    #[default]
    Accept,
}

impl From<KnownHostsPolicy> for openssh::KnownHosts {
    fn from(policy: KnownHostsPolicy) -> Self {
        match policy {
            KnownHostsPolicy::Strict => openssh::KnownHosts::Strict,
            KnownHostsPolicy::Add => openssh::KnownHosts::Add,
            KnownHostsPolicy::Accept => openssh::KnownHosts::Accept,
        }
    }
}

/// Where to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parses `[user@]host[:port]`. IPv6 hosts with a port must be bracketed
    /// (`[::1]:2222`); a bare IPv6 address is taken as the host alone.
    pub fn parse(target: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidTarget {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let (user, hostport) = match target.split_once('@') {
            Some(("", _)) => return Err(invalid("empty user")),
            Some((user, hostport)) => (user, hostport),
            None => (DEFAULT_USER, target),
        };

        let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(invalid("unexpected text after ']'")),
                },
            }
        } else if hostport.matches(':').count() > 1 {
            (hostport, None)
        } else {
            match hostport.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (hostport, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid("invalid port")),
                Ok(port) => port,
            },
        };

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// Options for establishing an SSH connection to a DUT.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub target: Target,
    /// Private key to try before anything else.
    pub key_file: Option<PathBuf>,
    /// Directory scanned for the standard key names.
    pub key_dir: Option<PathBuf>,
    /// Bound on each individual connection attempt.
    pub connect_timeout: Duration,
    /// How many times to retry after the first failed attempt.
    pub connect_retries: usize,
    /// Minimum time between the starts of consecutive attempts.
    pub connect_retry_interval: Duration,
    pub known_hosts: KnownHostsPolicy,
    pub shell: ShellKind,
}

impl SshOptions {
    pub fn new(target: &str) -> Result<Self, TransportError> {
        Ok(Self {
            target: Target::parse(target)?,
            key_file: None,
            key_dir: None,
            connect_timeout: Duration::from_secs(10),
            connect_retries: 2,
            connect_retry_interval: Duration::from_secs(1),
            known_hosts: KnownHostsPolicy::default(),
            shell: ShellKind::default(),
        })
    }
}
