use std::{fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};
use dutrun_scheduler::RunConfig;
use dutrun_transport::{KnownHostsPolicy, ShellKind, SshOptions};
use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use serde_derive::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DutrunConfig {
    pub ssh: SshConfig,
    pub run: RunConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// `[user@]host[:port]`.
    pub target: String,
    pub key_file: Option<PathBuf>,
    /// Directory scanned for default private keys.
    pub key_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub connect_retries: usize,
    pub connect_retry_interval_secs: u64,
    pub known_hosts: KnownHostsPolicy,
    pub shell: ShellKind,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            key_file: None,
            key_dir: None,
            connect_timeout_secs: 10,
            connect_retries: 2,
            connect_retry_interval_secs: 1,
            known_hosts: KnownHostsPolicy::default(),
            shell: ShellKind::default(),
        }
    }
}

impl SshConfig {
    pub fn options(&self) -> anyhow::Result<SshOptions> {
        if self.target.is_empty() {
            return Err(anyhow!("no DUT given; pass --target or set ssh.target"));
        }
        let mut opts = SshOptions::new(&self.target)?;
        opts.key_file = self.key_file.clone();
        opts.key_dir = self.key_dir.clone().or_else(default_key_dir);
        opts.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        opts.connect_retries = self.connect_retries;
        opts.connect_retry_interval = Duration::from_secs(self.connect_retry_interval_secs);
        opts.known_hosts = self.known_hosts;
        opts.shell = self.shell;
        Ok(opts)
    }
}

fn default_key_dir() -> Option<PathBuf> {
    etcetera::home_dir().ok().map(|home| home.join(".ssh"))
}

pub fn dutrun_config_filepath() -> anyhow::Result<PathBuf> {
    let strategy = app_strategy::Unix::new(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: "dutrun".to_string(),
        app_name: "dutrun".to_string(),
    })?;
    Ok(strategy.config_dir().join("config.toml"))
}

/// Reads the explicit config file, else the default one if it exists, else the defaults.
pub fn read_dutrun_config(explicit: Option<PathBuf>) -> anyhow::Result<DutrunConfig> {
    let path = match explicit {
        Some(path) => path,
        None => match dutrun_config_filepath() {
            Ok(path) if path.exists() => path,
            _ => return Ok(DutrunConfig::default()),
        },
    };
    let toml_str = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = toml::from_str(&toml_str)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}
