//! Turning an argument vector into the single command line a remote shell executes.

use std::{fmt::Debug, sync::Arc};

use serde_derive::{Deserialize, Serialize};

/// Builds the command line that runs `args` in `dir` on the target's shell.
pub trait ShellCommandBuilder: Send + Sync + Debug {
    fn build(&self, dir: Option<&str>, args: &[String]) -> String;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    #[default]
    Posix,
    Plain,
}

impl ShellKind {
    pub fn builder(self) -> Arc<dyn ShellCommandBuilder> {
        match self {
            ShellKind::Posix => Arc::new(PosixShell),
            ShellKind::Plain => Arc::new(PlainShell),
        }
    }
}

/// A POSIX shell. The command replaces the shell via `exec`, so signals and exit statuses
/// reach it directly.
#[derive(Debug, Clone, Copy)]
pub struct PosixShell;

impl ShellCommandBuilder for PosixShell {
    fn build(&self, dir: Option<&str>, args: &[String]) -> String {
        let cmd = format!("exec {}", quote_all(args));
        match dir {
            Some(dir) => format!("cd {} && {}", quote(dir), cmd),
            None => cmd,
        }
    }
}

/// A restricted shell without `exec`.
#[derive(Debug, Clone, Copy)]
pub struct PlainShell;

impl ShellCommandBuilder for PlainShell {
    fn build(&self, dir: Option<&str>, args: &[String]) -> String {
        let cmd = quote_all(args);
        match dir {
            Some(dir) => format!("cd {} && {}", quote(dir), cmd),
            None => cmd,
        }
    }
}

fn quote_all(args: &[String]) -> String {
    args.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" ")
}

/// Quotes `value` for a POSIX shell, leaving it bare when that is unambiguous.
pub fn quote(value: &str) -> String {
    let is_safe = |ch: char| ch.is_ascii_alphanumeric() || "_@%+=:,./-".contains(ch);
    if !value.is_empty() && value.chars().all(is_safe) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}
