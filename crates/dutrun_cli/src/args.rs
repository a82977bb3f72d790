use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Runs tests on a device under test over SSH.
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Configuration file. Defaults to `config.toml` in the user's dutrun config directory,
    /// if it exists.
    #[clap(long, global = true, env = "DUTRUN_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs tests of a plan on the DUT and writes their results.
    Run {
        /// The DUT, as `[user@]host[:port]`. Overrides the configured target.
        #[clap(long)]
        target: Option<String>,

        /// JSON file listing the tests and fixtures of every bundle.
        #[clap(long, required = true)]
        plan: PathBuf,

        /// Directory for logs, output files and results. Overrides the configured one.
        #[clap(long)]
        results_dir: Option<PathBuf>,

        /// Stop after this many failed tests. 0 means no limit.
        #[clap(long)]
        max_test_failures: Option<usize>,

        /// Private key to authenticate with before any other method.
        #[clap(long)]
        key_file: Option<PathBuf>,

        /// Names of the tests to run. Runs every test of the plan if none are given.
        tests: Vec<String>,
    },
    /// Checks that the DUT is reachable.
    Ping {
        /// The DUT, as `[user@]host[:port]`. Overrides the configured target.
        #[clap(long)]
        target: Option<String>,
    },
}
