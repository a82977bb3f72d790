mod args;
mod config;
mod logging;
mod plan;
mod reporting;
mod run;

use clap::Parser;
use dutrun_utils::exit::ExitCode;

use args::{Cli, Command};

fn main() {
    let cli = Cli::parse();
    let code = match try_main(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("dutrun: {error:#}");
            ExitCode::DUTRUN_ERROR
        }
    };
    std::process::exit(code.get());
}

fn try_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = config::read_dutrun_config(cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Run {
            target,
            plan,
            results_dir,
            max_test_failures,
            key_file,
            tests,
        } => {
            if let Some(target) = target {
                config.ssh.target = target;
            }
            if let Some(key_file) = key_file {
                config.ssh.key_file = Some(key_file);
            }
            if let Some(results_dir) = results_dir {
                config.run.results_dir = results_dir;
            }
            if let Some(max_test_failures) = max_test_failures {
                config.run.max_test_failures = max_test_failures;
            }

            let _guard = logging::init(Some(&config.run.results_dir))?;
            let opts = config.ssh.options()?;
            runtime.block_on(run::run(opts, config.run, &plan, &tests))
        }
        Command::Ping { target } => {
            if let Some(target) = target {
                config.ssh.target = target;
            }
            let _guard = logging::init(None)?;
            let opts = config.ssh.options()?;
            runtime.block_on(run::ping(opts, config.run.ping_timeout()))
        }
    }
}
