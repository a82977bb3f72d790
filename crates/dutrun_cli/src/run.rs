use std::{fs, io, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use dutrun_results::{Diagnoser, ResultsContext, RunState, TerminateReason};
use dutrun_scheduler::{
    diagnose::BootIdDiagnoser,
    fixture_service::{FixtureService, ProcessFixtureService},
    launcher::SshRunnerLauncher,
    outputs::ssh_copy_and_remove,
    ConnectionManager, FixtureGraph, RunConfig, RunOutcome, Scheduler, SshConnectionManager,
};
use dutrun_transport::{connect, Connection, SshOptions};
use dutrun_utils::{cancel::CancelScope, exit::ExitCode};
use futures::StreamExt;
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::{Handle, Signals};
use termcolor::{ColorChoice, StandardStream};
use tokio::task::JoinHandle;

use crate::{
    plan::Plan,
    reporting::{print_summary, ConsoleReportClient, Summary},
};

pub const RESULTS_FILENAME: &str = "results.json";
pub const TIMING_FILENAME: &str = "timing.json";

/// Bound on shutting down the fixture service and the connection once the run is over.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(
    opts: SshOptions,
    config: RunConfig,
    plan: &Path,
    names: &[String],
) -> anyhow::Result<ExitCode> {
    let plan = Plan::read(plan)?;
    let tests = plan.select(names)?;
    let bundles = FixtureGraph::new(&plan.fixtures)?.categorize(&tests)?;
    tracing::info!(tests = tests.len(), bundles = bundles.len(), "loaded plan");

    let scope = CancelScope::new();
    let (signals, signal_task) = cancel_on_signals(scope.clone())?;

    let conns: Arc<dyn ConnectionManager> = Arc::new(
        SshConnectionManager::connect(&scope, opts, config.ping_timeout())
            .await
            .context("failed to connect to DUT")?,
    );
    let diagnoser: Option<Arc<dyn Diagnoser>> =
        match BootIdDiagnoser::new(&scope, conns.clone(), config.ping_timeout()).await {
            Ok(diagnoser) => Some(Arc::new(diagnoser)),
            Err(error) => {
                tracing::warn!(
                    %error,
                    "failed to read DUT boot ID; lost connections will not be diagnosed"
                );
                None
            }
        };

    let client = Arc::new(ConsoleReportClient::new(StandardStream::stdout(ColorChoice::Auto)));
    let mut results = ResultsContext::new(&config.results_dir, client);
    results.max_test_failures = config.max_test_failures;
    results.msg_timeout = config.msg_timeout();
    results.copy_output = Some(ssh_copy_and_remove(conns.clone()));
    results.diagnoser = diagnoser;
    results.max_concurrent_pulls = config.max_concurrent_pulls;

    let mut fixtures = match config.fixture_service.split_first() {
        Some((program, args)) => Some(
            ProcessFixtureService::start(&scope, &Connection::local(), program, args)
                .await
                .context("failed to start fixture service")?,
        ),
        None => None,
    };

    let mut state = RunState::new(&config.results_dir)
        .with_context(|| format!("failed to prepare {}", config.results_dir.display()))?;
    let launcher = Arc::new(SshRunnerLauncher::new(config.local_runner.as_str()));
    let scheduler = Scheduler::new(config.clone(), results, launcher, conns.clone());
    let outcome = scheduler
        .run_local_tests(
            &scope,
            &mut state,
            &bundles,
            fixtures.as_mut().map(|f| f as &mut dyn FixtureService),
        )
        .await;

    let shutdown = CancelScope::new().with_timeout(SHUTDOWN_TIMEOUT);
    if let Some(service) = fixtures {
        if let Err(error) = service.close(&shutdown).await {
            tracing::warn!(%error, "fixture service did not exit cleanly");
        }
    }
    signals.close();
    signal_task.abort();
    if let Err(error) = conns.connection().await.close().await {
        tracing::debug!(%error, "failed to close connection to DUT");
    }

    write_json(&config.results_dir.join(RESULTS_FILENAME), &outcome.results)?;
    write_json(&config.results_dir.join(TIMING_FILENAME), state.timing())?;

    let summary = Summary::new(&outcome.results, &outcome.unstarted);
    print_summary(&mut StandardStream::stdout(ColorChoice::Auto), &summary)?;
    if let Some(error) = &outcome.error {
        tracing::error!(%error, "run ended early");
    }
    tracing::info!(results_dir = %config.results_dir.display(), "results written");
    Ok(exit_code(&outcome))
}

pub async fn ping(opts: SshOptions, timeout: Duration) -> anyhow::Result<ExitCode> {
    let scope = CancelScope::new();
    let conn = connect(&scope, &opts).await?;
    conn.ping(&scope, timeout).await?;
    println!("{} is reachable", opts.target);
    conn.close().await?;
    Ok(ExitCode::SUCCESS)
}

/// Cancels `scope` on the first SIGINT or SIGTERM.
fn cancel_on_signals(scope: CancelScope) -> io::Result<(Handle, JoinHandle<()>)> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let task = tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::warn!(signal, "interrupted; cancelling run");
            scope.cancel();
        }
    });
    Ok((handle, task))
}

fn write_json(path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn exit_code(outcome: &RunOutcome) -> ExitCode {
    let mut code = ExitCode::SUCCESS;
    if outcome.results.iter().any(|r| r.failed() || !r.is_complete()) {
        code = ExitCode::FAILURE;
    }
    match &outcome.error {
        Some(error) => match error.terminate_reason() {
            Some(TerminateReason::MaxFailures(_)) => code.max(ExitCode::FAILURE),
            Some(TerminateReason::ClientRequest) => code,
            None => ExitCode::DUTRUN_ERROR,
        },
        None if !outcome.unstarted.is_empty() => ExitCode::DUTRUN_ERROR,
        None => code,
    }
}
