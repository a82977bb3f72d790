//! Running categorized local tests: one runner invocation per fixture group, wrapped in a
//! push and a pop of the group's remote fixture, retried for tests that never started.

use std::{collections::HashSet, sync::Arc, time::Duration};

use dutrun_protocol::{fixture::FixtureConfig, runner::RunnerArgs};
use dutrun_results::{read_test_output, ResultsContext, RunState, TestResult};
use dutrun_transport::Connection;
use dutrun_utils::cancel::CancelScope;

use crate::{
    config::RunConfig,
    connection::ConnectionManager,
    error::SchedulerError,
    fixture_service::{pop_fixture, push_fixture, FixtureService, FixtureServiceError},
    fixtures::{BundleTests, FixtureGroup},
    launcher::{LaunchError, RunnerLauncher},
};

const ABORTED_RUNNER_WAIT: Duration = Duration::from_secs(5);
/// Bound on tearing down a remote fixture. The pop runs even after the run is cancelled.
const POP_TIMEOUT: Duration = Duration::from_secs(60);

/// What a run produced, however far it got.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub results: Vec<TestResult>,
    /// Tests of the plan that never started.
    pub unstarted: Vec<String>,
    pub error: Option<SchedulerError>,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.unstarted.is_empty()
    }
}

/// One runner invocation.
struct Attempt {
    results: Vec<TestResult>,
    unstarted: Option<Vec<String>>,
    error: Option<SchedulerError>,
}

impl Attempt {
    fn failed_to_launch(args: &RunnerArgs, error: LaunchError) -> Self {
        Self {
            results: vec![],
            unstarted: Some(args.tests.clone()),
            error: Some(error.into()),
        }
    }
}

pub struct Scheduler {
    config: RunConfig,
    results: ResultsContext,
    launcher: Arc<dyn RunnerLauncher>,
    conns: Arc<dyn ConnectionManager>,
}

impl Scheduler {
    pub fn new(
        config: RunConfig,
        results: ResultsContext,
        launcher: Arc<dyn RunnerLauncher>,
        conns: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            config,
            results,
            launcher,
            conns,
        }
    }

    /// Runs every group of every bundle in order. The first error that cannot be retried
    /// away, including reaching the failure limit, stops the run; results gathered so far
    /// are still returned.
    pub async fn run_local_tests(
        &self,
        scope: &CancelScope,
        state: &mut RunState,
        bundles: &[BundleTests],
        mut fixtures: Option<&mut dyn FixtureService>,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        'bundles: for bundle in bundles {
            tracing::info!(bundle = %bundle.bundle, tests = bundle.num_tests(), "running bundle");
            for group in &bundle.groups {
                let service: Option<&mut dyn FixtureService> = match &mut fixtures {
                    Some(service) => Some(&mut **service),
                    None => None,
                };
                let ran = self
                    .run_group(
                        scope,
                        state,
                        &bundle.bundle,
                        group,
                        service,
                        &mut outcome.results,
                    )
                    .await;
                if let Err(error) = ran {
                    tracing::error!(bundle = %bundle.bundle, %error, "stopping run");
                    outcome.error = Some(error);
                    break 'bundles;
                }
            }
        }

        let started: HashSet<&str> = outcome.results.iter().map(TestResult::name).collect();
        let unstarted = bundles
            .iter()
            .flat_map(|b| &b.groups)
            .flat_map(|g| &g.tests)
            .filter(|t| !started.contains(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect();
        outcome.unstarted = unstarted;
        outcome
    }

    async fn run_group(
        &self,
        scope: &CancelScope,
        state: &mut RunState,
        bundle: &str,
        group: &FixtureGroup,
        fixtures: Option<&mut dyn FixtureService>,
        results: &mut Vec<TestResult>,
    ) -> Result<(), SchedulerError> {
        let fixture = group.remote_fixture.as_str();
        if fixture.is_empty() {
            return self
                .run_with_retry(scope, state, bundle, group, vec![], results)
                .await;
        }

        let Some(service) = fixtures else {
            let error = "no fixture service to set up remote fixtures".to_string();
            tracing::warn!(%fixture, "{error}");
            return self
                .run_with_retry(scope, state, bundle, group, vec![error], results)
                .await;
        };

        let config = self.fixture_config(fixture).await;
        let set_up_errors = match push_fixture(scope, service, fixture, config).await {
            Ok(errors) => errors,
            Err(error @ FixtureServiceError::Cancelled(_)) => {
                return Err(SchedulerError::FixtureService {
                    fixture: fixture.to_string(),
                    source: error,
                })
            }
            Err(error) => {
                tracing::warn!(%fixture, %error, "failed to push remote fixture");
                vec![error.to_string()]
            }
        };

        let ran = self
            .run_with_retry(scope, state, bundle, group, set_up_errors, results)
            .await;

        let pop_scope = CancelScope::new().with_timeout(POP_TIMEOUT);
        match pop_fixture(&pop_scope, service, fixture).await {
            Ok(errors) => {
                for error in errors {
                    tracing::warn!(%fixture, %error, "remote fixture failed to tear down");
                }
            }
            Err(error) => {
                tracing::warn!(%fixture, %error, "failed to pop remote fixture");
                if ran.is_ok() {
                    return Err(SchedulerError::FixtureService {
                        fixture: fixture.to_string(),
                        source: error,
                    });
                }
            }
        }
        ran
    }

    async fn run_with_retry(
        &self,
        scope: &CancelScope,
        state: &mut RunState,
        bundle: &str,
        group: &FixtureGroup,
        set_up_errors: Vec<String>,
        results: &mut Vec<TestResult>,
    ) -> Result<(), SchedulerError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut remaining: Vec<String> = group.tests.iter().map(|t| t.name.clone()).collect();
        let mut attempt = 0;

        loop {
            attempt += 1;
            scope.check()?;
            // The fixture just pushed, or the failed attempt, may have disrupted the DUT.
            let conn = self.conns.reconnect_if_needed(scope).await?;

            let args = RunnerArgs {
                bundle: bundle.to_string(),
                tests: remaining.clone(),
                start_fixture_name: group.remote_fixture.clone(),
                set_up_errors: set_up_errors.clone(),
                out_dir: self.config.dut_out_dir.clone(),
                heartbeat_interval_secs: self.config.heartbeat_interval_secs,
            };
            tracing::debug!(
                %bundle,
                fixture = %group.remote_fixture,
                attempt,
                tests = args.tests.len(),
                "running tests"
            );

            let outcome = self.run_once(scope, state, &conn, &args).await;
            results.extend(outcome.results);
            let Some(error) = outcome.error else {
                return Ok(());
            };
            if error.is_terminated() || error.is_cancelled() {
                return Err(error);
            }

            remaining = match outcome.unstarted {
                None => return Err(error),
                Some(unstarted) if unstarted.is_empty() => {
                    tracing::warn!(%bundle, %error, "test runner failed after starting every test");
                    return Ok(());
                }
                Some(unstarted) => unstarted,
            };
            if attempt >= max_attempts {
                return Err(SchedulerError::Incomplete {
                    bundle: bundle.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            }
            tracing::warn!(
                %bundle,
                attempt,
                unstarted = remaining.len(),
                %error,
                "retrying unstarted tests"
            );
        }
    }

    async fn run_once(
        &self,
        scope: &CancelScope,
        state: &mut RunState,
        conn: &Connection,
        args: &RunnerArgs,
    ) -> Attempt {
        let mut process = match self.launcher.launch(scope, conn, args).await {
            Ok(process) => process,
            Err(error) => return Attempt::failed_to_launch(args, error),
        };
        let Some(stdout) = process.take_stdout() else {
            process.abort();
            return Attempt::failed_to_launch(args, LaunchError::NoOutput);
        };

        let read = read_test_output(scope, &self.results, state, stdout).await;

        let error = match read.error {
            Some(error) => {
                process.abort();
                let cleanup = CancelScope::new().with_timeout(ABORTED_RUNNER_WAIT);
                if let Err(wait_error) = process.wait(&cleanup).await {
                    tracing::debug!(%wait_error, "aborted test runner");
                }
                Some(error.into())
            }
            None => process.wait(scope).await.err().map(SchedulerError::from),
        };

        Attempt {
            results: read.results,
            unstarted: read.unstarted_tests,
            error,
        }
    }

    async fn fixture_config(&self, fixture: &str) -> FixtureConfig {
        let conn = self.conns.connection().await;
        FixtureConfig {
            out_dir: self
                .results
                .results_dir
                .join("remote_fixtures")
                .join(fixture)
                .to_string_lossy()
                .into_owned(),
            target: conn.target().to_string(),
            vars: self.config.vars.clone(),
        }
    }
}
