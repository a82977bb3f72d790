use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use dutrun_protocol::{fixture::FixtureRequest, runner::RunnerArgs, BundleEntity};
use dutrun_results::{ResultsContext, RunState, TerminateReason, TestResult};
use dutrun_scheduler::{
    fixture_service::FixtureService,
    launcher::{LaunchError, RunnerLauncher, RunnerProcess},
    BundleTests, FixtureGraph, RunConfig, RunOutcome, Scheduler, SchedulerError,
};
use dutrun_test_utils::{
    local_fixture, local_test, remote_fixture, CountingConnectionManager, FakeFixtureService,
    RecordingReportClient, SimBundle, SimLauncher, SimTest,
};
use dutrun_transport::Connection;
use dutrun_utils::cancel::{CancelScope, Cancelled};
use tracing_test::traced_test;

struct Harness {
    config: RunConfig,
    client: Arc<RecordingReportClient>,
    launcher: Arc<SimLauncher>,
    conns: Arc<CountingConnectionManager>,
}

impl Harness {
    fn new(launcher: SimLauncher) -> Self {
        Self {
            config: RunConfig::default(),
            client: Arc::new(RecordingReportClient::new()),
            launcher: Arc::new(launcher),
            conns: Arc::new(CountingConnectionManager::new()),
        }
    }

    async fn run(
        &self,
        results_dir: &Path,
        bundles: &[BundleTests],
        fixtures: Option<&mut dyn FixtureService>,
    ) -> RunOutcome {
        let mut results = ResultsContext::new(results_dir, self.client.clone());
        results.max_test_failures = self.config.max_test_failures;
        let scheduler = Scheduler::new(
            self.config.clone(),
            results,
            self.launcher.clone(),
            self.conns.clone(),
        );
        let mut state = RunState::new(results_dir).unwrap();
        scheduler
            .run_local_tests(&CancelScope::new(), &mut state, bundles, fixtures)
            .await
    }
}

fn categorize(fixtures: &[BundleEntity], tests: &[BundleEntity]) -> Vec<BundleTests> {
    FixtureGraph::new(fixtures)
        .unwrap()
        .categorize(tests)
        .unwrap()
}

fn names(results: &[TestResult]) -> Vec<&str> {
    results.iter().map(TestResult::name).collect()
}

fn reasons(result: &TestResult) -> Vec<&str> {
    result
        .errors
        .iter()
        .map(|e| e.error.reason.as_str())
        .collect()
}

fn flat_bundle(tests: &[(&str, SimTest)]) -> (SimLauncher, Vec<BundleTests>) {
    let mut bundle = SimBundle::new();
    let mut plan = vec![];
    for (name, test) in tests {
        bundle = bundle.test(*name, test.clone());
        plan.push(local_test("cros", name, ""));
    }
    let launcher = SimLauncher::new().bundle("cros", bundle);
    (launcher, categorize(&[], &plan))
}

#[tokio::test]
#[traced_test]
async fn remote_fixtures_wrap_their_groups() {
    let fixtures = vec![
        local_fixture("cros", "fixt1B", "remoteFixt"),
        local_fixture("cros", "fixt2", "failFixt"),
        local_fixture("cros", "fixt3A", "localFixt"),
        local_fixture("cros", "fixt3B", ""),
        local_fixture("cros", "localFixt", ""),
        remote_fixture("cros", "remoteFixt"),
        remote_fixture("cros", "failFixt"),
        remote_fixture("cros", "tearDownFailFixt"),
    ];
    let tests = vec![
        local_test("cros", "pkg.Test1A", "remoteFixt"),
        local_test("cros", "pkg.Test1B", "fixt1B"),
        local_test("cros", "pkg.Test2", "fixt2"),
        local_test("cros", "pkg.Test3A", "fixt3A"),
        local_test("cros", "pkg.Test3B", "fixt3B"),
        local_test("cros", "pkg.Test3C", ""),
        local_test("cros", "pkg.Test4", "tearDownFailFixt"),
    ];

    let mut bundle = SimBundle::new();
    for f in fixtures.iter().filter(|f| f.is_local()) {
        bundle = bundle.fixture(f.entity.name.as_str(), f.entity.fixture.as_str());
    }
    for t in &tests {
        bundle = bundle.test(t.entity.name.as_str(), SimTest::new(t.entity.fixture.as_str()));
    }
    let harness = Harness::new(SimLauncher::new().bundle("cros", bundle));
    let mut service = FakeFixtureService::new()
        .fail_set_up("failFixt", "Whoa")
        .fail_tear_down("tearDownFailFixt", "Oops");

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness
        .run(dir.path(), &categorize(&fixtures, &tests), Some(&mut service))
        .await;

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(
        names(&outcome.results),
        [
            "pkg.Test3C",
            "pkg.Test3B",
            "pkg.Test3A",
            "pkg.Test2",
            "pkg.Test1A",
            "pkg.Test1B",
            "pkg.Test4",
        ]
    );
    for result in &outcome.results {
        match result.name() {
            "pkg.Test2" => assert_eq!(reasons(result), ["[Fixture failure] failFixt: Whoa"]),
            _ => assert!(result.passed(), "{} failed: {:?}", result.name(), reasons(result)),
        }
    }
    assert_eq!(harness.client.reported_names().len(), 7);

    let pushed: Vec<&str> = service
        .requests()
        .iter()
        .map(|r| match r {
            FixtureRequest::Push { name, .. } => name.as_str(),
            FixtureRequest::Pop => "pop",
        })
        .collect();
    assert_eq!(
        pushed,
        ["failFixt", "pop", "remoteFixt", "pop", "tearDownFailFixt", "pop"]
    );
    assert!(service.stack().is_empty());
    match &service.requests()[0] {
        FixtureRequest::Push { config, .. } => {
            assert_eq!(
                Path::new(&config.out_dir),
                dir.path().join("remote_fixtures").join("failFixt")
            );
            assert_eq!(config.target, "localhost");
        }
        other => panic!("unexpected request {other:?}"),
    }

    let launches = harness.launcher.launches();
    assert_eq!(launches.len(), 4);
    assert_eq!(launches[1].start_fixture_name, "failFixt");
    assert_eq!(launches[1].set_up_errors, ["Whoa"]);
    assert!(launches[2].set_up_errors.is_empty());
    assert!(logs_contain("Oops"));
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn failure_limit_stops_the_run() {
    let broken = SimTest::new("").error("one").error("two").error("three");
    let (launcher, plan) = flat_bundle(&[
        ("pkg.A", broken.clone()),
        ("pkg.B", broken.clone()),
        ("pkg.C", broken),
    ]);
    let mut harness = Harness::new(launcher);
    harness.config.max_test_failures = 2;

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness.run(dir.path(), &plan, None).await;

    assert_eq!(names(&outcome.results), ["pkg.A", "pkg.B"]);
    assert_eq!(reasons(&outcome.results[1]), ["one", "two", "three"]);
    assert_eq!(outcome.unstarted, ["pkg.C"]);
    let error = outcome.error.unwrap();
    assert_eq!(error.terminate_reason(), Some(TerminateReason::MaxFailures(2)));
    assert_eq!(harness.launcher.launches().len(), 1);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn client_can_stop_the_run() {
    let (launcher, plan) = flat_bundle(&[
        ("pkg.A", SimTest::new("")),
        ("pkg.B", SimTest::new("")),
    ]);
    let mut harness = Harness::new(launcher);
    harness.client = Arc::new(RecordingReportClient::terminate_after(1));

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness.run(dir.path(), &plan, None).await;

    assert_eq!(names(&outcome.results), ["pkg.A"]);
    assert_eq!(
        outcome.error.unwrap().terminate_reason(),
        Some(TerminateReason::ClientRequest)
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn crashed_runner_is_retried_with_unstarted_tests() {
    let (launcher, plan) = flat_bundle(&[
        ("pkg.A", SimTest::new("")),
        ("pkg.B", SimTest::new("").crash_once()),
        ("pkg.C", SimTest::new("")),
    ]);
    let harness = Harness::new(launcher);

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness.run(dir.path(), &plan, None).await;

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(names(&outcome.results), ["pkg.A", "pkg.B", "pkg.C"]);
    let crashed = &outcome.results[1];
    assert!(reasons(crashed)[0].starts_with("Test did not finish"));
    assert!(outcome.results[2].passed());

    let launches: Vec<Vec<String>> = harness
        .launcher
        .launches()
        .into_iter()
        .map(|a| a.tests)
        .collect();
    assert_eq!(launches, [vec!["pkg.A", "pkg.B", "pkg.C"], vec!["pkg.C"]]);
    assert_eq!(harness.conns.checks(), 2);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn retries_are_bounded() {
    let (launcher, plan) = flat_bundle(&[
        ("pkg.A", SimTest::new("").crash_once()),
        ("pkg.B", SimTest::new("")),
    ]);
    let mut harness = Harness::new(launcher);
    harness.config.max_attempts = 1;

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness.run(dir.path(), &plan, None).await;

    assert_eq!(names(&outcome.results), ["pkg.A"]);
    assert_eq!(outcome.unstarted, ["pkg.B"]);
    match outcome.error.unwrap() {
        SchedulerError::Incomplete {
            bundle, attempts, ..
        } => {
            assert_eq!(bundle, "cros");
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn unreachable_dut_stops_before_launching() {
    let (launcher, plan) = flat_bundle(&[("pkg.A", SimTest::new(""))]);
    let mut harness = Harness::new(launcher);
    harness.conns = Arc::new(CountingConnectionManager::fail_after(0));

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness.run(dir.path(), &plan, None).await;

    assert!(matches!(outcome.error, Some(SchedulerError::Connection(_))));
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.unstarted, ["pkg.A"]);
    assert!(harness.launcher.launches().is_empty());
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn remote_fixture_without_service_fails_its_tests() {
    let fixtures = vec![remote_fixture("cros", "remoteFixt")];
    let tests = vec![local_test("cros", "pkg.A", "remoteFixt")];
    let bundle = SimBundle::new().test("pkg.A", SimTest::new("remoteFixt"));
    let harness = Harness::new(SimLauncher::new().bundle("cros", bundle));

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness
        .run(dir.path(), &categorize(&fixtures, &tests), None)
        .await;

    assert!(outcome.is_complete(), "{:?}", outcome.error);
    assert_eq!(
        reasons(&outcome.results[0]),
        ["[Fixture failure] remoteFixt: no fixture service to set up remote fixtures"]
    );
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn lost_fixture_service_on_pop_fails_the_run() {
    let fixtures = vec![remote_fixture("cros", "remoteFixt")];
    let tests = vec![local_test("cros", "pkg.A", "remoteFixt")];
    let bundle = SimBundle::new().test("pkg.A", SimTest::new("remoteFixt"));
    let harness = Harness::new(SimLauncher::new().bundle("cros", bundle));
    let mut service = FakeFixtureService::new().hang_up_after(1);

    let dir = tempfile::tempdir().unwrap();
    let outcome = harness
        .run(dir.path(), &categorize(&fixtures, &tests), Some(&mut service))
        .await;

    assert_eq!(names(&outcome.results), ["pkg.A"]);
    assert!(outcome.results[0].passed());
    match outcome.error.unwrap() {
        SchedulerError::FixtureService { fixture, .. } => assert_eq!(fixture, "remoteFixt"),
        other => panic!("unexpected error {other:?}"),
    }
}

/// Cancels the run instead of launching anything, like an interrupt arriving mid-launch.
struct CancellingLauncher;

#[async_trait]
impl RunnerLauncher for CancellingLauncher {
    async fn launch(
        &self,
        scope: &CancelScope,
        _conn: &Connection,
        _args: &RunnerArgs,
    ) -> Result<Box<dyn RunnerProcess>, LaunchError> {
        scope.cancel();
        Err(LaunchError::Cancelled(Cancelled::Cancelled))
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn cancelled_run_still_pops_its_remote_fixture() {
    let fixtures = vec![remote_fixture("cros", "remoteFixt")];
    let tests = vec![local_test("cros", "pkg.A", "remoteFixt")];
    let mut service = FakeFixtureService::new();

    let dir = tempfile::tempdir().unwrap();
    let results = ResultsContext::new(dir.path(), Arc::new(RecordingReportClient::new()));
    let scheduler = Scheduler::new(
        RunConfig::default(),
        results,
        Arc::new(CancellingLauncher),
        Arc::new(CountingConnectionManager::new()),
    );
    let mut state = RunState::new(dir.path()).unwrap();
    let scope = CancelScope::new();
    let outcome = scheduler
        .run_local_tests(
            &scope,
            &mut state,
            &categorize(&fixtures, &tests),
            Some(&mut service),
        )
        .await;

    assert!(scope.is_done());
    assert!(outcome.error.unwrap().is_cancelled());
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.unstarted, ["pkg.A"]);
    assert!(matches!(
        service.requests(),
        [FixtureRequest::Push { .. }, FixtureRequest::Pop]
    ));
    assert!(service.stack().is_empty());
}
