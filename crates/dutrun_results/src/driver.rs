use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dutrun_protocol::{timing::TimingLog, ControlMessage, ControlReader};
use dutrun_utils::{cancel::CancelScope, net_protocol::FrameError};
use tokio::{io::AsyncRead, sync::mpsc};

use crate::{
    error::ResultsError,
    puller::CopyAndRemove,
    reducer::Reducer,
    report::ReportClient,
    result::TestResult,
    streamed::{StreamedResultsWriter, STREAMED_RESULTS_FILENAME},
};

pub const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DIAGNOSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_PULLS: usize = 4;

/// Explains a run failure after the fact, typically by probing the DUT.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    /// Returns a human-readable explanation, or [None] if nothing useful was found.
    /// `scratch_dir` is a local directory the diagnoser may write evidence to.
    async fn diagnose(&self, scope: &CancelScope, scratch_dir: &Path) -> Option<String>;
}

/// Read-only configuration of [read_test_output].
#[derive(Clone)]
pub struct ResultsContext {
    pub results_dir: PathBuf,
    /// Stop after this many failed tests. 0 means no limit.
    pub max_test_failures: usize,
    /// How long to wait for any control message before giving up on the runner.
    pub msg_timeout: Duration,
    pub client: Arc<dyn ReportClient>,
    /// Pulls entity output directories off the DUT. [None] leaves them in place.
    pub copy_output: Option<CopyAndRemove>,
    pub diagnoser: Option<Arc<dyn Diagnoser>>,
    pub diagnose_timeout: Duration,
    pub max_concurrent_pulls: usize,
}

impl ResultsContext {
    pub fn new(results_dir: impl Into<PathBuf>, client: Arc<dyn ReportClient>) -> Self {
        Self {
            results_dir: results_dir.into(),
            max_test_failures: 0,
            msg_timeout: DEFAULT_MSG_TIMEOUT,
            client,
            copy_output: None,
            diagnoser: None,
            diagnose_timeout: DEFAULT_DIAGNOSE_TIMEOUT,
            max_concurrent_pulls: DEFAULT_MAX_CONCURRENT_PULLS,
        }
    }
}

impl std::fmt::Debug for ResultsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultsContext")
            .field("results_dir", &self.results_dir)
            .field("max_test_failures", &self.max_test_failures)
            .field("msg_timeout", &self.msg_timeout)
            .field("copy_output", &self.copy_output.is_some())
            .field("diagnoser", &self.diagnoser.is_some())
            .finish()
    }
}

/// State shared by every runner invocation of one run.
#[derive(Debug)]
pub struct RunState {
    pub(crate) results_writer: StreamedResultsWriter,
    /// Times each entity name has started, for output directory suffixes.
    pub(crate) seen_times: HashMap<String, usize>,
    pub(crate) failures: usize,
    pub(crate) timing: TimingLog,
}

impl RunState {
    /// Creates `results_dir` if needed and opens the streamed results file in it.
    pub fn new(results_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(results_dir)?;
        let results_writer =
            StreamedResultsWriter::open(results_dir.join(STREAMED_RESULTS_FILENAME))?;
        Ok(Self {
            results_writer,
            seen_times: HashMap::new(),
            failures: 0,
            timing: TimingLog::new(),
        })
    }

    /// Failed tests so far, across all invocations.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn timing(&self) -> &TimingLog {
        &self.timing
    }
}

/// What one runner invocation produced.
#[derive(Debug)]
pub struct ReadOutcome {
    /// Every test that started, finished or not. Unfinished tests carry a "did not finish"
    /// error.
    pub results: Vec<TestResult>,
    /// Tests the runner announced but never started. [None] if the runner never said which
    /// tests it would run, which is different from `Some(vec![])`.
    pub unstarted_tests: Option<Vec<String>>,
    /// Why the stream ended early, if it did.
    pub error: Option<ResultsError>,
}

impl ReadOutcome {
    pub fn is_terminated(&self) -> bool {
        self.error.as_ref().is_some_and(ResultsError::is_terminated)
    }
}

/// Consumes the control stream of one runner invocation until `RunEnd` and the end of the
/// stream, an error, termination, or cancellation of `scope`.
///
/// Whatever the reason the stream ended, entities still running are closed with an error,
/// and every output pull is awaited before returning, so the results are always complete
/// as far as they go.
pub async fn read_test_output<R>(
    scope: &CancelScope,
    ctx: &ResultsContext,
    state: &mut RunState,
    stream: R,
) -> ReadOutcome
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::channel(64);
    let decoder = tokio::spawn(decode(stream, tx));

    let mut reducer = Reducer::new(ctx, state);
    let error = loop {
        let next = tokio::select! {
            biased;
            reason = scope.done() => break Some(ResultsError::Cancelled(reason)),
            next = rx.recv() => next,
            _ = tokio::time::sleep(ctx.msg_timeout) => {
                // A runner that already ended its run may linger before closing the stream.
                break reducer
                    .check_stream_end()
                    .map(|_| ResultsError::Timeout(ctx.msg_timeout));
            }
        };
        let msg = match next {
            None => break reducer.check_stream_end(),
            Some(Err(error)) => break Some(ResultsError::Read(error)),
            Some(Ok(msg)) => msg,
        };
        tracing::trace!(kind = msg.kind(), "control message");
        if let Err(error) = reducer.handle(msg).await {
            break Some(error);
        }
        if let Some(reason) = reducer.termination() {
            tracing::warn!(%reason, "terminating run");
            break Some(ResultsError::Terminated(reason));
        }
    };
    decoder.abort();

    let error = match error {
        Some(error) if error.is_diagnosable() => Some(diagnose(ctx, &mut reducer, error).await),
        error => error,
    };
    reducer.finish_incomplete(error.as_ref()).await;
    reducer.wait_for_pulls().await;

    let unstarted_tests = reducer.unstarted_tests();
    ReadOutcome {
        results: reducer.into_results(),
        unstarted_tests,
        error,
    }
}

async fn decode<R>(stream: R, tx: mpsc::Sender<Result<ControlMessage, FrameError>>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = ControlReader::new(stream);
    loop {
        let next = match reader.read().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => return,
            Err(error) => Err(error),
        };
        let failed = next.is_err();
        if tx.send(next).await.is_err() || failed {
            return;
        }
    }
}

async fn diagnose(
    ctx: &ResultsContext,
    reducer: &mut Reducer<'_>,
    error: ResultsError,
) -> ResultsError {
    let Some(diagnoser) = &ctx.diagnoser else {
        return error;
    };
    let scratch_dir = reducer
        .last_out_dir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.results_dir.clone());

    // The run scope may be what failed, so diagnosis gets a scope of its own.
    let scope = CancelScope::new().with_timeout(ctx.diagnose_timeout);
    match diagnoser.diagnose(&scope, &scratch_dir).await {
        Some(message) => {
            tracing::warn!(%error, diagnosis = %message, "diagnosed run failure");
            reducer.attach_to_last_started(&message);
            ResultsError::Diagnosed {
                message,
                source: Box::new(error),
            }
        }
        None => error,
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::Cursor,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;
    use dutrun_protocol::{ControlMessage, ControlWriter, Entity, ErrorInfo};
    use dutrun_utils::cancel::CancelScope;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use super::{read_test_output, Diagnoser, ReadOutcome, ResultsContext, RunState};
    use crate::{
        error::{ResultsError, TerminateReason},
        puller::CopyAndRemove,
        report::{NoopReportClient, ReportClient, ReportError},
        result::TestResult,
        streamed::{read_streamed_results, STREAMED_RESULTS_FILENAME},
    };

    #[derive(Default)]
    struct Recorder {
        reported: Mutex<Vec<String>>,
        terminate_after: Option<usize>,
        logs: Mutex<Vec<(PathBuf, SharedLog)>>,
    }

    impl Recorder {
        fn log_paths(&self) -> Vec<PathBuf> {
            self.logs.lock().iter().map(|(path, _)| path.clone()).collect()
        }

        fn log(&self, rel_path: &str) -> String {
            let logs = self.logs.lock();
            let (_, log) = logs
                .iter()
                .find(|(path, _)| path == Path::new(rel_path))
                .unwrap();
            let bytes = log.0.lock().clone();
            String::from_utf8(bytes).unwrap()
        }
    }

    #[derive(Clone, Default)]
    struct SharedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReportClient for Recorder {
        async fn report_result(&self, result: &TestResult) -> Result<(), ReportError> {
            let mut reported = self.reported.lock();
            reported.push(result.name().to_string());
            match self.terminate_after {
                Some(n) if reported.len() >= n => Err(ReportError::Terminate),
                _ => Ok(()),
            }
        }

        fn new_test_log_writer(
            &self,
            _name: &str,
            rel_path: &Path,
        ) -> Box<dyn std::io::Write + Send> {
            let log = SharedLog::default();
            self.logs.lock().push((rel_path.to_path_buf(), log.clone()));
            Box::new(log)
        }
    }

    struct FixedDiagnoser {
        scratch_dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Diagnoser for FixedDiagnoser {
        async fn diagnose(&self, _scope: &CancelScope, scratch_dir: &Path) -> Option<String> {
            self.scratch_dirs.lock().push(scratch_dir.to_path_buf());
            Some("DUT rebooted".to_string())
        }
    }

    fn context(dir: &Path) -> ResultsContext {
        ResultsContext::new(dir, Arc::new(NoopReportClient))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// A stream running `tests` in order, each recording `errors` errors.
    async fn tests_stream(tests: &[&str], errors: usize, run_end: bool) -> Vec<u8> {
        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(tests)).await.unwrap();
        for name in tests {
            w.entity_start(Entity::test(*name, "cros", ""), "").await.unwrap();
            w.entity_log(name, "running").await.unwrap();
            for i in 0..errors {
                w.entity_error(name, ErrorInfo::new(format!("failure {i}")))
                    .await
                    .unwrap();
            }
            w.entity_end(name, vec![], None).await.unwrap();
        }
        if run_end {
            w.run_end().await.unwrap();
        }
        w.into_inner()
    }

    async fn read(ctx: &ResultsContext, state: &mut RunState, bytes: Vec<u8>) -> ReadOutcome {
        read_test_output(&CancelScope::new(), ctx, state, Cursor::new(bytes)).await
    }

    fn reasons(result: &TestResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.error.reason.as_str()).collect()
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn complete_run_produces_results_and_streams_them() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut state = RunState::new(dir.path()).unwrap();

        let bytes = tests_stream(&["pkg.A", "pkg.B"], 0, true).await;
        let outcome = read(&ctx, &mut state, bytes).await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.unstarted_tests, Some(vec![]));
        let got: Vec<_> = outcome.results.iter().map(TestResult::name).collect();
        assert_eq!(got, ["pkg.A", "pkg.B"]);
        assert!(outcome.results.iter().all(TestResult::passed));

        let log = std::fs::read_to_string(dir.path().join("tests/pkg.A/log.txt")).unwrap();
        assert!(log.ends_with(" running\n"), "{log}");

        let streamed = read_streamed_results(&dir.path().join(STREAMED_RESULTS_FILENAME)).unwrap();
        assert_eq!(streamed, outcome.results);
        assert_eq!(state.timing().stages.len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn max_failures_stops_before_the_next_test() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.max_test_failures = 2;
        let mut state = RunState::new(dir.path()).unwrap();

        let bytes = tests_stream(&["pkg.A", "pkg.B", "pkg.C"], 3, true).await;
        let outcome = read(&ctx, &mut state, bytes).await;

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.errors.len() == 3));
        assert!(outcome.is_terminated());
        assert!(matches!(
            outcome.error,
            Some(ResultsError::Terminated(TerminateReason::MaxFailures(2)))
        ));
        assert_eq!(outcome.unstarted_tests, Some(names(&["pkg.C"])));
        assert_eq!(state.failures(), 2);
        assert!(logs_contain("terminating run"));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn client_can_request_termination() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(Recorder {
            terminate_after: Some(1),
            ..Default::default()
        });
        let ctx = ResultsContext::new(dir.path(), client.clone());
        let mut state = RunState::new(dir.path()).unwrap();

        let bytes = tests_stream(&["pkg.A", "pkg.B"], 0, true).await;
        let outcome = read(&ctx, &mut state, bytes).await;

        assert!(matches!(
            outcome.error,
            Some(ResultsError::Terminated(TerminateReason::ClientRequest))
        ));
        assert_eq!(*client.reported.lock(), ["pkg.A"]);
        assert_eq!(outcome.unstarted_tests, Some(names(&["pkg.B"])));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn unfinished_test_is_closed_when_stream_ends() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(Recorder::default());
        let ctx = ResultsContext::new(dir.path(), client.clone());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A", "pkg.B"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        w.entity_log("pkg.A", "halfway").await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        assert!(matches!(outcome.error, Some(ResultsError::StreamClosed)));
        assert_eq!(outcome.results.len(), 1);
        let result = &outcome.results[0];
        assert!(result.end.is_some());
        assert_eq!(
            reasons(result),
            ["Test did not finish: got global error: control stream ended before RunEnd"]
        );
        assert_eq!(*client.reported.lock(), ["pkg.A"]);
        assert_eq!(outcome.unstarted_tests, Some(names(&["pkg.B"])));

        let streamed = read_streamed_results(&dir.path().join(STREAMED_RESULTS_FILENAME)).unwrap();
        assert_eq!(streamed.len(), 1);
        assert!(streamed[0].is_complete());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn silent_runner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.msg_timeout = Duration::from_millis(100);
        let mut state = RunState::new(dir.path()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let mut w = ControlWriter::new(&mut client);
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();

        let outcome = read_test_output(&CancelScope::new(), &ctx, &mut state, server).await;
        drop(client);

        assert!(matches!(outcome.error, Some(ResultsError::Timeout(_))));
        assert!(reasons(&outcome.results[0])[0]
            .starts_with("Test did not finish: got global error: no control message"));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn cancellation_ends_the_loop_without_diagnosis() {
        let dir = tempfile::tempdir().unwrap();
        let diagnoser = Arc::new(FixedDiagnoser {
            scratch_dirs: Mutex::new(vec![]),
        });
        let mut ctx = context(dir.path());
        ctx.diagnoser = Some(diagnoser.clone());
        let mut state = RunState::new(dir.path()).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        ControlWriter::new(&mut client)
            .run_start(names(&["pkg.A"]))
            .await
            .unwrap();

        let scope = CancelScope::new().with_timeout(Duration::from_millis(100));
        let outcome = read_test_output(&scope, &ctx, &mut state, server).await;
        drop(client);

        assert!(matches!(outcome.error, Some(ResultsError::Cancelled(_))));
        assert!(diagnoser.scratch_dirs.lock().is_empty());
        assert_eq!(outcome.unstarted_tests, Some(names(&["pkg.A"])));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn diagnosis_replaces_error_and_is_attached_to_last_test() {
        let dir = tempfile::tempdir().unwrap();
        let diagnoser = Arc::new(FixedDiagnoser {
            scratch_dirs: Mutex::new(vec![]),
        });
        let mut ctx = context(dir.path());
        ctx.diagnoser = Some(diagnoser.clone());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        let error = outcome.error.unwrap();
        assert_eq!(error.to_string(), "DUT rebooted");
        assert!(matches!(
            error,
            ResultsError::Diagnosed { ref source, .. }
                if matches!(**source, ResultsError::StreamClosed)
        ));
        assert_eq!(
            reasons(&outcome.results[0]),
            ["DUT rebooted", "Test did not finish: got global error: DUT rebooted"]
        );
        assert_eq!(*diagnoser.scratch_dirs.lock(), [dir.path().join("tests/pkg.A")]);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn diagnosis_is_attached_to_last_test_after_it_ended() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.diagnoser = Some(Arc::new(FixedDiagnoser {
            scratch_dirs: Mutex::new(vec![]),
        }));
        let mut state = RunState::new(dir.path()).unwrap();

        // pkg.A passes, then the stream drops before RunEnd.
        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A", "pkg.B"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        w.entity_end("pkg.A", vec![], None).await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        assert!(matches!(outcome.error, Some(ResultsError::Diagnosed { .. })));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(reasons(&outcome.results[0]), ["DUT rebooted"]);
        assert_eq!(outcome.unstarted_tests, Some(names(&["pkg.B"])));
        assert_eq!(state.failures(), 0);

        let log = std::fs::read_to_string(dir.path().join("tests/pkg.A/log.txt")).unwrap();
        assert!(log.ends_with(" Error: DUT rebooted\n"), "{log}");
        let streamed = read_streamed_results(&dir.path().join(STREAMED_RESULTS_FILENAME)).unwrap();
        assert_eq!(streamed, outcome.results);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn entity_logs_are_streamed_to_the_client() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(Recorder::default());
        let ctx = ResultsContext::new(dir.path(), client.clone());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        w.entity_log("pkg.A", "first try").await.unwrap();
        w.entity_error("pkg.A", ErrorInfo::new("broken")).await.unwrap();
        w.entity_end("pkg.A", vec![], None).await.unwrap();
        w.run_end().await.unwrap();
        read(&ctx, &mut state, w.into_inner()).await;

        // A retry of the same test in a later invocation gets its own directory.
        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        w.entity_log("pkg.A", "second try").await.unwrap();
        w.entity_end("pkg.A", vec![], None).await.unwrap();
        w.run_end().await.unwrap();
        read(&ctx, &mut state, w.into_inner()).await;

        assert_eq!(
            client.log_paths(),
            [
                PathBuf::from("tests/pkg.A/log.txt"),
                PathBuf::from("tests/pkg.A.1/log.txt"),
            ]
        );
        let first = client.log("tests/pkg.A/log.txt");
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines.len(), 2, "{first}");
        assert!(lines[0].ends_with(" first try"), "{first}");
        assert!(lines[1].ends_with(" Error: broken"), "{first}");
        assert_eq!(
            first,
            std::fs::read_to_string(dir.path().join("tests/pkg.A/log.txt")).unwrap()
        );
        assert!(client.log("tests/pkg.A.1/log.txt").ends_with(" second try\n"));
    }

    #[tokio::test]
    async fn run_error_aborts_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.run_error(ErrorInfo::new("bundle crashed")).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "").await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        assert!(matches!(
            outcome.error,
            Some(ResultsError::Run(ref e)) if e.reason == "bundle crashed"
        ));
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn protocol_violations_are_fatal() {
        async fn outcome_of(script: Vec<ControlMessage>) -> ReadOutcome {
            let dir = tempfile::tempdir().unwrap();
            let ctx = context(dir.path());
            let mut state = RunState::new(dir.path()).unwrap();
            let mut w = ControlWriter::new(Vec::new());
            for msg in &script {
                w.write(msg).await.unwrap();
            }
            read(&ctx, &mut state, w.into_inner()).await
        }
        let now = Utc::now();
        let run_start = ControlMessage::RunStart {
            time: now,
            test_names: names(&["pkg.A"]),
            num_tests: 1,
        };
        let start_a = ControlMessage::EntityStart {
            time: now,
            info: Entity::test("pkg.A", "cros", ""),
            out_dir: String::new(),
        };
        let log_a = ControlMessage::EntityLog {
            time: now,
            name: "pkg.A".into(),
            text: "hi".into(),
        };
        let run_end = ControlMessage::RunEnd { time: now };

        let scripts = vec![
            vec![start_a.clone()],
            vec![run_start.clone(), run_start.clone()],
            vec![run_start.clone(), log_a.clone()],
            vec![run_start.clone(), start_a.clone(), start_a.clone()],
            vec![run_start.clone(), start_a.clone(), run_end.clone()],
            vec![run_start.clone(), run_end.clone(), run_end.clone()],
            vec![run_end.clone()],
        ];
        for script in scripts {
            let kinds: Vec<_> = script.iter().map(ControlMessage::kind).collect();
            let outcome = outcome_of(script).await;
            assert!(
                matches!(outcome.error, Some(ResultsError::Protocol(_))),
                "{kinds:?} gave {:?}",
                outcome.error
            );
        }
    }

    #[tokio::test]
    async fn repeated_names_get_numbered_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut state = RunState::new(dir.path()).unwrap();

        let first = read(&ctx, &mut state, tests_stream(&["pkg.A"], 1, true).await).await;
        let second = read(&ctx, &mut state, tests_stream(&["pkg.A"], 0, true).await).await;

        assert_eq!(first.results[0].out_dir, dir.path().join("tests/pkg.A"));
        assert_eq!(second.results[0].out_dir, dir.path().join("tests/pkg.A.1"));
        assert!(dir.path().join("tests/pkg.A.1/log.txt").exists());
        assert_eq!(state.failures(), 1);

        let streamed = read_streamed_results(&dir.path().join(STREAMED_RESULTS_FILENAME)).unwrap();
        assert_eq!(streamed.len(), 2);
    }

    #[tokio::test]
    async fn legacy_count_leaves_unstarted_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.write(&ControlMessage::RunStart {
            time: Utc::now(),
            test_names: vec![],
            num_tests: 3,
        })
        .await
        .unwrap();
        w.run_end().await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.unstarted_tests, None);
    }

    #[tokio::test]
    async fn fixtures_get_logs_but_no_results() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A"])).await.unwrap();
        w.entity_start(Entity::fixture("chromeLoggedIn", "cros", ""), "")
            .await
            .unwrap();
        w.entity_log("chromeLoggedIn", "logging in").await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", "chromeLoggedIn"), "")
            .await
            .unwrap();
        w.entity_end("pkg.A", vec!["no camera".into()], None).await.unwrap();
        w.entity_end("chromeLoggedIn", vec![], None).await.unwrap();
        w.run_end().await.unwrap();
        let outcome = read(&ctx, &mut state, w.into_inner()).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].skipped());
        assert_eq!(outcome.results[0].skip_reason, "no camera");
        let log =
            std::fs::read_to_string(dir.path().join("fixtures/chromeLoggedIn/log.txt")).unwrap();
        assert!(log.contains("logging in"));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn output_is_pulled_after_entity_end() {
        let dir = tempfile::tempdir().unwrap();
        let pulled = Arc::new(Mutex::new(vec![]));
        let copy: CopyAndRemove = {
            let pulled = pulled.clone();
            Arc::new(move |src: String, dst: PathBuf| {
                pulled.lock().push((src, dst));
                async { Ok::<(), std::io::Error>(()) }.boxed()
            })
        };
        let mut ctx = context(dir.path());
        ctx.copy_output = Some(copy);
        let mut state = RunState::new(dir.path()).unwrap();

        let mut w = ControlWriter::new(Vec::new());
        w.run_start(names(&["pkg.A", "pkg.B"])).await.unwrap();
        w.entity_start(Entity::test("pkg.A", "cros", ""), "/dut/out/pkg.A")
            .await
            .unwrap();
        w.entity_end("pkg.A", vec![], None).await.unwrap();
        w.entity_start(Entity::test("pkg.B", "cros", ""), "").await.unwrap();
        w.entity_end("pkg.B", vec![], None).await.unwrap();
        w.run_end().await.unwrap();
        read(&ctx, &mut state, w.into_inner()).await;

        assert_eq!(
            *pulled.lock(),
            [("/dut/out/pkg.A".to_string(), dir.path().join("tests/pkg.A"))]
        );
    }
}
