//! A simulated local test bundle. Launching it runs no process; the control message stream
//! is computed from the bundle's tests and fixtures and written by a background task.

use std::{
    collections::{BTreeMap, HashSet},
    io,
};

use async_trait::async_trait;
use chrono::Utc;
use dutrun_protocol::{
    runner::{fixture_failure_reason, RunnerArgs},
    ControlMessage, ControlWriter, Entity, ErrorInfo,
};
use dutrun_scheduler::launcher::{LaunchError, RunnerLauncher, RunnerOutput, RunnerProcess};
use dutrun_transport::{CmdError, Connection};
use dutrun_utils::{cancel::CancelScope, net_protocol::FrameError};
use parking_lot::Mutex;
use tokio::{io::DuplexStream, task::JoinHandle};

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SimTest {
    pub fixture: String,
    pub errors: Vec<String>,
    pub skip_reasons: Vec<String>,
    /// The runner dies right after starting this test, the first time it runs.
    pub crash_once: bool,
}

impl SimTest {
    pub fn new(fixture: impl Into<String>) -> Self {
        Self {
            fixture: fixture.into(),
            ..Default::default()
        }
    }

    pub fn error(mut self, reason: impl Into<String>) -> Self {
        self.errors.push(reason.into());
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reasons.push(reason.into());
        self
    }

    pub fn crash_once(mut self) -> Self {
        self.crash_once = true;
        self
    }
}

/// Tests and local fixtures of one bundle. Fixtures map to their parent, which is empty or
/// names a fixture outside the bundle.
#[derive(Debug, Clone, Default)]
pub struct SimBundle {
    tests: BTreeMap<String, SimTest>,
    fixtures: BTreeMap<String, String>,
}

impl SimBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn test(mut self, name: impl Into<String>, test: SimTest) -> Self {
        self.tests.insert(name.into(), test);
        self
    }

    pub fn fixture(mut self, name: impl Into<String>, parent: impl Into<String>) -> Self {
        self.fixtures.insert(name.into(), parent.into());
        self
    }

    fn depends_on(&self, fixture: &str, node: &str) -> bool {
        let mut current = fixture;
        loop {
            if current == node {
                return true;
            }
            match self.fixtures.get(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Walks the fixture tree from `node`: the tests directly under it, then each child
    /// fixture in name order.
    fn visit(&self, bundle: &str, node: &str, script: &mut Script<'_>) {
        for (name, test) in &self.tests {
            let wanted = test.fixture == node && script.wanted.contains(name.as_str());
            if wanted && !script.test(bundle, name, test) {
                return;
            }
        }

        for (child, parent) in &self.fixtures {
            if parent != node || script.crashed {
                continue;
            }
            let needed = self.tests.iter().any(|(name, test)| {
                script.wanted.contains(name.as_str()) && self.depends_on(&test.fixture, child)
            });
            if !needed {
                continue;
            }
            if script.emit_fixtures {
                script.push(ControlMessage::EntityStart {
                    time: Utc::now(),
                    info: Entity::fixture(child.as_str(), bundle, parent.as_str()),
                    out_dir: String::new(),
                });
            }
            self.visit(bundle, child, script);
            if script.emit_fixtures && !script.crashed {
                script.push(end(child, vec![]));
            }
        }
    }
}

enum Step {
    Send(ControlMessage),
    Crash,
}

struct Script<'a> {
    steps: Vec<Step>,
    wanted: HashSet<&'a str>,
    start_fixture: &'a str,
    set_up_errors: &'a [String],
    emit_fixtures: bool,
    crashed_before: &'a mut HashSet<String>,
    crashed: bool,
}

impl Script<'_> {
    fn push(&mut self, msg: ControlMessage) {
        self.steps.push(Step::Send(msg));
    }

    /// Returns false once the runner has crashed.
    fn test(&mut self, bundle: &str, name: &str, test: &SimTest) -> bool {
        self.push(ControlMessage::EntityStart {
            time: Utc::now(),
            info: Entity::test(name, bundle, test.fixture.as_str()),
            out_dir: String::new(),
        });

        if test.crash_once && self.crashed_before.insert(name.to_string()) {
            self.steps.push(Step::Crash);
            self.crashed = true;
            return false;
        }

        let errors: Vec<String> = if self.set_up_errors.is_empty() {
            self.push(ControlMessage::EntityLog {
                time: Utc::now(),
                name: name.to_string(),
                text: format!("running {name}"),
            });
            test.errors.clone()
        } else {
            self.set_up_errors
                .iter()
                .map(|e| fixture_failure_reason(self.start_fixture, e))
                .collect()
        };
        for reason in errors {
            self.push(ControlMessage::EntityError {
                time: Utc::now(),
                name: name.to_string(),
                error: ErrorInfo::new(reason),
            });
        }
        let skip_reasons = match self.set_up_errors.is_empty() {
            true => test.skip_reasons.clone(),
            false => vec![],
        };
        self.push(end(name, skip_reasons));
        true
    }
}

fn end(name: &str, skip_reasons: Vec<String>) -> ControlMessage {
    ControlMessage::EntityEnd {
        time: Utc::now(),
        name: name.to_string(),
        skip_reasons,
        deprecated_missing_software_deps: vec![],
        timing_log: None,
    }
}

#[derive(Default)]
struct SimState {
    launches: Vec<RunnerArgs>,
    crashed: HashSet<String>,
}

/// Launches simulated bundles and records every invocation.
#[derive(Default)]
pub struct SimLauncher {
    bundles: BTreeMap<String, SimBundle>,
    state: Mutex<SimState>,
}

impl SimLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bundle(mut self, name: impl Into<String>, bundle: SimBundle) -> Self {
        self.bundles.insert(name.into(), bundle);
        self
    }

    pub fn launches(&self) -> Vec<RunnerArgs> {
        self.state.lock().launches.clone()
    }

    fn script(&self, args: &RunnerArgs) -> Vec<Step> {
        let mut state = self.state.lock();
        state.launches.push(args.clone());

        let Some(bundle) = self.bundles.get(&args.bundle) else {
            return vec![Step::Send(ControlMessage::RunError {
                time: Utc::now(),
                error: ErrorInfo::new(format!("no bundle {}", args.bundle)),
            })];
        };

        let mut script = Script {
            steps: vec![Step::Send(ControlMessage::RunStart {
                time: Utc::now(),
                test_names: args.tests.clone(),
                num_tests: args.tests.len(),
            })],
            wanted: args.tests.iter().map(String::as_str).collect(),
            start_fixture: &args.start_fixture_name,
            set_up_errors: &args.set_up_errors,
            emit_fixtures: args.set_up_errors.is_empty(),
            crashed_before: &mut state.crashed,
            crashed: false,
        };
        bundle.visit(&args.bundle, &args.start_fixture_name, &mut script);
        if !script.crashed {
            script.push(ControlMessage::RunEnd { time: Utc::now() });
        }
        script.steps
    }
}

#[async_trait]
impl RunnerLauncher for SimLauncher {
    async fn launch(
        &self,
        scope: &CancelScope,
        _conn: &Connection,
        args: &RunnerArgs,
    ) -> Result<Box<dyn RunnerProcess>, LaunchError> {
        scope.check()?;
        let steps = self.script(args);
        let (stdout, runner_side) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(play(steps, runner_side));
        Ok(Box::new(SimProcess {
            stdout: Some(stdout),
            task: Some(task),
        }))
    }
}

/// Returns whether the runner crashed.
async fn play(steps: Vec<Step>, out: DuplexStream) -> Result<bool, FrameError> {
    let mut writer = ControlWriter::new(out);
    for step in steps {
        match step {
            Step::Send(msg) => writer.write(&msg).await?,
            Step::Crash => return Ok(true),
        }
    }
    Ok(false)
}

struct SimProcess {
    stdout: Option<DuplexStream>,
    task: Option<JoinHandle<Result<bool, FrameError>>>,
}

#[async_trait]
impl RunnerProcess for SimProcess {
    fn take_stdout(&mut self) -> Option<RunnerOutput> {
        self.stdout
            .take()
            .map(|stdout| Box::new(stdout) as RunnerOutput)
    }

    async fn wait(&mut self, scope: &CancelScope) -> Result<(), LaunchError> {
        let Some(task) = self.task.as_mut() else {
            return Err(LaunchError::Start(CmdError::AlreadyWaited));
        };
        let played = tokio::select! {
            biased;
            cancelled = scope.done() => return Err(cancelled.into()),
            played = task => played,
        };
        self.task = None;

        let failure = |stderr_tail: &str| LaunchError::Runner {
            error: CmdError::Aborted,
            stderr_tail: stderr_tail.to_string(),
        };
        match played {
            Ok(Ok(false)) => Ok(()),
            Ok(Ok(true)) => Err(failure("simulated crash")),
            Ok(Err(error)) => Err(LaunchError::Runner {
                error: CmdError::Io(io::Error::new(io::ErrorKind::BrokenPipe, error.to_string())),
                stderr_tail: String::new(),
            }),
            Err(_) => Err(failure("")),
        }
    }

    fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
