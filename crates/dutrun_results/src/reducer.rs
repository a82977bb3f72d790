//! Per-invocation reducer state.
//!
//! Every mutation happens from the single message loop in [crate::read_test_output], one
//! message at a time, so none of this state is shared or locked. Only output pulls run
//! concurrently, and they own everything they touch.

use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use dutrun_protocol::{
    message::format_log_time, timing::Stage, timing::TimingLog, ControlMessage, Entity,
    EntityType, ErrorInfo,
};
use dutrun_utils::log_assert;

use crate::{
    driver::{ResultsContext, RunState},
    error::{ResultsError, TerminateReason},
    puller::OutputPuller,
    report::ReportError,
    result::{ResultError, TestResult},
};

pub(crate) const LOG_FILENAME: &str = "log.txt";

/// An entity between its `EntityStart` and `EntityEnd`.
struct EntityState {
    entity: Entity,
    /// Index into [Reducer::results], for tests.
    result: Option<usize>,
    log_file: File,
    log_path: PathBuf,
    stream_log: Box<dyn Write + Send>,
    /// Output directory on the DUT.
    intermediate_out_dir: String,
    /// Output directory on this host.
    final_out_dir: PathBuf,
    stage: Option<Stage>,
}

impl EntityState {
    fn log(&mut self, time: DateTime<Utc>, text: &str) {
        let line = format!("{} {}\n", format_log_time(time), text);
        if let Err(error) = self.log_file.write_all(line.as_bytes()) {
            tracing::warn!(entity = %self.entity.name, %error, "failed to write entity log");
        }
        if let Err(error) = self.stream_log.write_all(line.as_bytes()) {
            tracing::debug!(entity = %self.entity.name, %error, "failed to stream entity log");
        }
    }
}

pub(crate) struct Reducer<'a> {
    ctx: &'a ResultsContext,
    state: &'a mut RunState,
    puller: Option<OutputPuller>,

    run_start: Option<DateTime<Utc>>,
    run_end: Option<DateTime<Utc>>,
    num_tests: usize,
    /// Tests the runner announced, or [None] if it only sent a count.
    tests_to_run: Option<Vec<String>>,
    started: HashSet<String>,

    results: Vec<TestResult>,
    currents: HashMap<String, EntityState>,
    last_out_dir: Option<PathBuf>,
    /// Index into [Reducer::results] of the entity that started last, if it is a test.
    last_result: Option<usize>,
    terminated: Option<TerminateReason>,
}

impl<'a> Reducer<'a> {
    pub(crate) fn new(ctx: &'a ResultsContext, state: &'a mut RunState) -> Self {
        let puller = ctx
            .copy_output
            .clone()
            .map(|copy| OutputPuller::new(copy, ctx.max_concurrent_pulls));
        Self {
            ctx,
            state,
            puller,
            run_start: None,
            run_end: None,
            num_tests: 0,
            tests_to_run: None,
            started: HashSet::new(),
            results: vec![],
            currents: HashMap::new(),
            last_out_dir: None,
            last_result: None,
            terminated: None,
        }
    }

    pub(crate) async fn handle(&mut self, msg: ControlMessage) -> Result<(), ResultsError> {
        match msg {
            ControlMessage::RunStart {
                time,
                test_names,
                num_tests,
            } => self.run_start(time, test_names, num_tests),
            ControlMessage::RunLog { time: _, text } => {
                tracing::info!("{text}");
                Ok(())
            }
            ControlMessage::RunError { time: _, error } => Err(ResultsError::Run(error)),
            ControlMessage::EntityStart {
                time,
                info,
                out_dir,
            } => self.entity_start(time, info, out_dir),
            ControlMessage::EntityLog { time, name, text } => self.entity_log(time, &name, &text),
            ControlMessage::EntityError { time, name, error } => {
                self.entity_error(time, &name, error)
            }
            ControlMessage::EntityEnd {
                time,
                name,
                skip_reasons,
                deprecated_missing_software_deps,
                timing_log,
            } => {
                let state = self.currents.remove(&name).ok_or_else(|| {
                    ResultsError::Protocol(format!("EntityEnd for {name} without EntityStart"))
                })?;
                let skip_reason = skip_reason(&skip_reasons, &deprecated_missing_software_deps);
                self.finish_entity(state, time, skip_reason, timing_log).await
            }
            ControlMessage::RunEnd { time } => self.run_end(time),
            ControlMessage::Heartbeat { .. } => Ok(()),
        }
    }

    fn run_start(
        &mut self,
        time: DateTime<Utc>,
        test_names: Vec<String>,
        num_tests: usize,
    ) -> Result<(), ResultsError> {
        if self.run_start.is_some() {
            return Err(ResultsError::Protocol("multiple RunStart messages".into()));
        }
        self.run_start = Some(time);
        if test_names.is_empty() {
            self.num_tests = num_tests;
        } else {
            self.num_tests = test_names.len();
            self.tests_to_run = Some(test_names);
        }
        tracing::info!(num_tests = self.num_tests, "run started");
        Ok(())
    }

    fn run_end(&mut self, time: DateTime<Utc>) -> Result<(), ResultsError> {
        if self.run_start.is_none() {
            return Err(ResultsError::Protocol("RunEnd without RunStart".into()));
        }
        if self.run_end.is_some() {
            return Err(ResultsError::Protocol("multiple RunEnd messages".into()));
        }
        if !self.currents.is_empty() {
            return Err(ResultsError::Protocol(format!(
                "RunEnd while {} still running",
                self.current_names().join(", ")
            )));
        }
        self.run_end = Some(time);
        tracing::info!("run ended");
        Ok(())
    }

    fn entity_start(
        &mut self,
        time: DateTime<Utc>,
        entity: Entity,
        out_dir: String,
    ) -> Result<(), ResultsError> {
        if self.run_start.is_none() {
            return Err(ResultsError::Protocol(format!(
                "EntityStart for {} without RunStart",
                entity.name
            )));
        }
        if self.currents.contains_key(&entity.name) {
            return Err(ResultsError::Protocol(format!(
                "EntityStart for {} while it is already running",
                entity.name
            )));
        }

        let rel_dir = self.next_rel_dir(&entity);
        let final_out_dir = self.ctx.results_dir.join(&rel_dir);
        std::fs::create_dir_all(&final_out_dir)?;
        let log_path = final_out_dir.join(LOG_FILENAME);
        let log_file = File::create(&log_path)?;
        let stream_log = self
            .ctx
            .client
            .new_test_log_writer(&entity.name, &rel_dir.join(LOG_FILENAME));

        let result = if entity.is_test() {
            let result = TestResult::started(entity.clone(), time, final_out_dir.clone());
            self.state.results_writer.write(&result)?;
            self.results.push(result);
            Some(self.results.len() - 1)
        } else {
            None
        };
        let stage = entity
            .is_test()
            .then(|| Stage::start(entity.name.clone(), time));

        tracing::info!(entity = %entity.name, kind = ?entity.entity_type, "started");
        self.started.insert(entity.name.clone());
        self.last_out_dir = Some(final_out_dir.clone());
        self.last_result = result;
        self.currents.insert(
            entity.name.clone(),
            EntityState {
                entity,
                result,
                log_file,
                log_path,
                stream_log,
                intermediate_out_dir: out_dir,
                final_out_dir,
                stage,
            },
        );
        Ok(())
    }

    /// `tests/<name>` or `fixtures/<name>`, suffixed with `.<n>` when the name was seen
    /// `n` times before in this run.
    fn next_rel_dir(&mut self, entity: &Entity) -> PathBuf {
        let kind = match entity.entity_type {
            EntityType::Test => "tests",
            EntityType::Fixture => "fixtures",
        };
        let seen = self
            .state
            .seen_times
            .entry(entity.name.clone())
            .or_insert(0);
        let dir_name = match *seen {
            0 => entity.name.clone(),
            n => format!("{}.{}", entity.name, n),
        };
        *seen += 1;
        Path::new(kind).join(dir_name)
    }

    fn entity_log(
        &mut self,
        time: DateTime<Utc>,
        name: &str,
        text: &str,
    ) -> Result<(), ResultsError> {
        let state = self.currents.get_mut(name).ok_or_else(|| {
            ResultsError::Protocol(format!("EntityLog for {name} without EntityStart"))
        })?;
        tracing::debug!(entity = %name, "{text}");
        state.log(time, text);
        Ok(())
    }

    fn entity_error(
        &mut self,
        time: DateTime<Utc>,
        name: &str,
        error: ErrorInfo,
    ) -> Result<(), ResultsError> {
        let state = self.currents.get_mut(name).ok_or_else(|| {
            ResultsError::Protocol(format!("EntityError for {name} without EntityStart"))
        })?;
        tracing::info!(entity = %name, error = %error, "entity error");
        record_error(&mut self.results, state, time, error);
        Ok(())
    }

    async fn finish_entity(
        &mut self,
        mut state: EntityState,
        time: DateTime<Utc>,
        skip_reason: String,
        timing_log: Option<TimingLog>,
    ) -> Result<(), ResultsError> {
        if let Some(mut stage) = state.stage.take() {
            if let Some(timing_log) = timing_log {
                stage.import(timing_log);
            }
            stage.finish(time);
            self.state.timing.push(stage);
        }

        if !skip_reason.is_empty() {
            state.log(time, &format!("Skipped: {skip_reason}"));
        }
        tracing::info!(entity = %state.entity.name, %skip_reason, "finished");

        if let Some(index) = state.result {
            let result = &mut self.results[index];
            result.end = Some(time);
            result.skip_reason = skip_reason;
            if result.failed() {
                self.state.failures += 1;
            }
            let result = result.clone();

            match self.ctx.client.report_result(&result).await {
                Ok(()) => {}
                Err(ReportError::Terminate) => {
                    self.terminated = Some(TerminateReason::ClientRequest);
                }
                Err(ReportError::Failed(reason)) => return Err(ResultsError::Report(reason)),
            }
            self.state.results_writer.update(&result)?;
        }

        if let Some(puller) = &mut self.puller {
            if !state.intermediate_out_dir.is_empty() {
                puller.pull(
                    state.entity.name.clone(),
                    state.intermediate_out_dir.clone(),
                    state.final_out_dir.clone(),
                    state.log_path.clone(),
                );
            }
        }
        Ok(())
    }

    /// Whether the run should stop after the message just handled.
    pub(crate) fn termination(&self) -> Option<TerminateReason> {
        if let Some(reason) = self.terminated {
            return Some(reason);
        }
        let max = self.ctx.max_test_failures;
        (max > 0 && self.state.failures >= max).then_some(TerminateReason::MaxFailures(max))
    }

    /// The error for a stream that ended, if it ended too early.
    pub(crate) fn check_stream_end(&self) -> Option<ResultsError> {
        match self.run_end {
            Some(_) => None,
            None => Some(ResultsError::StreamClosed),
        }
    }

    pub(crate) fn last_out_dir(&self) -> Option<&Path> {
        self.last_out_dir.as_deref()
    }

    /// Attaches `reason` to the entity that started last. A test that already ended gets the
    /// error appended to its result, log and streamed record, without counting as a new
    /// failure.
    pub(crate) fn attach_to_last_started(&mut self, reason: &str) {
        let time = Utc::now();
        let last = self.last_out_dir.clone();
        let state = self
            .currents
            .values_mut()
            .find(|state| Some(&state.final_out_dir) == last.as_ref());
        if let Some(state) = state {
            record_error(&mut self.results, state, time, ErrorInfo::new(reason));
            return;
        }

        let Some(index) = self.last_result else {
            return;
        };
        let result = &mut self.results[index];
        result.errors.push(ResultError {
            time,
            error: ErrorInfo::new(reason),
        });
        let line = format!("{} Error: {}\n", format_log_time(time), reason);
        let appended = OpenOptions::new()
            .append(true)
            .open(result.out_dir.join(LOG_FILENAME))
            .and_then(|mut log| log.write_all(line.as_bytes()));
        if let Err(error) = appended {
            tracing::warn!(entity = %result.name(), %error, "failed to write entity log");
        }
        if let Err(error) = self.state.results_writer.update(result) {
            tracing::warn!(entity = %result.name(), %error, "failed to stream result");
        }
    }

    /// Closes every entity still running with a "did not finish" error, reporting and
    /// streaming it like any other completion.
    pub(crate) async fn finish_incomplete(&mut self, global_error: Option<&ResultsError>) {
        for name in self.current_names() {
            let Some(mut state) = self.currents.remove(&name) else {
                continue;
            };
            let time = Utc::now();
            let kind = match state.entity.entity_type {
                EntityType::Test => "Test",
                EntityType::Fixture => "Fixture",
            };
            let reason = match global_error {
                Some(error) => format!("{kind} did not finish: got global error: {error}"),
                None => format!("{kind} did not finish"),
            };
            record_error(&mut self.results, &mut state, time, ErrorInfo::new(reason));

            if let Err(error) = self.finish_entity(state, time, String::new(), None).await {
                tracing::warn!(entity = %name, %error, "failed to finalize incomplete entity");
            }
        }
        log_assert!(self.currents.is_empty(), "entities left running after reconciliation");
    }

    pub(crate) async fn wait_for_pulls(&mut self) {
        if let Some(puller) = &mut self.puller {
            puller.wait().await;
        }
    }

    /// Tests announced by the runner that never started, or [None] if the runner never
    /// said which tests it would run.
    pub(crate) fn unstarted_tests(&self) -> Option<Vec<String>> {
        self.tests_to_run.as_ref().map(|names| {
            names
                .iter()
                .filter(|name| !self.started.contains(*name))
                .cloned()
                .collect()
        })
    }

    pub(crate) fn into_results(self) -> Vec<TestResult> {
        self.results
    }

    fn current_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.currents.keys().cloned().collect();
        names.sort();
        names
    }
}

fn record_error(
    results: &mut [TestResult],
    state: &mut EntityState,
    time: DateTime<Utc>,
    error: ErrorInfo,
) {
    let mut text = match error.file.is_empty() {
        true => format!("Error: {}", error.reason),
        false => format!("Error at {}:{}: {}", error.file, error.line, error.reason),
    };
    if !error.stack.is_empty() {
        text.push_str(&format!("\nStack trace:\n{}", error.stack));
    }
    state.log(time, &text);

    if let Some(index) = state.result {
        results[index].errors.push(ResultError { time, error });
    }
}

fn skip_reason(skip_reasons: &[String], missing_software_deps: &[String]) -> String {
    if !skip_reasons.is_empty() {
        skip_reasons.join(", ")
    } else if !missing_software_deps.is_empty() {
        format!("missing SoftwareDeps: {}", missing_software_deps.join(", "))
    } else {
        String::new()
    }
}
