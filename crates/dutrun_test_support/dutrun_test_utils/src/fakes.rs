use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use dutrun_protocol::{
    fixture::{FixtureRequest, FixtureResponse},
    ErrorInfo,
};
use dutrun_results::{ReportClient, ReportError, TestResult};
use dutrun_scheduler::{
    fixture_service::{FixtureService, FixtureServiceError},
    ConnectionManager,
};
use dutrun_transport::{Connection, TransportError};
use dutrun_utils::cancel::CancelScope;
use parking_lot::Mutex;

/// An in-memory fixture service whose fixtures fail as configured.
#[derive(Debug, Default)]
pub struct FakeFixtureService {
    set_up_errors: BTreeMap<String, Vec<String>>,
    tear_down_errors: BTreeMap<String, Vec<String>>,
    stack: Vec<String>,
    pending: VecDeque<FixtureResponse>,
    requests: Vec<FixtureRequest>,
    /// Hang up instead of answering after this many requests.
    hang_up_after: Option<usize>,
}

impl FakeFixtureService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_set_up(mut self, fixture: &str, reason: &str) -> Self {
        self.set_up_errors
            .entry(fixture.to_string())
            .or_default()
            .push(reason.to_string());
        self
    }

    pub fn fail_tear_down(mut self, fixture: &str, reason: &str) -> Self {
        self.tear_down_errors
            .entry(fixture.to_string())
            .or_default()
            .push(reason.to_string());
        self
    }

    pub fn hang_up_after(mut self, requests: usize) -> Self {
        self.hang_up_after = Some(requests);
        self
    }

    pub fn requests(&self) -> &[FixtureRequest] {
        &self.requests
    }

    /// Fixtures pushed and not yet popped.
    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    fn respond(&mut self, text: String, errors: Vec<String>) {
        self.pending.push_back(FixtureResponse::Log {
            time: Utc::now(),
            text,
        });
        for reason in errors {
            self.pending.push_back(FixtureResponse::Error {
                time: Utc::now(),
                error: ErrorInfo::new(reason),
            });
        }
        self.pending.push_back(FixtureResponse::RequestDone);
    }
}

#[async_trait]
impl FixtureService for FakeFixtureService {
    async fn send(&mut self, request: &FixtureRequest) -> Result<(), FixtureServiceError> {
        if self.hang_up_after == Some(self.requests.len()) {
            return Err(FixtureServiceError::Closed);
        }
        self.requests.push(request.clone());
        match request {
            FixtureRequest::Push { name, .. } => {
                self.stack.push(name.clone());
                let errors = self.set_up_errors.get(name).cloned().unwrap_or_default();
                self.respond(format!("setting up {name}"), errors);
            }
            FixtureRequest::Pop => {
                let name = self.stack.pop().unwrap_or_default();
                let errors = self.tear_down_errors.get(&name).cloned().unwrap_or_default();
                self.respond(format!("tearing down {name}"), errors);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<FixtureResponse, FixtureServiceError> {
        self.pending.pop_front().ok_or(FixtureServiceError::Closed)
    }
}

/// Records reported results, and asks to stop the run after a given number of them.
#[derive(Debug, Default)]
pub struct RecordingReportClient {
    reported: Mutex<Vec<TestResult>>,
    terminate_after: Option<usize>,
}

impl RecordingReportClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate_after(results: usize) -> Self {
        Self {
            terminate_after: Some(results),
            ..Default::default()
        }
    }

    pub fn reported_names(&self) -> Vec<String> {
        self.reported
            .lock()
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }
}

#[async_trait]
impl ReportClient for RecordingReportClient {
    async fn report_result(&self, result: &TestResult) -> Result<(), ReportError> {
        let mut reported = self.reported.lock();
        reported.push(result.clone());
        match self.terminate_after {
            Some(n) if reported.len() >= n => Err(ReportError::Terminate),
            _ => Ok(()),
        }
    }

    fn new_test_log_writer(&self, _name: &str, _rel_path: &Path) -> Box<dyn io::Write + Send> {
        Box::new(io::sink())
    }
}

/// Hands out a connection to this machine and counts reconnection checks.
pub struct CountingConnectionManager {
    conn: Connection,
    checks: AtomicUsize,
    /// Checks beyond this many fail, as if the DUT stayed down.
    fail_after: Option<usize>,
}

impl CountingConnectionManager {
    pub fn new() -> Self {
        Self {
            conn: Connection::local(),
            checks: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    pub fn fail_after(checks: usize) -> Self {
        Self {
            fail_after: Some(checks),
            ..Self::new()
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl Default for CountingConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionManager for CountingConnectionManager {
    async fn connection(&self) -> Connection {
        self.conn.clone()
    }

    async fn reconnect_if_needed(&self, scope: &CancelScope) -> Result<Connection, TransportError> {
        scope.check()?;
        let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_after {
            Some(limit) if checks > limit => Err(TransportError::Closed),
            _ => Ok(self.conn.clone()),
        }
    }
}
