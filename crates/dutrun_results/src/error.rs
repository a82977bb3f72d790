use std::{io, time::Duration};

use dutrun_protocol::ErrorInfo;
use dutrun_utils::{cancel::Cancelled, net_protocol::FrameError};
use thiserror::Error;

/// Why a run was stopped early on purpose. Distinct from cancellation: the run is healthy,
/// but continuing is pointless.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    #[error("reached the limit of {0} test failures")]
    MaxFailures(usize),
    #[error("the reporting client requested termination")]
    ClientRequest,
}

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("control protocol violation: {0}")]
    Protocol(String),
    #[error("run failed: {0}")]
    Run(ErrorInfo),
    #[error("no control message for {0:?}; lost connection to the test runner?")]
    Timeout(Duration),
    #[error("control stream ended before RunEnd")]
    StreamClosed,
    #[error("run terminated: {0}")]
    Terminated(TerminateReason),
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("failed to read control stream: {0}")]
    Read(#[from] FrameError),
    #[error("failed to report result: {0}")]
    Report(String),
    /// A failure explained by probing the DUT afterwards.
    #[error("{message}")]
    Diagnosed {
        message: String,
        #[source]
        source: Box<ResultsError>,
    },
}

impl ResultsError {
    pub fn is_terminated(&self) -> bool {
        self.terminate_reason().is_some()
    }

    pub fn terminate_reason(&self) -> Option<TerminateReason> {
        match self {
            ResultsError::Terminated(reason) => Some(*reason),
            ResultsError::Diagnosed { source, .. } => source.terminate_reason(),
            _ => None,
        }
    }

    /// Whether probing the DUT could explain this error.
    pub(crate) fn is_diagnosable(&self) -> bool {
        !matches!(
            self,
            ResultsError::Terminated(_)
                | ResultsError::Cancelled(_)
                | ResultsError::Protocol(_)
                | ResultsError::Report(_)
                | ResultsError::Diagnosed { .. }
        )
    }
}
