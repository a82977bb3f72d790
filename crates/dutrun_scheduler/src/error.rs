use dutrun_results::{ResultsError, TerminateReason};
use dutrun_transport::TransportError;
use dutrun_utils::cancel::Cancelled;
use thiserror::Error;

use crate::{fixture_service::FixtureServiceError, fixtures::CategorizeError, launcher::LaunchError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Categorize(#[from] CategorizeError),
    #[error("connection to DUT failed: {0}")]
    Connection(#[from] TransportError),
    #[error("{0}")]
    Launch(#[from] LaunchError),
    #[error("{0}")]
    Results(#[from] ResultsError),
    #[error("fixture service failed for {fixture}: {source}")]
    FixtureService {
        fixture: String,
        #[source]
        source: FixtureServiceError,
    },
    #[error("tests of bundle {bundle} still unfinished after {attempts} attempts: {source}")]
    Incomplete {
        bundle: String,
        attempts: usize,
        #[source]
        source: Box<SchedulerError>,
    },
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
}

impl SchedulerError {
    pub fn is_terminated(&self) -> bool {
        self.terminate_reason().is_some()
    }

    pub fn terminate_reason(&self) -> Option<TerminateReason> {
        match self {
            SchedulerError::Results(error) => error.terminate_reason(),
            SchedulerError::Incomplete { source, .. } => source.terminate_reason(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SchedulerError::Cancelled(_)
            | SchedulerError::Results(ResultsError::Cancelled(_))
            | SchedulerError::Launch(LaunchError::Cancelled(_))
            | SchedulerError::Connection(TransportError::Cancelled(_)) => true,
            SchedulerError::Incomplete { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
