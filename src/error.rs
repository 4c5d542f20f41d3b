use thiserror::Error;

use crate::models::AppointmentStatus;
use crate::transitions::TransitionVerb;

/// Failure reported by a data-access collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("appointment {0} not found")]
    NotFound(String),
    #[error("cannot {verb} an appointment that is {current}")]
    InvalidTransition {
        current: AppointmentStatus,
        verb: TransitionVerb,
    },
    #[error("slot conflicts with appointment {conflicting_id}")]
    ScheduleConflict { conflicting_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Rejections that retrying the same request can never fix.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EngineError::Store(_))
    }
}

#[derive(Debug, Error)]
pub enum CrudError<E> {
    #[error("record {id} not found")]
    NotFound { id: String },
    #[error("record {id} already has a mutation in flight")]
    InFlight { id: String },
    #[error("remote operation failed after {attempts} attempt(s): {source}")]
    RemoteOperationFailed {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> CrudError<E> {
    pub fn is_max_retries_exceeded(&self, max_attempts: u32) -> bool {
        matches!(self, CrudError::RemoteOperationFailed { attempts, .. } if *attempts >= max_attempts)
    }

    pub fn remote_error(&self) -> Option<&E> {
        match self {
            CrudError::RemoteOperationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncFailed {
    #[error("client is offline")]
    Offline,
    #[error("a sync is already running")]
    InProgress,
    #[error("schedule sync failed: {0}")]
    Remote(#[from] StoreError),
}
