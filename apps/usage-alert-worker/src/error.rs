use crate::engine::SessionState;
use thiserror::Error;

const UNIQUE_VIOLATION: &str = "23505";

/// Failures talking to the backing document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered with an error. The current
    /// cycle is abandoned; the next trigger retries naturally.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A uniqueness constraint rejected the insert. Callers treat this as
    /// "already satisfied".
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return Self::DuplicateKey(db.message().to_string());
            }
        }
        Self::Unavailable(err.to_string())
    }
}

/// A single event record that cannot take part in interval derivation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("event {id} has no device_id")]
    MissingDevice { id: String },
    #[error("event {id} has no timestamp")]
    MissingTimestamp { id: String },
    #[error("event {id} has unparsable timestamp {raw:?}")]
    BadTimestamp { id: String, raw: String },
    #[error("event {id} has unknown status_change {raw:?}")]
    BadState { id: String, raw: String },
}

#[derive(Debug, Error)]
#[error("unknown alert type {0:?}")]
pub struct UnknownAlertType(pub String);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("device directory load failed: {0}")]
    Directory(#[source] StoreError),
    #[error("alert subscription failed: {0}")]
    Subscribe(#[source] StoreError),
    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },
    #[error("scheduler task is no longer running")]
    SchedulerGone,
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type EngineResult<T> = Result<T, EngineError>;
