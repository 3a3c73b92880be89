//! Error types for shiftlist.

use crate::model::ShiftId;
use thiserror::Error;

/// SQLSTATEs after which Postgres expects the whole transaction to be re-run.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("shift {0} is closed")]
    ShiftClosed(ShiftId),

    #[error("serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    #[error("compensation for {article} failed after step error ({step}): {compensation}")]
    Compensation {
        article: String,
        step: Box<Error>,
        compensation: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient failure that a fresh attempt of the same unit of work may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SerializationConflict(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let conflict = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED);
        if conflict {
            Error::SerializationConflict(err.to_string())
        } else {
            Error::Storage(err)
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Other(format!("migration failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
