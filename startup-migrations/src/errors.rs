use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type returned by a `migrate` call.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The backend never accepted a connection within the retry budget.
    #[error("could not connect to the database after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: BackendError },

    /// A pending migration script could not be applied.
    #[error("migration '{id}' failed: {message}")]
    MigrationApply { id: String, message: String },

    /// The lock file could not be opened or locked for a reason other than contention.
    #[error("lock file {} is unavailable: {source}", path.display())]
    LockUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A waiting process gave up before the runner released the lock.
    #[error("gave up waiting for the running migration after {waited:?}")]
    WaitTimeout { waited: Duration },

    /// The connection descriptor is empty or cannot be parsed.
    #[error("invalid connection target: {message}")]
    InvalidTarget { message: String },

    /// Non-transient backend failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Migration scripts could not be read from the migrations source.
    #[error("failed to read migrations from {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded or resolved.
    #[error("configuration error: {message}")]
    Config { message: Cow<'static, str> },
}

impl MigrateError {
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config { message: message.into() }
    }
}

/// Failure reported by a [`DatabaseBackend`](crate::backend::DatabaseBackend).
///
/// `transient` marks operational failures (server not up yet, connection refused)
/// that a retry may fix.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub transient: bool,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        let transient = err.is_io_error()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.is_connection_dropped()
            || matches!(err.kind(), redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain);
        Self {
            message: err.to_string(),
            transient,
        }
    }
}

pub type MigrateResult<T> = Result<T, MigrateError>;
