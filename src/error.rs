//! Application-wide error types.
//!
//! Every fallible operation in the runtime returns [`Error`], a closed
//! taxonomy of failure kinds. Control surfaces map kinds to HTTP status
//! codes via [`Error::kind`]; internal tasks match on kinds to decide
//! whether to retry, drop a source from the mix graph, or propagate.
//!
//! # Design
//!
//! - [`Error`]: the taxonomy enum, one variant per kind
//! - [`ErrorKind`]: lightweight discriminant for mapping/matching
//! - `anyhow` is used in `main` only; library code stays on [`Result`]

use std::time::Duration;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error, one variant per failure kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller supplied out-of-range or malformed input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current state
    #[error("cannot {operation} while {state}")]
    IllegalState { operation: String, state: String },

    /// Addressed entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already held or record already present
    #[error("conflict: {0}")]
    Conflict(String),

    /// The variant does not implement the requested capability
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Bounded wait elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying device/network/service failure
    #[error("external failure: {0}")]
    External(String),

    /// Caller cancelled the operation
    #[error("cancelled")]
    Cancelled,

    /// The object reached its terminal state
    #[error("already disposed")]
    AlreadyDisposed,

    /// The contract exists but the implementation is deliberately unfinished
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Discriminant for [`Error`], used by the HTTP mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    NotFound,
    Conflict,
    NotSupported,
    Timeout,
    External,
    Cancelled,
    AlreadyDisposed,
    NotImplemented,
}

impl Error {
    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an illegal-state error for `operation` attempted in `state`.
    pub fn illegal_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::IllegalState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    /// Create an external-failure error.
    pub fn external(message: impl Into<String>) -> Self {
        Self::External(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }

    /// The kind of the innermost error (context wrappers are transparent).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::IllegalState { .. } => ErrorKind::IllegalState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::External(_) => ErrorKind::External,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AlreadyDisposed => ErrorKind::AlreadyDisposed,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::WithContext { source, .. } => source.kind(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            _ => Self::External(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound("database row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.to_string())
            }
            _ => Self::External(e.to_string()),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::from(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::from(e).context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_through_context() {
        let err = Error::conflict("port in use").context("reserving /dev/ttyUSB0");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("reserving /dev/ttyUSB0"));
    }

    #[test]
    fn test_illegal_state_display() {
        let err = Error::illegal_state("pause", "Stopped");
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(io).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(Error::invalid_argument("volume 1.5"));
        let with_ctx = result.with_context("updating playback");
        assert!(with_ctx.unwrap_err().to_string().contains("updating playback"));
    }
}
