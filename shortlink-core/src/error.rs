use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    // Resolution outcomes surfaced to the entry point
    #[error("Shortened route segment not found: {0}")]
    RouteNotFound(String),

    #[error("Shortened route segment expired: {0}")]
    RouteExpired(String),

    #[error("Invocation limit exceeded: {0}")]
    InvocationLimitExceeded(String),

    // Runtime faults
    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by callers for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Corruption(_) => "CORRUPTION",
            Error::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            Error::RouteExpired(_) => "ROUTE_EXPIRED",
            Error::InvocationLimitExceeded(_) => "INVOCATION_LIMIT_EXCEEDED",
            Error::ActivationFailed(_) => "ACTIVATION_FAILED",
            Error::SchedulerUnavailable(_) => "SCHEDULER_UNAVAILABLE",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Transient faults like IO errors are retryable, while resolution
    /// outcomes and bad input are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors (transient)
            Error::Io(_) => true,
            Error::ActivationFailed(_) => true,
            Error::SchedulerUnavailable(_) => true,

            // Non-retryable errors (logical/permanent)
            Error::Corruption(_) => false,
            Error::ChecksumMismatch => false,
            Error::Serialization(_) => false,
            Error::InvalidArgument(_) => false,
            Error::AlreadyExists(_) => false,
            Error::RouteNotFound(_) => false,
            Error::RouteExpired(_) => false,
            Error::InvocationLimitExceeded(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Returns true for expected, caller-recoverable outcomes of an entity
    /// operation, as opposed to runtime faults.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::RouteNotFound(_)
                | Error::RouteExpired(_)
                | Error::InvocationLimitExceeded(_)
                | Error::AlreadyExists(_)
                | Error::InvalidArgument(_)
        )
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use shortlink_core::Error;
    ///
    /// fn append_record() -> Result<(), Error> {
    ///     Err(Error::Io(std::io::Error::new(
    ///         std::io::ErrorKind::NotFound,
    ///         "file not found"
    ///     )))
    /// }
    ///
    /// fn save_state() -> Result<(), Error> {
    ///     append_record().map_err(|e| e.with_context("failed to save entity state"))
    /// }
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
