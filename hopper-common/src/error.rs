//! Common error types for hopper

use thiserror::Error;

use crate::store::StoreError;

/// Common result type for hopper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Voluntary early-exit request raised by import logic.
///
/// Stop signals are control flow, not failures: the builder and the
/// pipeline interpret them to unwind one record, one file, or the whole
/// run, and never log them as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Discard the current record's changes, continue with the next one
    Record,
    /// Stop the current file, keep records already committed
    Builder,
    /// Stop the whole run; the triggering file is routed to `error`
    Pipeline,
}

impl std::fmt::Display for Stop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stop::Record => write!(f, "record"),
            Stop::Builder => write!(f, "builder"),
            Stop::Pipeline => write!(f, "pipeline"),
        }
    }
}

/// Common error types across the hopper crates
#[derive(Error, Debug)]
pub enum Error {
    /// Early-exit request from import logic, not a failure
    #[error("import stopped at {0} scope")]
    Stop(Stop),

    /// Entity store operation error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or unreadable source content
    #[error("Content error: {0}")]
    Content(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stop signal carried by this error, if it is one.
    pub fn stop(&self) -> Option<Stop> {
        match self {
            Error::Stop(stop) => Some(*stop),
            _ => None,
        }
    }
}
