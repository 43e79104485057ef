use std::time::Duration;

use thiserror::Error;

use crate::{connection_string::ParseError, db::EngineError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by [`Connection`](crate::Connection) operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection string is malformed or incomplete. The connection stays closed.
    #[error("invalid connection string: {0}")]
    Parse(#[from] ParseError),

    /// The engine refused to open the data source. The connection stays closed.
    #[error("unable to open '{data_source}'")]
    Open {
        data_source: String,
        #[source]
        source: EngineError,
    },

    /// The operation is not valid in the connection's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Opening did not complete before the configured deadline. The connection stays closed.
    #[error("timed out after {timeout:?} opening '{data_source}'")]
    Timeout {
        data_source: String,
        timeout: Duration,
    },

    /// The connection hit a fatal engine error and must be closed before it can be reused.
    #[error("connection is broken: {reason}")]
    ConnectionBroken { reason: String },

    /// The native handle could not be released cleanly. The connection is closed regardless.
    #[error("failed to release native handle")]
    Release(#[source] EngineError),

    /// A statement failed on an open connection.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl Error {
    /// Maps a failed open onto the error kind callers can act on.
    pub(crate) fn from_open(data_source: &str, err: EngineError) -> Self {
        match err {
            EngineError::TimedOut(timeout) => Error::Timeout {
                data_source: data_source.to_string(),
                timeout,
            },
            source => Error::Open {
                data_source: data_source.to_string(),
                source,
            },
        }
    }

    /// The native engine's primary result code, if this error carries one.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } | Error::Release(source) | Error::Engine(source) => {
                source.code()
            }
            _ => None,
        }
    }
}
