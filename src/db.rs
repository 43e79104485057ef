use std::{fmt, time::Duration};

use thiserror::Error;

use crate::connection_string::ConnectionConfiguration;

pub mod sqlite;

pub use sqlite::SqliteEngine;

/// A value bound to, or read back from, a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

/// Primary result codes reported by the native engine.
pub mod codes {
    pub const ERROR: i32 = 1;
    pub const IOERR: i32 = 10;
    pub const CORRUPT: i32 = 11;
    pub const CANTOPEN: i32 = 14;
    pub const NOTADB: i32 = 26;
}

/// Error reported by a native engine binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine refused the request. `code` is the primary result code and `extended_code` the
    /// engine's extended code, both kept exactly as reported.
    #[error("{message} (code {code}, extended {extended_code})")]
    Native {
        code: i32,
        extended_code: i32,
        message: String,
    },

    /// The engine did not finish opening the data source before the deadline.
    #[error("open did not complete within {0:?}")]
    TimedOut(Duration),
}

impl EngineError {
    pub fn native(extended_code: i32, message: impl Into<String>) -> Self {
        EngineError::Native {
            code: extended_code & 0xff,
            extended_code,
            message: message.into(),
        }
    }

    /// Returns the primary result code, if the engine produced one.
    pub fn code(&self) -> Option<i32> {
        match self {
            EngineError::Native { code, .. } => Some(*code),
            EngineError::TimedOut(_) => None,
        }
    }

    /// Whether the error leaves the native session unusable (I/O failure or corruption).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            Some(codes::IOERR) | Some(codes::CORRUPT) | Some(codes::NOTADB)
        )
    }
}

/// Capability a [`Connection`](crate::Connection) needs from the embedded database engine.
///
/// Handles are owned values: [`Engine::close`] consumes the handle so a released session can not
/// be released again.
pub trait Engine {
    type Handle;

    /// Opens a native session for the given configuration, applying any tuning options.
    fn open(&self, config: &ConnectionConfiguration) -> Result<Self::Handle, EngineError>;

    /// Releases a native session.
    fn close(&self, handle: Self::Handle) -> Result<(), EngineError>;

    /// Cheap probe reporting whether the session can still serve requests.
    fn is_alive(&self, _handle: &Self::Handle) -> bool {
        true
    }

    /// Executes a single statement and returns the number of rows it changed.
    fn execute(&self, handle: &Self::Handle, sql: &str, params: &[Value])
    -> Result<usize, EngineError>;

    /// Executes a sequence of semicolon separated statements without parameters.
    fn execute_batch(&self, handle: &Self::Handle, sql: &str) -> Result<(), EngineError>;

    /// Returns the first column of the first row produced by `sql`, or `None` if no row was
    /// produced.
    fn query_scalar(
        &self,
        handle: &Self::Handle,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Value>, EngineError>;

    /// Whether the session is outside of an explicit transaction.
    fn is_autocommit(&self, handle: &Self::Handle) -> bool;

    /// Version string of the native engine.
    fn version(&self) -> String;
}
