//! Lifecycle management for embedded SQLite connections.
//!
//! A [`Connection`] is configured with a `key=value;...` connection string, opened on demand and
//! released exactly once, either explicitly or when it goes out of scope.

pub mod connection;
pub mod connection_string;
pub mod db;
pub mod error;

pub use connection::{Connection, ConnectionState, OpenConnection, StateChange};
pub use connection_string::{
    CacheMode, ConnectionConfiguration, OpenMode, ParseError, SynchronousMode, TempStore,
    TextEncoding,
};
pub use db::{Engine, EngineError, SqliteEngine, Value};
pub use error::{Error, Result};
