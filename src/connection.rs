//! Connection lifecycle management.
//!
//! A [`Connection`] starts [`Closed`](ConnectionState::Closed), owns at most one native handle
//! while [`Open`](ConnectionState::Open), and becomes [`Broken`](ConnectionState::Broken) when the
//! engine reports that its session is no longer usable. Only [`Connection::close`] leaves the
//! broken state.
//!
//! The handle is released exactly once: by `close`, by the guard returned from
//! [`Connection::open_scoped`], by [`Connection::scoped`], or when the connection is dropped.
//!
//! A connection may be moved between threads but is not meant to be used from several threads at
//! once. Callers sharing one must synchronize access themselves.

use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use crate::{
    connection_string::{self, ConnectionConfiguration},
    db::{Engine, EngineError, SqliteEngine, Value},
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Open,
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Broken => write!(f, "broken"),
        }
    }
}

/// A transition between two connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

type StateListener = Box<dyn FnMut(StateChange) + Send>;

/// A native handle together with the generation it was acquired in.
struct Session<H> {
    handle: H,
    generation: u64,
    config: ConnectionConfiguration,
}

/// Why a connection broke, and whether releasing its handle failed at the time.
struct Breakage {
    reason: String,
    release_error: Option<EngineError>,
}

/// A connection to an embedded database.
pub struct Connection<E: Engine = SqliteEngine> {
    engine: E,
    connection_string: String,
    state: ConnectionState,
    session: Option<Session<E::Handle>>,
    generation: u64,
    breakage: Option<Breakage>,
    listener: Option<StateListener>,
}

impl Connection<SqliteEngine> {
    /// Creates a closed SQLite connection with an empty connection string.
    pub fn new() -> Self {
        Self::with_engine(SqliteEngine)
    }

    /// Creates a closed SQLite connection. The string is not parsed until [`Connection::open`].
    pub fn with_connection_string(raw: impl Into<String>) -> Self {
        let mut conn = Self::new();
        conn.connection_string = raw.into();
        conn
    }
}

impl Default for Connection<SqliteEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> Connection<E> {
    pub fn with_engine(engine: E) -> Self {
        Self {
            engine,
            connection_string: String::new(),
            state: ConnectionState::Closed,
            session: None,
            generation: 0,
            breakage: None,
            listener: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Replaces the connection string. Only valid while the connection is closed.
    pub fn set_connection_string(&mut self, raw: impl Into<String>) -> Result<()> {
        if self.state != ConnectionState::Closed {
            return Err(Error::InvalidOperation(
                "connection string can only be changed while the connection is closed",
            ));
        }

        self.connection_string = raw.into();
        Ok(())
    }

    /// Counter advanced every time a native handle is acquired or released.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Registers a callback invoked after every state transition, replacing any previous one.
    pub fn on_state_change(&mut self, listener: impl FnMut(StateChange) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// Parses the connection string and acquires a native handle.
    ///
    /// On failure the connection stays closed and no handle is retained.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Open => return Err(Error::InvalidOperation("connection already open")),
            ConnectionState::Broken => return Err(self.broken_error()),
            ConnectionState::Closed => {}
        }

        let config = connection_string::parse(&self.connection_string)?;
        let handle = self
            .engine
            .open(&config)
            .map_err(|err| Error::from_open(config.data_source(), err))?;

        self.generation += 1;
        tracing::debug!(
            generation = self.generation,
            "Opened connection to {}",
            config.data_source()
        );

        self.session = Some(Session {
            handle,
            generation: self.generation,
            config,
        });

        self.transition(ConnectionState::Open);
        Ok(())
    }

    /// Releases the native handle, if any, and returns the connection to the closed state.
    ///
    /// Closing a closed connection does nothing. The connection is closed when this returns even
    /// if the engine failed to release the handle; that failure is reported as
    /// [`Error::Release`].
    #[tracing::instrument(level = "debug", skip_all, fields(state = %self.state), err)]
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        let released = self.release();
        let residual = self.breakage.take().and_then(|breakage| {
            tracing::debug!("Closing broken connection: {}", breakage.reason);
            breakage.release_error
        });

        if self.state == ConnectionState::Broken {
            self.generation += 1;
        }

        self.transition(ConnectionState::Closed);
        match (released, residual) {
            (Err(err), _) | (Ok(()), Some(err)) => Err(Error::Release(err)),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Opens the connection and returns a guard that closes it when dropped.
    pub fn open_scoped(&mut self) -> Result<OpenConnection<'_, E>> {
        self.open()?;
        Ok(OpenConnection { conn: self })
    }

    /// Opens the connection, runs `f`, and closes the connection on every exit path, including a
    /// panic inside `f`.
    ///
    /// If `f` fails and the release fails too, the error from `f` is returned.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut guard = self.open_scoped()?;
        let result = f(&mut *guard);
        let closed = guard.close();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::warn!("Failed to release connection after error: {}", release_err);
                Err(err)
            }
        }
    }

    /// The configuration the connection was opened with.
    pub fn configuration(&self) -> Option<&ConnectionConfiguration> {
        self.session().ok().map(|session| &session.config)
    }

    pub fn data_source(&self) -> Option<&str> {
        self.configuration().map(ConnectionConfiguration::data_source)
    }

    pub fn server_version(&self) -> String {
        self.engine.version()
    }

    /// Executes a single statement, returning the number of rows changed.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.run(|engine, handle| engine.execute(handle, sql, params))
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.run(|engine, handle| engine.execute_batch(handle, sql))
    }

    /// Returns the first column of the first row produced by `sql`.
    pub fn query_scalar(&mut self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.run(|engine, handle| engine.query_scalar(handle, sql, params))
    }

    /// Runs the engine's integrity check and returns its report, `ok` for a healthy database.
    pub fn check_integrity(&mut self) -> Result<String> {
        let report = self.query_scalar("PRAGMA integrity_check", &[])?;
        Ok(report.map(|value| value.to_string()).unwrap_or_default())
    }

    /// Probes the native session, breaking the connection if it no longer responds.
    pub fn check_alive(&mut self) -> Result<()> {
        let session = self.session()?;
        if self.engine.is_alive(&session.handle) {
            return Ok(());
        }

        self.mark_broken("native session stopped responding".to_string());
        Err(self.broken_error())
    }

    /// Whether an explicit transaction is in progress. Always false unless open.
    pub fn in_transaction(&self) -> bool {
        self.session()
            .map(|session| !self.engine.is_autocommit(&session.handle))
            .unwrap_or(false)
    }

    /// Attaches the database at `path` to this connection as the schema `name`.
    pub fn attach(&mut self, path: &str, name: &str) -> Result<()> {
        let sql = format!("ATTACH DATABASE ?1 AS {}", quote_identifier(name));
        let params = [Value::from(path)];
        self.run(|engine, handle| engine.execute(handle, &sql, &params))?;
        Ok(())
    }

    pub fn detach(&mut self, name: &str) -> Result<()> {
        let sql = format!("DETACH DATABASE {}", quote_identifier(name));
        self.run(|engine, handle| engine.execute_batch(handle, &sql))
    }

    /// Rebuilds the main database, returning its free pages to the file system. Attached
    /// databases are left alone.
    pub fn vacuum(&mut self) -> Result<()> {
        self.run(|engine, handle| engine.execute_batch(handle, "VACUUM"))
    }

    /// Returns the session owned by the current generation.
    fn session(&self) -> Result<&Session<E::Handle>> {
        match self.state {
            ConnectionState::Closed => return Err(Error::InvalidOperation("connection is not open")),
            ConnectionState::Broken => return Err(self.broken_error()),
            ConnectionState::Open => {}
        }

        match &self.session {
            Some(session) if session.generation == self.generation => Ok(session),
            _ => Err(Error::InvalidOperation(
                "connection does not own a current native handle",
            )),
        }
    }

    fn run<T>(&mut self, op: impl FnOnce(&E, &E::Handle) -> Result<T, EngineError>) -> Result<T> {
        let session = self.session()?;
        match op(&self.engine, &session.handle) {
            Ok(value) => Ok(value),
            Err(err) if err.is_fatal() => {
                self.mark_broken(err.to_string());
                Err(Error::Engine(err))
            }
            Err(err) => Err(Error::Engine(err)),
        }
    }

    fn broken_error(&self) -> Error {
        Error::ConnectionBroken {
            reason: self
                .breakage
                .as_ref()
                .map(|breakage| breakage.reason.clone())
                .unwrap_or_default(),
        }
    }

    /// Releases the handle internally and moves to the broken state.
    fn mark_broken(&mut self, reason: String) {
        tracing::debug!(generation = self.generation, "Connection broken: {}", reason);
        let release_error = self.release().err();
        self.breakage = Some(Breakage {
            reason,
            release_error,
        });

        self.transition(ConnectionState::Broken);
    }

    /// Hands the current handle back to the engine. The reference is dropped before the engine
    /// is asked to release it.
    fn release(&mut self) -> Result<(), EngineError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        self.generation += 1;
        tracing::debug!(
            generation = self.generation,
            "Releasing handle for {}",
            session.config.data_source()
        );

        self.engine.close(session.handle)
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = std::mem::replace(&mut self.state, to);
        if from == to {
            return;
        }

        if let Some(listener) = self.listener.as_mut() {
            listener(StateChange { from, to });
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl<E: Engine> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_string", &self.connection_string)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<E: Engine> Drop for Connection<E> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("Failed to release connection on drop: {}", err);
        }
    }
}

/// An open connection that is closed when the guard goes out of scope.
pub struct OpenConnection<'a, E: Engine = SqliteEngine> {
    conn: &'a mut Connection<E>,
}

impl<E: Engine> OpenConnection<'_, E> {
    /// Closes the connection now, reporting any release failure.
    pub fn close(self) -> Result<()> {
        // Dropping the guard afterwards finds the connection closed and does nothing.
        self.conn.close()
    }
}

impl<E: Engine> Deref for OpenConnection<'_, E> {
    type Target = Connection<E>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<E: Engine> DerefMut for OpenConnection<'_, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}

impl<E: Engine> Drop for OpenConnection<'_, E> {
    fn drop(&mut self) {
        if let Err(err) = self.conn.close() {
            tracing::warn!("Failed to release connection on scope exit: {}", err);
        }
    }
}
