use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use rusqlite::{
    Connection, OpenFlags, OptionalExtension, ToSql, params_from_iter,
    types::{ToSqlOutput, Value as SqlValue},
};

use crate::{
    connection_string::{CacheMode, ConnectionConfiguration, OpenMode},
    db::{Engine, EngineError, Value, codes},
};

/// URI naming the process wide in-memory database used with `Cache=Shared`.
const SHARED_MEMORY_URI: &str = "file::memory:?cache=shared";

/// Binding to the SQLite library, reached through `rusqlite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(native, message) => EngineError::native(
                native.extended_code,
                message.unwrap_or_else(|| native.to_string()),
            ),
            other => EngineError::native(codes::ERROR, other.to_string()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(r) => ToSqlOutput::from(*r),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(r) => Value::Real(r),
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(b) => Value::Blob(b),
        }
    }
}

fn open_flags(config: &ConnectionConfiguration) -> OpenFlags {
    let mut flags = match config.open_mode() {
        OpenMode::ReadWriteCreate => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
        OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
    };

    // Handles never cross threads while in use, so the engine does not need its own locking.
    flags |= OpenFlags::SQLITE_OPEN_NO_MUTEX;
    match config.cache_mode() {
        CacheMode::Default => {}
        CacheMode::Private => flags |= OpenFlags::SQLITE_OPEN_PRIVATE_CACHE,
        CacheMode::Shared => flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE,
    }

    flags
}

/// Runs the `PRAGMA` statements requested by the configuration against a fresh handle.
fn apply_pragmas(conn: &Connection, config: &ConnectionConfiguration) -> rusqlite::Result<()> {
    if let Some(timeout) = config.timeout() {
        conn.busy_timeout(timeout)?;
    }

    let mut pragmas = Vec::new();
    if let Some(encoding) = config.text_encoding() {
        pragmas.push(format!("PRAGMA encoding = '{}'", encoding.pragma_value()));
    }

    if let Some(pages) = config.cache_size_pages() {
        pragmas.push(format!("PRAGMA cache_size = {}", pages));
    }

    if let Some(bytes) = config.page_size_bytes() {
        pragmas.push(format!("PRAGMA page_size = {}", bytes));
    }

    if let Some(enabled) = config.auto_vacuum_enabled() {
        pragmas.push(format!("PRAGMA auto_vacuum = {}", i32::from(enabled)));
    }

    if let Some(mode) = config.synchronous_mode() {
        pragmas.push(format!("PRAGMA synchronous = {}", mode.pragma_value()));
    }

    if let Some(store) = config.temp_store_mode() {
        pragmas.push(format!("PRAGMA temp_store = {}", store.pragma_value()));
    }

    if let Some(directory) = config.temp_store_directory_path() {
        pragmas.push(format!(
            "PRAGMA temp_store_directory = '{}'",
            directory.replace('\'', "''")
        ));
    }

    if let Some(enabled) = config.case_sensitive_like_enabled() {
        pragmas.push(format!("PRAGMA case_sensitive_like = {}", i32::from(enabled)));
    }

    if let Some(enabled) = config.foreign_keys_enabled() {
        pragmas.push(format!("PRAGMA foreign_keys = {}", i32::from(enabled)));
    }

    for pragma in pragmas {
        tracing::trace!("{}", pragma);
        conn.execute_batch(&pragma)?;
    }

    Ok(())
}

#[tracing::instrument(level = "debug", skip_all, fields(data_source = config.data_source()), err)]
fn open_native(config: &ConnectionConfiguration) -> Result<Connection, EngineError> {
    let flags = open_flags(config);
    let conn = if config.is_memory() && config.cache_mode() == CacheMode::Shared {
        Connection::open_with_flags(SHARED_MEMORY_URI, flags | OpenFlags::SQLITE_OPEN_URI)?
    } else {
        Connection::open_with_flags(config.data_source(), flags)?
    };

    if let Err(err) = apply_pragmas(&conn, config) {
        // A handle that failed configuration is never handed out.
        if let Err((_, close_err)) = conn.close() {
            tracing::warn!("Failed to release partially opened handle: {}", close_err);
        }

        return Err(err.into());
    }

    Ok(conn)
}

/// A native handle that can be given back to the engine.
trait Release {
    fn release(self) -> Result<(), EngineError>;
}

impl Release for Connection {
    fn release(self) -> Result<(), EngineError> {
        self.close().map_err(|(_, err)| err.into())
    }
}

/// Runs `open` on a worker thread, giving up once `timeout` has elapsed. A handle the worker
/// produces after the caller gave up is released by the worker.
fn open_with_deadline<H, F>(
    config: &ConnectionConfiguration,
    timeout: Duration,
    open: F,
) -> Result<H, EngineError>
where
    H: Release + Send + 'static,
    F: FnOnce(&ConnectionConfiguration) -> Result<H, EngineError> + Send + 'static,
{
    // Zero capacity: the handoff either reaches a waiting caller or fails back to the worker.
    let (tx, rx) = mpsc::sync_channel(0);
    let worker_config = config.clone();
    thread::Builder::new()
        .name("sqconn-open".to_string())
        .spawn(move || {
            if let Err(mpsc::SendError(Ok(handle))) = tx.send(open(&worker_config)) {
                tracing::debug!("Open completed after the deadline, closing abandoned handle");
                if let Err(err) = handle.release() {
                    tracing::warn!("Failed to release abandoned handle: {}", err);
                }
            }
        })
        .map_err(|err| {
            EngineError::native(codes::ERROR, format!("unable to start open worker: {}", err))
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EngineError::TimedOut(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(EngineError::native(
            codes::ERROR,
            "open worker exited without a result",
        )),
    }
}

impl Engine for SqliteEngine {
    type Handle = Connection;

    fn open(&self, config: &ConnectionConfiguration) -> Result<Connection, EngineError> {
        match config.timeout() {
            Some(timeout) => open_with_deadline(config, timeout, open_native),
            None => open_native(config),
        }
    }

    fn close(&self, handle: Connection) -> Result<(), EngineError> {
        handle.release()
    }

    fn is_alive(&self, handle: &Connection) -> bool {
        handle
            .query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn execute(&self, handle: &Connection, sql: &str, params: &[Value]) -> Result<usize, EngineError> {
        Ok(handle.execute(sql, params_from_iter(params))?)
    }

    fn execute_batch(&self, handle: &Connection, sql: &str) -> Result<(), EngineError> {
        Ok(handle.execute_batch(sql)?)
    }

    fn query_scalar(
        &self,
        handle: &Connection,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<Value>, EngineError> {
        let value = handle
            .query_row(sql, params_from_iter(params), |row| row.get::<_, SqlValue>(0))
            .optional()?;

        Ok(value.map(Value::from))
    }

    fn is_autocommit(&self, handle: &Connection) -> bool {
        handle.is_autocommit()
    }

    fn version(&self) -> String {
        rusqlite::version().to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::connection_string::parse;
    use test_log::test;

    fn open(raw: &str) -> Result<Connection, EngineError> {
        SqliteEngine.open(&parse(raw).unwrap())
    }

    #[test]
    fn test_open_memory() {
        let engine = SqliteEngine;
        let conn = open("Data Source=:memory:").unwrap();
        engine
            .execute_batch(&conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();

        let changed = engine
            .execute(&conn, "INSERT INTO t (name) VALUES (?1)", &[Value::from("a")])
            .unwrap();
        assert_eq!(1, changed);

        let name = engine
            .query_scalar(&conn, "SELECT name FROM t WHERE id = ?1", &[Value::Integer(1)])
            .unwrap();
        assert_eq!(Some(Value::from("a")), name);

        let missing = engine
            .query_scalar(&conn, "SELECT name FROM t WHERE id = ?1", &[Value::Integer(2)])
            .unwrap();
        assert_eq!(None, missing);

        assert!(engine.is_alive(&conn));
        assert!(engine.is_autocommit(&conn));
        engine.close(conn).unwrap();
    }

    #[test]
    fn test_open_missing_file_read_only() {
        let err = open("Data Source=/nonexistent/path/x.db;Mode=ReadOnly").unwrap_err();
        assert_eq!(Some(codes::CANTOPEN), err.code());
    }

    #[test]
    fn test_read_write_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let err = open(&format!("Data Source={};Mode=ReadWrite", path.display())).unwrap_err();
        assert_eq!(Some(codes::CANTOPEN), err.code());
        assert!(!path.exists());

        let conn = open(&format!("Data Source={}", path.display())).unwrap();
        SqliteEngine.close(conn).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_pragmas_applied() {
        let engine = SqliteEngine;
        let conn = open(
            "Data Source=:memory:;Foreign Keys=true;Cache Size=1234;Synchronous=Off;Temp Store=Memory",
        )
        .unwrap();

        let scalar = |sql: &str| engine.query_scalar(&conn, sql, &[]).unwrap();
        assert_eq!(Some(Value::Integer(1)), scalar("PRAGMA foreign_keys"));
        assert_eq!(Some(Value::Integer(1234)), scalar("PRAGMA cache_size"));
        assert_eq!(Some(Value::Integer(0)), scalar("PRAGMA synchronous"));
        assert_eq!(Some(Value::Integer(2)), scalar("PRAGMA temp_store"));
    }

    #[test]
    fn test_private_memory_databases_are_isolated() {
        let engine = SqliteEngine;
        let first = open("Data Source=:memory:").unwrap();
        let second = open("Data Source=:memory:").unwrap();
        engine
            .execute_batch(&first, "CREATE TABLE private_only (id INTEGER)")
            .unwrap();

        let err = engine
            .query_scalar(&second, "SELECT count(*) FROM private_only", &[])
            .unwrap_err();
        assert_eq!(Some(codes::ERROR), err.code());
    }

    #[test]
    fn test_shared_cache_memory_database_is_shared() {
        let engine = SqliteEngine;
        let first = open("Data Source=:memory:;Cache=Shared").unwrap();
        let second = open("Data Source=:memory:;Cache=Shared").unwrap();
        engine
            .execute_batch(
                &first,
                "CREATE TABLE shared_engine_test (id INTEGER); INSERT INTO shared_engine_test VALUES (7);",
            )
            .unwrap();

        let value = engine
            .query_scalar(&second, "SELECT id FROM shared_engine_test", &[])
            .unwrap();
        assert_eq!(Some(Value::Integer(7)), value);

        engine
            .execute_batch(&first, "DROP TABLE shared_engine_test")
            .unwrap();
    }

    #[test]
    fn test_open_with_deadline() {
        let conn = open("Data Source=:memory:;Timeout=5").unwrap();
        assert!(SqliteEngine.is_alive(&conn));
    }

    #[test]
    fn test_open_with_deadline_reports_engine_error() {
        let err = open("Data Source=/nonexistent/path/x.db;Mode=ReadOnly;Timeout=5").unwrap_err();
        assert_eq!(Some(codes::CANTOPEN), err.code());
    }

    /// Stand-in handle that reports its release on a channel.
    struct Tracked(mpsc::Sender<()>);

    impl Release for Tracked {
        fn release(self) -> Result<(), EngineError> {
            let _ = self.0.send(());
            Ok(())
        }
    }

    #[test]
    fn test_deadline_expires_before_slow_open() {
        let (released_tx, released_rx) = mpsc::channel();
        let config = parse("Data Source=:memory:").unwrap();

        let result = open_with_deadline(&config, Duration::from_millis(50), move |_| {
            thread::sleep(Duration::from_millis(300));
            Ok(Tracked(released_tx))
        });

        assert!(matches!(result, Err(EngineError::TimedOut(t)) if t == Duration::from_millis(50)));

        // The handle produced after the deadline is released, not leaked.
        released_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("late handle was never released");
    }

    #[test]
    fn test_deadline_met_hands_over_handle() {
        let (released_tx, released_rx) = mpsc::channel();
        let config = parse("Data Source=:memory:").unwrap();

        let handle = open_with_deadline(&config, Duration::from_secs(5), move |_| {
            thread::sleep(Duration::from_millis(20));
            Ok(Tracked(released_tx))
        })
        .unwrap();

        assert!(released_rx.try_recv().is_err());
        handle.release().unwrap();
        assert!(released_rx.try_recv().is_ok());
    }

    #[test]
    fn test_deadline_expiry_with_native_open() {
        let config = parse("Data Source=:memory:").unwrap();
        let err = open_with_deadline(&config, Duration::from_millis(20), |config| {
            thread::sleep(Duration::from_millis(200));
            open_native(config)
        })
        .unwrap_err();
        assert_eq!(EngineError::TimedOut(Duration::from_millis(20)), err);
    }

    #[test]
    fn test_oversized_timeout_rejected_before_open() {
        assert!(parse("Data Source=:memory:;Timeout=3000000").is_err());
        let conn = open("Data Source=:memory:;Timeout=2147483").unwrap();
        assert!(SqliteEngine.is_alive(&conn));
    }

    #[test]
    fn test_encoding_applied() {
        let engine = SqliteEngine;
        let conn = open("Data Source=:memory:;Encoding=UTF-16le").unwrap();
        let encoding = engine.query_scalar(&conn, "PRAGMA encoding", &[]).unwrap();
        assert_eq!(Some(Value::from("UTF-16le")), encoding);
    }

    #[test]
    fn test_temp_store_directory_applied() {
        let engine = SqliteEngine;
        let directory = std::env::temp_dir().display().to_string();
        let conn = open(&format!(
            "Data Source=:memory:;Temporary Storage Folder=\"{}\"",
            directory.replace('"', "\"\"")
        ))
        .unwrap();

        let applied = engine
            .query_scalar(&conn, "PRAGMA temp_store_directory", &[])
            .unwrap();
        assert_eq!(Some(Value::Text(directory)), applied);
        engine.execute_batch(&conn, "PRAGMA temp_store_directory = ''").unwrap();
    }

    #[test]
    fn test_missing_temp_store_directory_fails_open() {
        let err = open("Data Source=:memory:;Temporary Storage Folder=/nonexistent/sqconn/tmp")
            .unwrap_err();
        assert_eq!(Some(codes::ERROR), err.code());
    }

    #[test]
    fn test_not_a_database_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'x'; 1024]).unwrap();
        file.flush().unwrap();

        let engine = SqliteEngine;
        let conn = open(&format!("Data Source={}", file.path().display())).unwrap();
        assert!(!engine.is_alive(&conn));

        let err = engine
            .query_scalar(&conn, "SELECT count(*) FROM sqlite_master", &[])
            .unwrap_err();
        assert_eq!(Some(codes::NOTADB), err.code());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_version() {
        assert!(SqliteEngine.version().starts_with('3'));
    }
}
