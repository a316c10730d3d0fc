//! Serialized access to one SQLite connection.
//!
//! A [`SqliteWorker`] owns a background thread that owns the only connection to the
//! database. Callers on any thread submit requests over a FIFO channel; the thread
//! runs them one at a time in arrival order and streams result rows back over a
//! per-request channel, always ending the stream with a `Done` marker.
//!
//! Statement failures do not reach the submitting caller directly. The worker stores
//! the failure and whichever caller interacts with the worker next receives it as
//! [`Error::Deferred`], exactly once.

use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, error, warn};

use crate::config::{StoreConfig, IN_MEMORY};
use crate::error::{Error, Result};
use crate::sqlite::{Params, Row, SqlQuery, Value};

/// Requests processed by the worker thread, in submission order.
enum Request {
    Statement {
        query: SqlQuery,
        sink: Option<Sender<Response>>,
        outer_stack: Option<Backtrace>,
    },
    Commit {
        sink: Option<Sender<Response>>,
    },
    Close {
        sink: Sender<Response>,
    },
}

enum Response {
    Row(Row),
    Done,
}

struct CapturedError {
    statement: String,
    source: rusqlite::Error,
}

/// Most recent unreported worker failure.
#[derive(Default)]
struct ErrorSlot {
    captured: Mutex<Option<CapturedError>>,
}

impl ErrorSlot {
    fn store(&self, captured: CapturedError) {
        let mut slot = acquire_lock(&self.captured);
        if let Some(previous) = slot.replace(captured) {
            warn!(
                statement = %previous.statement,
                error = %previous.source,
                "discarding unreported sqlite error in favour of a newer one"
            );
        }
    }

    fn take(&self) -> Option<CapturedError> {
        acquire_lock(&self.captured).take()
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("sqlite worker mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Settings for the worker's connection.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub path: PathBuf,
    pub autocommit: bool,
    pub journal_mode: String,
    pub timeout: Duration,
    pub read_only: bool,
    pub capture_outer_stack: bool,
}

impl WorkerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = StoreConfig::default();
        Self {
            path: path.into(),
            autocommit: defaults.autocommit,
            journal_mode: defaults.journal_mode,
            timeout: defaults.timeout,
            read_only: false,
            capture_outer_stack: defaults.capture_outer_stack,
        }
    }

    /// Options for `config`, with the file already resolved to `path`.
    pub fn from_config(config: &StoreConfig, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            autocommit: config.autocommit,
            journal_mode: config.journal_mode.clone(),
            timeout: config.timeout,
            read_only: config.flag.is_read_only(),
            capture_outer_stack: config.capture_outer_stack,
        }
    }

    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY)
    }
}

/// Handle to the background thread that owns the database connection.
pub struct SqliteWorker {
    requests: Sender<Request>,
    errors: Arc<ErrorSlot>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    path: PathBuf,
    autocommit: bool,
    capture_outer_stack: bool,
}

impl SqliteWorker {
    /// Start the worker and wait until its connection is open.
    ///
    /// Connection and pragma failures are returned here rather than deferred.
    pub fn open(options: WorkerOptions) -> Result<Self> {
        let (requests, receiver) = unbounded::<Request>();
        let (ready_tx, ready_rx) = bounded::<rusqlite::Result<()>>(1);
        let errors = Arc::new(ErrorSlot::default());

        let thread_errors = Arc::clone(&errors);
        let thread_options = options.clone();
        let handle = thread::Builder::new()
            .name("sqlite-worker".to_string())
            .spawn(move || {
                let conn = match connect(&thread_options) {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(path = %thread_options.path.display(), error = %e, "failed to open sqlite connection");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run(conn, &thread_options, &receiver, &thread_errors);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let _ = handle.join();
                return Err(Error::Open {
                    path: options.path,
                    source,
                });
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Closed);
            }
        }

        debug!(path = %options.path.display(), autocommit = options.autocommit, "sqlite worker started");
        Ok(Self {
            requests,
            errors,
            thread: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            path: options.path,
            autocommit: options.autocommit,
            capture_outer_stack: options.capture_outer_stack,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Re-raise the last failure from the worker thread, if any, and clear it.
    pub fn check_and_clear(&self) -> Result<()> {
        let Some(captured) = self.errors.take() else {
            return Ok(());
        };
        let current = thread::current();
        let caller = current
            .name()
            .map_or_else(|| format!("{:?}", current.id()), str::to_string);
        error!(
            caller = %caller,
            statement = %captured.statement,
            "an error occurred in a previous statement; its outer stack was logged when it was captured"
        );
        Err(Error::Deferred {
            caller,
            statement: captured.statement,
            source: captured.source,
        })
    }

    /// Submit a statement without waiting for it to run.
    pub fn execute(&self, query: impl Into<SqlQuery>) -> Result<()> {
        self.check_and_clear()?;
        self.submit(self.statement(query.into(), None))
    }

    /// Submit `statement` once per parameter set, in order.
    pub fn executemany<I>(&self, statement: &str, items: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Params>,
    {
        for params in items {
            self.execute(SqlQuery::new(statement).with_params(params))?;
        }
        self.check_and_clear()
    }

    /// Submit a statement and stream its rows back lazily.
    ///
    /// Failures to submit surface as the first item of the returned iterator.
    pub fn select(&self, query: impl Into<SqlQuery>) -> Rows<'_> {
        let (sink, receiver) = unbounded();
        let submitted = self
            .check_and_clear()
            .and_then(|()| self.submit(self.statement(query.into(), Some(sink))));
        match submitted {
            Ok(()) => Rows::streaming(self, receiver),
            Err(e) => Rows::failed(self, e),
        }
    }

    /// First row of [`select`](Self::select), or `None` when there are no rows.
    pub fn select_one(&self, query: impl Into<SqlQuery>) -> Result<Option<Row>> {
        self.select(query).next().transpose()
    }

    /// Commit the open transaction, optionally waiting until it has been committed.
    pub fn commit(&self, blocking: bool) -> Result<()> {
        self.check_and_clear()?;
        if !blocking {
            return self.submit(Request::Commit { sink: None });
        }
        let (sink, receiver) = unbounded();
        self.submit(Request::Commit { sink: Some(sink) })?;
        for row in Rows::streaming(self, receiver) {
            row?;
        }
        Ok(())
    }

    /// Stop the worker and close its connection.
    ///
    /// A forced close only enqueues the close request; otherwise this waits until the
    /// worker thread has exited. Closing an already closed worker does nothing.
    pub fn close(&self, force: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (sink, receiver) = unbounded();
        if force {
            drop(receiver);
            let _ = self.requests.send(Request::Close { sink });
            return Ok(());
        }
        self.requests
            .send(Request::Close { sink })
            .map_err(|_| Error::Closed)?;
        let _ = receiver.recv();
        self.join();
        self.check_and_clear()
    }

    fn statement(&self, query: SqlQuery, sink: Option<Sender<Response>>) -> Request {
        Request::Statement {
            query,
            sink,
            outer_stack: self.capture_outer_stack.then(Backtrace::force_capture),
        }
    }

    fn submit(&self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.requests.send(request).map_err(|_| Error::Closed)
    }

    fn join(&self) {
        let handle = acquire_lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(path = %self.path.display(), "sqlite worker thread panicked");
            }
        }
    }
}

impl Drop for SqliteWorker {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!(path = %self.path.display(), "sqlite worker dropped without close, forcing close");
            let _ = self.close(true);
        }
    }
}

/// Lazily streamed result rows of one request.
///
/// The pending error slot is checked after every received message. Dropping the
/// iterator early tells the worker to stop producing rows for this request.
pub struct Rows<'a> {
    worker: &'a SqliteWorker,
    state: RowsState,
}

enum RowsState {
    Failed(Error),
    Streaming(Receiver<Response>),
    Finished,
}

impl<'a> Rows<'a> {
    fn streaming(worker: &'a SqliteWorker, receiver: Receiver<Response>) -> Self {
        Self {
            worker,
            state: RowsState::Streaming(receiver),
        }
    }

    fn failed(worker: &'a SqliteWorker, error: Error) -> Self {
        Self {
            worker,
            state: RowsState::Failed(error),
        }
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, RowsState::Finished) {
            RowsState::Finished => None,
            RowsState::Failed(e) => Some(Err(e)),
            RowsState::Streaming(receiver) => {
                let response = receiver.recv();
                if let Err(e) = self.worker.check_and_clear() {
                    return Some(Err(e));
                }
                match response {
                    Ok(Response::Row(row)) => {
                        self.state = RowsState::Streaming(receiver);
                        Some(Ok(row))
                    }
                    Ok(Response::Done) => None,
                    // The worker went away without ending the stream.
                    Err(_) => Some(Err(Error::Closed)),
                }
            }
        }
    }
}

fn connect(options: &WorkerOptions) -> rusqlite::Result<Connection> {
    let conn = if options.is_in_memory() {
        Connection::open_in_memory()?
    } else if options.read_only {
        Connection::open_with_flags(
            &options.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    } else {
        Connection::open(&options.path)?
    };
    conn.busy_timeout(options.timeout)?;
    // Changing the journal mode needs write access.
    if !options.read_only {
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            &options.journal_mode,
            |row| row.get(0),
        )?;
        debug!(journal_mode = %mode, "journal mode set");
    }
    conn.pragma_update(None, "synchronous", "OFF")?;
    Ok(conn)
}

fn run(
    conn: Connection,
    options: &WorkerOptions,
    receiver: &Receiver<Request>,
    errors: &ErrorSlot,
) {
    let mut close_sink = None;
    // Ends on a close request or once every handle has been dropped.
    while let Ok(request) = receiver.recv() {
        match request {
            Request::Close { sink } => {
                close_sink = Some(sink);
                break;
            }
            Request::Commit { sink } => {
                if let Err(e) = commit(&conn) {
                    capture(errors, "COMMIT", e, None);
                }
                if let Some(sink) = sink {
                    let _ = sink.send(Response::Done);
                }
            }
            Request::Statement {
                query,
                sink,
                outer_stack,
            } => {
                if let Err(e) = execute(&conn, &query, sink.as_ref(), options.autocommit) {
                    capture(errors, &query.statement, e, outer_stack.as_ref());
                }
                if options.autocommit {
                    if let Err(e) = commit(&conn) {
                        capture(errors, "COMMIT", e, None);
                    }
                }
                if let Some(sink) = sink {
                    let _ = sink.send(Response::Done);
                }
            }
        }
    }

    debug!(path = %options.path.display(), "closing sqlite connection");
    if let Err((_, e)) = conn.close() {
        error!(path = %options.path.display(), error = %e, "failed to close sqlite connection");
    }
    if let Some(sink) = close_sink {
        let _ = sink.send(Response::Done);
    }
}

/// Run one statement and stream its rows to `sink`.
///
/// Returns how many rows were read from the cursor. Reading stops at the first row
/// the sink refuses.
fn execute(
    conn: &Connection,
    query: &SqlQuery,
    sink: Option<&Sender<Response>>,
    autocommit: bool,
) -> rusqlite::Result<usize> {
    if !autocommit && conn.is_autocommit() && query.is_data_modifying() {
        conn.execute_batch("BEGIN")?;
    }
    let mut stmt = conn.prepare(&query.statement)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(query.params.iter()))?;

    let Some(sink) = sink else {
        rows.next()?;
        return Ok(0);
    };
    let mut streamed = 0;
    while let Some(row) = rows.next()? {
        streamed += 1;
        let values = (0..column_count)
            .map(|i| row.get::<_, SqlValue>(i).map(Value::from))
            .collect::<rusqlite::Result<Row>>()?;
        if sink.send(Response::Row(values)).is_err() {
            debug!(statement = %query.statement, "result receiver dropped, abandoning remaining rows");
            break;
        }
    }
    Ok(streamed)
}

fn commit(conn: &Connection) -> rusqlite::Result<()> {
    if !conn.is_autocommit() {
        conn.execute_batch("COMMIT")?;
    }
    Ok(())
}

fn capture(
    errors: &ErrorSlot,
    statement: &str,
    source: rusqlite::Error,
    outer_stack: Option<&Backtrace>,
) {
    error!(statement = %statement, error = %source, "sqlite statement failed on worker thread");
    match outer_stack {
        Some(stack) => error!(
            "outer stack:\n{stack}\nthe error will be re-raised at the next call"
        ),
        None => error!(
            "unable to show the outer stack; enable capture_outer_stack to record it"
        ),
    }
    errors.store(CapturedError {
        statement: statement.to_string(),
        source,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn memory_worker() -> SqliteWorker {
        let worker = SqliteWorker::open(WorkerOptions::new(IN_MEMORY)).unwrap();
        worker
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        worker
    }

    fn count(worker: &SqliteWorker) -> i64 {
        worker
            .select_one("SELECT COUNT(*) FROM t")
            .unwrap()
            .and_then(|row| row[0].as_integer())
            .unwrap()
    }

    #[test]
    fn streams_rows_in_submission_order() {
        let worker = memory_worker();
        worker
            .executemany(
                "INSERT INTO t (name) VALUES (?)",
                ["a", "b", "c"].map(|name| Params::new().with_value(name)),
            )
            .unwrap();

        let names: Vec<String> = worker
            .select("SELECT name FROM t ORDER BY id")
            .map(|row| row.unwrap().remove(0).into_text().unwrap())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        worker.close(false).unwrap();
    }

    #[test]
    fn select_one_signals_no_row() {
        let worker = memory_worker();
        let row = worker
            .select_one(SqlQuery::new("SELECT name FROM t WHERE id = ?").with_params(Params::new().with_value(42)))
            .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn failure_is_reported_once_to_the_next_caller() {
        let worker = memory_worker();
        worker.execute("INSERT INTO missing VALUES (1)").unwrap();

        let err = worker.select_one("SELECT 1").unwrap_err();
        match err {
            Error::Deferred { statement, .. } => {
                assert_eq!(statement, "INSERT INTO missing VALUES (1)");
            }
            other => panic!("expected deferred error, got {other:?}"),
        }
        // Cleared once delivered.
        assert_eq!(count(&worker), 0);
    }

    #[test]
    fn failure_is_attributed_to_the_thread_that_observes_it() {
        let worker = Arc::new(memory_worker());
        worker.execute("INSERT INTO missing VALUES (1)").unwrap();

        let other = Arc::clone(&worker);
        let err = thread::Builder::new()
            .name("caller-b".to_string())
            .spawn(move || other.select_one("SELECT 1").unwrap_err())
            .unwrap()
            .join()
            .unwrap();
        match err {
            Error::Deferred { caller, .. } => assert_eq!(caller, "caller-b"),
            other => panic!("expected deferred error, got {other:?}"),
        }
        worker.check_and_clear().unwrap();
    }

    fn seeded_connection(rows: usize) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        for i in 0..rows {
            conn.execute("INSERT INTO t (name) VALUES (?)", [format!("n{i}")])
                .unwrap();
        }
        conn
    }

    #[test]
    fn dropped_receiver_stops_streaming_after_one_row() {
        let conn = seeded_connection(50);
        let query = SqlQuery::new("SELECT name FROM t ORDER BY id");

        let (sink, receiver) = unbounded();
        drop(receiver);
        assert_eq!(execute(&conn, &query, Some(&sink), true).unwrap(), 1);

        let (sink, receiver) = unbounded();
        assert_eq!(execute(&conn, &query, Some(&sink), true).unwrap(), 50);
        assert_eq!(receiver.try_iter().count(), 50);
    }

    #[test]
    fn failing_select_still_ends_its_stream() {
        let worker = memory_worker();
        match worker.select_one("SELECT * FROM nope") {
            Err(Error::Deferred { statement, .. }) => assert_eq!(statement, "SELECT * FROM nope"),
            other => panic!("expected deferred error, got {other:?}"),
        }
        let row = worker.select_one("SELECT 1").unwrap().unwrap();
        assert_eq!(row, vec![Value::Integer(1)]);
    }

    #[test]
    fn abandoned_select_does_not_block_later_requests() {
        let worker = memory_worker();
        for i in 0..200 {
            worker
                .execute(SqlQuery::new("INSERT INTO t (name) VALUES (?)").with_params(Params::new().with_value(format!("n{i}"))))
                .unwrap();
        }
        {
            let mut rows = worker.select("SELECT name FROM t ORDER BY id");
            assert!(rows.next().unwrap().is_ok());
        }
        assert_eq!(count(&worker), 200);
    }

    #[test]
    fn open_failure_is_synchronous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("db.sqlite");
        let err = SqliteWorker::open(WorkerOptions::new(&path)).err().unwrap();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn requests_after_close_are_rejected() {
        let worker = memory_worker();
        worker.close(false).unwrap();
        assert!(worker.is_closed());
        assert!(matches!(worker.execute("SELECT 1"), Err(Error::Closed)));
        assert!(matches!(worker.select_one("SELECT 1"), Err(Error::Closed)));
        worker.close(false).unwrap();
        worker.close(true).unwrap();
    }

    #[test]
    fn writes_stay_uncommitted_until_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deferred.db");
        let worker = SqliteWorker::open(WorkerOptions::new(&path)).unwrap();
        worker.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        worker.execute("INSERT INTO t (name) VALUES ('x')").unwrap();
        assert_eq!(count(&worker), 1);

        let outside = |path: &Path| -> i64 {
            let conn = Connection::open(path).unwrap();
            conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap()
        };
        assert_eq!(outside(&path), 0);

        worker.commit(true).unwrap();
        assert_eq!(outside(&path), 1);
        worker.close(false).unwrap();
    }

    #[test]
    fn read_only_worker_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.db");
        let writer = SqliteWorker::open(WorkerOptions::new(&path)).unwrap();
        writer.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        writer.close(false).unwrap();

        let reader = SqliteWorker::open(WorkerOptions::new(&path).with_read_only(true)).unwrap();
        assert_eq!(reader.path(), path.as_path());
        assert!(!reader.autocommit());
        assert_eq!(count(&reader), 0);

        reader.execute("INSERT INTO t (name) VALUES ('x')").unwrap();
        match reader.commit(true) {
            Err(Error::Deferred { statement, .. }) => assert!(statement.starts_with("INSERT")),
            other => panic!("expected deferred error, got {other:?}"),
        }
        reader.close(false).unwrap();
    }

    #[test]
    fn autocommit_commits_every_statement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autocommit.db");
        let worker = SqliteWorker::open(WorkerOptions::new(&path).with_autocommit(true)).unwrap();
        worker.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        worker.execute("INSERT INTO t (name) VALUES ('x')").unwrap();
        // Wait for the insert to be processed.
        assert_eq!(count(&worker), 1);

        let conn = Connection::open(&path).unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn concurrent_callers_share_one_order() {
        let worker = Arc::new(memory_worker());
        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                worker.execute("INSERT INTO t (id, name) VALUES (1, 'k')").unwrap();
                done_tx.send(()).unwrap();
            })
        };
        done_rx.recv().unwrap();
        let row = worker.select_one("SELECT name FROM t WHERE id = 1").unwrap().unwrap();
        assert_eq!(row[0], Value::Text("k".to_string()));
        writer.join().unwrap();
    }
}
