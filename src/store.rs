//! Store lifecycle: backing file handling, commit, close and termination.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::config::{Flag, StoreConfig, IN_MEMORY};
use crate::error::{Error, Result};
use crate::sqlite::Row;
use crate::worker::{SqliteWorker, WorkerOptions};

const GET_TABLENAMES: &str = "SELECT name FROM sqlite_master WHERE type = 'table'";

/// One open database and the worker that owns its connection.
pub struct SqliteDb {
    worker: SqliteWorker,
    config: StoreConfig,
    path: PathBuf,
    in_temp: bool,
}

impl SqliteDb {
    /// Open the database described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let in_temp = config.filename.is_none();
        let path = match &config.filename {
            Some(path) => path.clone(),
            None => create_temp_file()?,
        };

        if path != Path::new(IN_MEMORY) {
            if config.flag == Flag::New && path.exists() {
                debug!(path = %path.display(), "removing existing database for new store");
                fs::remove_file(&path)?;
            }
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                if !dir.exists() {
                    return Err(Error::Config(format!(
                        "the directory does not exist: {}",
                        dir.display()
                    )));
                }
            }
            if config.flag.is_read_only() && !path.is_file() {
                return Err(missing_file(&path));
            }
        }

        let worker = match SqliteWorker::open(WorkerOptions::from_config(&config, &path)) {
            Ok(worker) => worker,
            Err(e) => {
                if in_temp {
                    remove_quietly(&path);
                }
                return Err(e);
            }
        };
        debug!(path = %path.display(), flag = %config.flag, table = %config.tablename, "opened sqlite store");
        Ok(Self {
            worker,
            config,
            path,
            in_temp,
        })
    }

    pub fn worker(&self) -> &SqliteWorker {
        &self.worker
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flag(&self) -> Flag {
        self.config.flag
    }

    pub fn autocommit(&self) -> bool {
        self.config.autocommit
    }

    /// True when the store lives in a temporary file removed on close.
    pub fn is_temporary(&self) -> bool {
        self.in_temp
    }

    pub fn is_closed(&self) -> bool {
        self.worker.is_closed()
    }

    /// Names of every table in the database, read through the worker.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.worker
            .select(GET_TABLENAMES)
            .map(|row| row.and_then(text_column))
            .collect()
    }

    pub fn commit(&self, blocking: bool) -> Result<()> {
        self.worker.commit(blocking)
    }

    /// Alias for a blocking [`commit`](Self::commit).
    pub fn sync(&self) -> Result<()> {
        self.commit(true)
    }

    /// Close the worker. With autocommit on, a regular close commits first.
    ///
    /// A temporary backing file is removed afterwards; removal failures are ignored.
    pub fn close(&self, force: bool) -> Result<()> {
        let committed = if self.config.autocommit && !force && !self.worker.is_closed() {
            self.worker.commit(true)
        } else {
            Ok(())
        };
        let closed = self.worker.close(force);
        if self.in_temp {
            remove_quietly(&self.path);
        }
        committed.and(closed)
    }

    /// Close the store and delete its backing file.
    pub fn terminate(&self) -> Result<()> {
        if self.config.flag.is_read_only() {
            return Err(Error::ReadOnly("terminate"));
        }
        self.close(false)?;
        if self.path == Path::new(IN_MEMORY) {
            return Ok(());
        }
        if self.path.is_file() {
            remove_quietly(&self.path);
        }
        Ok(())
    }
}

impl Drop for SqliteDb {
    fn drop(&mut self) {
        if self.worker.is_closed() && !self.in_temp {
            return;
        }
        if let Err(e) = self.close(true) {
            debug!(path = %self.path.display(), error = %e, "ignoring error while dropping store");
        }
    }
}

/// Names of every table in the database file at `path`, read on a separate
/// read-only connection.
pub fn get_tablenames(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(missing_file(path));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare(GET_TABLENAMES)?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn text_column(row: Row) -> Result<String> {
    row.into_iter()
        .next()
        .and_then(|value| value.into_text())
        .ok_or_else(|| Error::UnexpectedRow("expected a text column".to_string()))
}

fn missing_file(path: &Path) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("file {} does not exist", path.display()),
    ))
}

fn create_temp_file() -> Result<PathBuf> {
    let file = tempfile::Builder::new().prefix("sqldict").tempfile()?;
    let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
    Ok(path)
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed database file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove database file"),
    }
}
