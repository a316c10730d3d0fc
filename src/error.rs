//! Error types for the SQLite dictionary.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure surfaced by the store, the worker or the dictionary façade.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters (unknown flag, missing directory, missing table
    /// in read-only mode).
    #[error("configuration error: {0}")]
    Config(String),

    /// Lookup or delete of a key that is not stored.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A mutating operation was attempted on a read-only store.
    #[error("refusing to {0} a read-only store")]
    ReadOnly(&'static str),

    /// The worker could not open its connection.
    #[error("failed to open database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// A statement failed on the worker thread; reported to whichever caller
    /// interacted with the worker next.
    #[error("statement `{statement}` failed earlier (reported on thread {caller}): {source}")]
    Deferred {
        caller: String,
        statement: String,
        source: rusqlite::Error,
    },

    /// Direct SQLite failures outside the worker (schema catalogue lookups).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or value codec failure.
    #[error("codec error: {0:#}")]
    Codec(#[from] anyhow::Error),

    /// The worker has been closed; no further requests are accepted.
    #[error("database worker is closed")]
    Closed,

    /// A result row did not have the shape the caller expected.
    #[error("unexpected row: {0}")]
    UnexpectedRow(String),
}

impl Error {
    /// True for the not-found signal raised by lookups and deletes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound(_))
    }
}
