//! Construction parameters for a store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filename that selects an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// How the backing file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Flag {
    /// Open for reading and writing, creating the file and table if missing.
    #[default]
    #[serde(rename = "c")]
    Create,
    /// Open an existing table for reading only.
    #[serde(rename = "r")]
    ReadOnly,
    /// Open for reading and writing, dropping every existing row of the table.
    #[serde(rename = "w")]
    WriteFresh,
    /// Delete any existing file and start from an empty database.
    #[serde(rename = "n")]
    New,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Create => "c",
            Flag::ReadOnly => "r",
            Flag::WriteFresh => "w",
            Flag::New => "n",
        }
    }

    pub fn is_read_only(self) -> bool {
        self == Flag::ReadOnly
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "c" => Ok(Flag::Create),
            "r" => Ok(Flag::ReadOnly),
            "w" => Ok(Flag::WriteFresh),
            "n" => Ok(Flag::New),
            other => Err(Error::Config(format!("unrecognized flag: {other:?}"))),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file; `None` backs the store with a temporary file
    /// that is removed on close.
    pub filename: Option<PathBuf>,
    /// Table holding this mapping.
    pub tablename: String,
    pub flag: Flag,
    /// Commit after every write instead of waiting for an explicit commit.
    pub autocommit: bool,
    /// Passed through to `PRAGMA journal_mode`.
    pub journal_mode: String,
    /// How long a statement waits on a locked database.
    pub timeout: Duration,
    /// Capture the submitting thread's backtrace with every statement so that a
    /// failure can be logged with its origin.
    ///
    /// On by default. The stack is walked for every submitted statement, including
    /// each item of an `executemany` batch, so turn this off for bulk loads.
    pub capture_outer_stack: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            filename: None,
            tablename: "unnamed".to_string(),
            flag: Flag::Create,
            autocommit: false,
            journal_mode: "DELETE".to_string(),
            timeout: Duration::from_secs(5),
            capture_outer_stack: true,
        }
    }
}

impl StoreConfig {
    /// Create a config for the file at `filename`
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    /// Config backed by a temporary file.
    pub fn temporary() -> Self {
        Self::default()
    }

    pub fn with_tablename(mut self, tablename: impl Into<String>) -> Self {
        self.tablename = tablename.into();
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn with_journal_mode(mut self, journal_mode: impl Into<String>) -> Self {
        self.journal_mode = journal_mode.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capture_outer_stack(mut self, capture: bool) -> Self {
        self.capture_outer_stack = capture;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.filename.as_deref() == Some(Path::new(IN_MEMORY))
    }
}
