//! Persistent, thread-safe key-value mapping backed by SQLite.
//!
//! # Intention
//!
//! - Let any number of threads share one SQLite database even though a connection
//!   supports a single writer at a time.
//! - Present a dictionary-style API ([`SqliteDict`], [`KeyValueMap`]) on top of it.
//!
//! # Architectural Boundaries
//!
//! - [`worker`]: the background thread owning the connection and the request protocol.
//! - [`store`]: backing file lifecycle (temporary files, read-only guard, termination).
//! - [`dict`]: the key-value façade, expressed purely as SQL submitted to the worker.
//! - Serialization of keys and values is pluggable through [`codec`].
//!
//! ```no_run
//! use sqlite_dict::{KeyValueMap, SqliteDict, StoreConfig};
//!
//! let dict = SqliteDict::<String, i64>::open(StoreConfig::new("example.db").with_tablename("t"))?;
//! dict.set(&"a".to_string(), &1)?;
//! assert_eq!(dict.get(&"a".to_string())?, 1);
//! dict.commit(true)?;
//! # Ok::<(), sqlite_dict::Error>(())
//! ```

pub mod codec;
pub mod config;
pub mod dict;
pub mod error;
pub mod mapping;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use codec::{JsonKey, JsonValue, KeyCodec, RawValue, StringKey, ValueCodec};
pub use config::{Flag, StoreConfig, IN_MEMORY};
pub use dict::{Items, Keys, SqliteDict, Values};
pub use error::{Error, Result};
pub use mapping::KeyValueMap;
pub use sqlite::{
    ColumnConstraint, ColumnDefinition, DataType, DefaultValue, IndexDefinition, Params, Row,
    SchemaExtension, SqlQuery, TableDefinition, Value,
};
pub use store::{get_tablenames, SqliteDb};
pub use worker::{Rows, SqliteWorker, WorkerOptions};
