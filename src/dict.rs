//! Persistent dictionary over one SQLite table.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{JsonValue, KeyCodec, StringKey, ValueCodec};
use crate::config::{Flag, StoreConfig};
use crate::error::{Error, Result};
use crate::mapping::KeyValueMap;
use crate::sqlite::{quote_identifier, Params, Row, SchemaExtension, SqlQuery, TableDefinition, Value};
use crate::store::SqliteDb;
use crate::worker::Rows;

/// A dictionary persisted in one table of a SQLite database.
///
/// All statements go through the store's single worker thread, so one instance can be
/// shared between threads (for example behind an `Arc`).
///
/// Without autocommit, writes become durable only after [`commit`](Self::commit).
pub struct SqliteDict<K, V> {
    db: SqliteDb,
    table: TableDefinition,
    quoted: String,
    key_codec: Box<dyn KeyCodec<K>>,
    value_codec: Box<dyn ValueCodec<V>>,
}

impl<V> SqliteDict<String, V>
where
    V: Serialize + DeserializeOwned + 'static,
{
    /// Open a dictionary with string keys and JSON-encoded values.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::with_codecs(config, StringKey, JsonValue::new())
    }
}

impl<K, V> SqliteDict<K, V> {
    pub fn with_codecs(
        config: StoreConfig,
        key_codec: impl KeyCodec<K> + 'static,
        value_codec: impl ValueCodec<V> + 'static,
    ) -> Result<Self> {
        Self::with_schema(config, &SchemaExtension::default(), key_codec, value_codec)
    }

    /// Open a dictionary whose table carries extra columns and indexes on top of
    /// the standard `key`/`value` layout.
    pub fn with_schema(
        config: StoreConfig,
        extension: &SchemaExtension,
        key_codec: impl KeyCodec<K> + 'static,
        value_codec: impl ValueCodec<V> + 'static,
    ) -> Result<Self> {
        let table = TableDefinition::key_value(config.tablename.clone()).merge(extension);
        let flag = config.flag;
        let db = SqliteDb::open(config)?;
        let dict = Self {
            quoted: quote_identifier(&table.name),
            db,
            table,
            key_codec: Box::new(key_codec),
            value_codec: Box::new(value_codec),
        };

        if flag.is_read_only() {
            if !dict.db.table_names()?.contains(&dict.table.name) {
                return Err(Error::Config(format!(
                    "refusing to create a new table {:?} in read-only mode",
                    dict.table.name
                )));
            }
        } else {
            dict.create_table()?;
            dict.create_indexes()?;
            if dict.db.autocommit() {
                dict.db.commit(true)?;
            }
        }
        if flag == Flag::WriteFresh {
            dict.clear()?;
        }
        debug!(table = %dict.table.name, flag = %flag, "sqlite dict ready");
        Ok(dict)
    }

    pub fn tablename(&self) -> &str {
        &self.table.name
    }

    pub fn table(&self) -> &TableDefinition {
        &self.table
    }

    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    /// Create the table if it does not exist yet. Does nothing in read-only mode.
    pub fn create_table(&self) -> Result<()> {
        if self.db.flag().is_read_only() {
            return Ok(());
        }
        self.db.worker().execute(self.table.create_table_sql())
    }

    /// Create the declared indexes if they do not exist yet. Does nothing in
    /// read-only mode.
    pub fn create_indexes(&self) -> Result<()> {
        if self.db.flag().is_read_only() {
            return Ok(());
        }
        for sql in self.table.create_index_sql() {
            self.db.worker().execute(sql)?;
        }
        Ok(())
    }

    /// Value stored under `key`, or `None` when the key is absent.
    pub fn get_or_none(&self, key: &K) -> Result<Option<V>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lazily iterate keys in insertion order.
    pub fn iter_keys(&self) -> Keys<'_, K> {
        Keys {
            rows: self.select_all("key"),
            codec: &*self.key_codec,
        }
    }

    pub fn iter_values(&self) -> Values<'_, V> {
        Values {
            rows: self.select_all("value"),
            codec: &*self.value_codec,
        }
    }

    pub fn iter_items(&self) -> Items<'_, K, V> {
        Items {
            rows: self.select_all("key, value"),
            key_codec: &*self.key_codec,
            value_codec: &*self.value_codec,
        }
    }

    pub fn commit(&self, blocking: bool) -> Result<()> {
        self.db.commit(blocking)
    }

    pub fn sync(&self) -> Result<()> {
        self.db.sync()
    }

    pub fn close(&self, force: bool) -> Result<()> {
        self.db.close(force)
    }

    /// Close the dictionary and delete its database file.
    pub fn terminate(&self) -> Result<()> {
        self.db.terminate()
    }

    fn select_all(&self, columns: &str) -> Rows<'_> {
        self.db
            .worker()
            .select(format!("SELECT {columns} FROM {} ORDER BY rowid", self.quoted))
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        if self.db.flag().is_read_only() {
            return Err(Error::ReadOnly(operation));
        }
        Ok(())
    }

    fn commit_if_autocommit(&self) -> Result<()> {
        if self.db.autocommit() {
            self.db.commit(true)?;
        }
        Ok(())
    }

    fn key_query(&self, statement: String, encoded_key: String) -> SqlQuery {
        SqlQuery::new(statement).with_params(Params::new().with_value(encoded_key))
    }

    fn encode_pair(&self, key: &K, value: &V) -> Result<Params> {
        Ok(Params::new()
            .with_value(self.key_codec.encode_key(key)?)
            .with_value(self.value_codec.encode_value(value)?))
    }

    fn scalar(&self, statement: String) -> Result<Value> {
        let row = self.db.worker().select_one(statement)?;
        Ok(row.and_then(|row| row.into_iter().next()).unwrap_or(Value::Null))
    }
}

impl<K, V> KeyValueMap<K, V> for SqliteDict<K, V> {
    fn len(&self) -> Result<usize> {
        let count = self.scalar(format!("SELECT COUNT(*) FROM {}", self.quoted))?;
        match count {
            Value::Null => Ok(0),
            value => value
                .as_integer()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::UnexpectedRow(format!("invalid row count {value:?}"))),
        }
    }

    fn is_empty(&self) -> Result<bool> {
        // MAX(ROWID) is answered from the b-tree edge instead of a full count.
        let max = self.scalar(format!("SELECT MAX(ROWID) FROM {}", self.quoted))?;
        Ok(max.is_null())
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        let encoded = self.key_codec.encode_key(key)?;
        let query = self.key_query(format!("SELECT 1 FROM {} WHERE key = ?", self.quoted), encoded);
        Ok(self.db.worker().select_one(query)?.is_some())
    }

    fn get(&self, key: &K) -> Result<V> {
        let encoded = self.key_codec.encode_key(key)?;
        let query = self.key_query(
            format!("SELECT value FROM {} WHERE key = ?", self.quoted),
            encoded.clone(),
        );
        match self.db.worker().select_one(query)? {
            Some(row) => decode_value(&*self.value_codec, row),
            None => Err(Error::KeyNotFound(encoded)),
        }
    }

    fn set(&self, key: &K, value: &V) -> Result<()> {
        self.ensure_writable("write to")?;
        let query = SqlQuery::new(format!(
            "REPLACE INTO {} (key, value) VALUES (?, ?)",
            self.quoted
        ))
        .with_params(self.encode_pair(key, value)?);
        self.db.worker().execute(query)?;
        self.commit_if_autocommit()
    }

    fn delete(&self, key: &K) -> Result<()> {
        self.ensure_writable("delete from")?;
        let encoded = self.key_codec.encode_key(key)?;
        if !self.contains_key(key)? {
            return Err(Error::KeyNotFound(encoded));
        }
        let query = self.key_query(format!("DELETE FROM {} WHERE key = ?", self.quoted), encoded);
        self.db.worker().execute(query)?;
        self.commit_if_autocommit()
    }

    fn update<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.ensure_writable("update")?;
        let params = items
            .into_iter()
            .map(|(key, value)| self.encode_pair(&key, &value))
            .collect::<Result<Vec<_>>>()?;
        self.db.worker().executemany(
            &format!("REPLACE INTO {} (key, value) VALUES (?, ?)", self.quoted),
            params,
        )?;
        self.commit_if_autocommit()
    }

    fn clear(&self) -> Result<()> {
        self.ensure_writable("clear")?;
        // Commit on both sides so the delete lands as one unit.
        self.db.commit(true)?;
        self.db
            .worker()
            .execute(format!("DELETE FROM {}", self.quoted))?;
        self.db.commit(true)
    }

    fn keys(&self) -> Result<Vec<K>> {
        self.iter_keys().collect()
    }

    fn values(&self) -> Result<Vec<V>> {
        self.iter_values().collect()
    }

    fn items(&self) -> Result<Vec<(K, V)>> {
        self.iter_items().collect()
    }
}

impl<'a, K, V> IntoIterator for &'a SqliteDict<K, V> {
    type Item = Result<K>;
    type IntoIter = Keys<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_keys()
    }
}

impl<K, V> fmt::Debug for SqliteDict<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDict")
            .field("path", &self.db.path())
            .field("table", &self.table.name)
            .field("flag", &self.db.flag())
            .finish()
    }
}

/// Keys of a [`SqliteDict`] in insertion order.
pub struct Keys<'a, K> {
    rows: Rows<'a>,
    codec: &'a dyn KeyCodec<K>,
}

impl<K> Iterator for Keys<'_, K> {
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.and_then(|row| decode_key(self.codec, row)))
    }
}

/// Values of a [`SqliteDict`] in insertion order.
pub struct Values<'a, V> {
    rows: Rows<'a>,
    codec: &'a dyn ValueCodec<V>,
}

impl<V> Iterator for Values<'_, V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.and_then(|row| decode_value(self.codec, row)))
    }
}

/// Key-value pairs of a [`SqliteDict`] in insertion order.
pub struct Items<'a, K, V> {
    rows: Rows<'a>,
    key_codec: &'a dyn KeyCodec<K>,
    value_codec: &'a dyn ValueCodec<V>,
}

impl<K, V> Iterator for Items<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(row.and_then(|row| {
            let mut columns = row.into_iter();
            let (Some(key), Some(value)) = (columns.next(), columns.next()) else {
                return Err(Error::UnexpectedRow("expected key and value columns".to_string()));
            };
            Ok((
                decode_key(self.key_codec, vec![key])?,
                decode_value(self.value_codec, vec![value])?,
            ))
        }))
    }
}

fn decode_key<K>(codec: &dyn KeyCodec<K>, row: Row) -> Result<K> {
    let raw = row
        .into_iter()
        .next()
        .and_then(Value::into_text)
        .ok_or_else(|| Error::UnexpectedRow("key column is not text".to_string()))?;
    Ok(codec.decode_key(raw)?)
}

fn decode_value<V>(codec: &dyn ValueCodec<V>, row: Row) -> Result<V> {
    let raw = row
        .into_iter()
        .next()
        .and_then(Value::into_bytes)
        .ok_or_else(|| Error::UnexpectedRow("value column is not a blob".to_string()))?;
    Ok(codec.decode_value(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonKey, RawValue};
    use crate::sqlite::{ColumnDefinition, DataType, DefaultValue};

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn create_table_and_indexes_are_idempotent() {
        let dict = SqliteDict::<String, i64>::open(StoreConfig::in_memory()).unwrap();
        dict.set(&key("a"), &1).unwrap();
        for _ in 0..3 {
            dict.create_table().unwrap();
            dict.create_indexes().unwrap();
        }
        assert_eq!(dict.len().unwrap(), 1);
        assert_eq!(dict.get(&key("a")).unwrap(), 1);
    }

    #[test]
    fn get_or_none_maps_not_found() {
        let dict = SqliteDict::<String, i64>::open(StoreConfig::in_memory()).unwrap();
        assert_eq!(dict.get_or_none(&key("missing")).unwrap(), None);
        dict.set(&key("x"), &9).unwrap();
        assert_eq!(dict.get_or_none(&key("x")).unwrap(), Some(9));
    }

    #[test]
    fn custom_codecs() {
        let dict = SqliteDict::<(i32, i32), Vec<u8>>::with_codecs(
            StoreConfig::in_memory(),
            JsonKey::<(i32, i32)>::new(),
            RawValue,
        )
        .unwrap();
        dict.set(&(1, 2), &b"bytes".to_vec()).unwrap();
        assert_eq!(dict.get(&(1, 2)).unwrap(), b"bytes".to_vec());
        assert_eq!(dict.keys().unwrap(), vec![(1, 2)]);
    }

    #[test]
    fn extra_columns_are_created_and_indexed() {
        let extension = SchemaExtension::new()
            .with_column(
                ColumnDefinition::new("hits", DataType::Integer)
                    .with_default(DefaultValue::Integer(0)),
            )
            .with_index("hits");
        let dict = SqliteDict::<String, String>::with_schema(
            StoreConfig::in_memory().with_tablename("counted"),
            &extension,
            StringKey,
            JsonValue::new(),
        )
        .unwrap();
        assert_eq!(dict.tablename(), "counted");
        let columns: Vec<_> = dict.table().columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, ["key", "value", "hits"]);
        dict.set(&key("k"), &"v".to_string()).unwrap();

        let hits = dict
            .db()
            .worker()
            .select_one("SELECT hits FROM \"counted\" WHERE key = 'k'")
            .unwrap()
            .unwrap();
        assert_eq!(hits, vec![Value::Integer(0)]);

        let index = dict
            .db()
            .worker()
            .select_one("SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'idx_counted_hits'")
            .unwrap();
        assert!(index.is_some());
    }

    #[test]
    fn iterating_a_reference_yields_keys() {
        let dict = SqliteDict::<String, i64>::open(StoreConfig::in_memory()).unwrap();
        dict.update(vec![(key("one"), 1), (key("two"), 2)]).unwrap();
        let keys: Vec<String> = (&dict).into_iter().map(Result::unwrap).collect();
        assert_eq!(keys, ["one", "two"]);
    }

    #[test]
    fn operations_after_close_fail() {
        let dict = SqliteDict::<String, i64>::open(StoreConfig::in_memory()).unwrap();
        dict.close(false).unwrap();
        assert!(matches!(dict.get(&key("a")), Err(Error::Closed)));
        assert!(matches!(dict.len(), Err(Error::Closed)));
    }
}
