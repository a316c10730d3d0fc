//! Key and value codecs.
//!
//! Keys are stored as text in the `key` column and values as blobs in the `value`
//! column. A codec converts between the caller's types and those column types.

use std::fmt;
use std::marker::PhantomData;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts keys to and from the text stored in the `key` column.
pub trait KeyCodec<K>: Send + Sync {
    fn encode_key(&self, key: &K) -> anyhow::Result<String>;
    fn decode_key(&self, raw: String) -> anyhow::Result<K>;
}

/// Converts values to and from the bytes stored in the `value` column.
pub trait ValueCodec<V>: Send + Sync {
    fn encode_value(&self, value: &V) -> anyhow::Result<Vec<u8>>;
    fn decode_value(&self, raw: Vec<u8>) -> anyhow::Result<V>;
}

/// Stores string keys unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKey;

impl KeyCodec<String> for StringKey {
    fn encode_key(&self, key: &String) -> anyhow::Result<String> {
        Ok(key.clone())
    }

    fn decode_key(&self, raw: String) -> anyhow::Result<String> {
        Ok(raw)
    }
}

/// Stores any serde key as its JSON text.
pub struct JsonKey<K>(PhantomData<fn() -> K>);

impl<K> JsonKey<K> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for JsonKey<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for JsonKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonKey")
    }
}

impl<K: Serialize + DeserializeOwned> KeyCodec<K> for JsonKey<K> {
    fn encode_key(&self, key: &K) -> anyhow::Result<String> {
        serde_json::to_string(key).context("encoding key as JSON")
    }

    fn decode_key(&self, raw: String) -> anyhow::Result<K> {
        serde_json::from_str(&raw).with_context(|| format!("decoding JSON key {raw:?}"))
    }
}

/// Stores byte values unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawValue;

impl ValueCodec<Vec<u8>> for RawValue {
    fn encode_value(&self, value: &Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode_value(&self, raw: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(raw)
    }
}

/// Stores any serde value as JSON bytes.
pub struct JsonValue<V>(PhantomData<fn() -> V>);

impl<V> JsonValue<V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for JsonValue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for JsonValue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonValue")
    }
}

impl<V: Serialize + DeserializeOwned> ValueCodec<V> for JsonValue<V> {
    fn encode_value(&self, value: &V) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(value).context("encoding value as JSON")
    }

    fn decode_value(&self, raw: Vec<u8>) -> anyhow::Result<V> {
        serde_json::from_slice(&raw)
            .with_context(|| format!("decoding {}-byte JSON value", raw.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn json_key_accepts_structured_keys() {
        let codec = JsonKey::<(u32, String)>::new();
        let encoded = codec.encode_key(&(7, "seven".to_string())).unwrap();
        assert_eq!(encoded, r#"[7,"seven"]"#);
        assert_eq!(codec.decode_key(encoded).unwrap(), (7, "seven".to_string()));
    }

    #[test]
    fn json_value_reports_corrupt_bytes() {
        let codec = JsonValue::<BTreeMap<String, i64>>::new();
        let err = codec.decode_value(b"{not json".to_vec()).unwrap_err();
        assert!(format!("{err:#}").contains("decoding 9-byte JSON value"));
    }
}
