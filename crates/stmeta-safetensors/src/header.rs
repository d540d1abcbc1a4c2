//! Header decoding, duplicate-key detection, and deterministic re-serialization.
//!
//! Decoding runs in two passes over the same bytes. The first pass walks the
//! top-level object and records every key occurrence, because a plain JSON
//! parse keeps only the last value of a repeated key. Only a header with
//! unique keys reaches the second, structural pass.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::de::{Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stmeta_core::{FormatError, Metadata, Result, TensorDescriptor, METADATA_KEY};
use tracing::warn;

/// Decoded header: tensor descriptors in source order plus optional metadata.
///
/// A `Header` is an immutable snapshot. Edits go through
/// [`Header::with_metadata`], which returns a new value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    tensors: Vec<TensorDescriptor>,
    index: HashMap<String, usize>,
    metadata: Option<Metadata>,
    /// Number of tensors that precede `__metadata__` in the source.
    metadata_position: usize,
}

impl Header {
    /// Decode raw header bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_duplicate_keys(bytes)?;

        let entries: IndexMap<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| FormatError::MalformedJson(e.to_string()))?;

        let mut header = Self::default();
        for (key, value) in entries {
            if key == METADATA_KEY {
                header.metadata = Some(decode_metadata(value)?);
                header.metadata_position = header.tensors.len();
            } else {
                let descriptor = decode_descriptor(key, value)?;
                header.push(descriptor);
            }
        }
        if header.metadata.is_none() {
            header.metadata_position = header.tensors.len();
        }
        Ok(header)
    }

    fn push(&mut self, descriptor: TensorDescriptor) {
        self.index
            .insert(descriptor.name.clone(), self.tensors.len());
        self.tensors.push(descriptor);
    }

    /// Tensor descriptors in header order, excluding `__metadata__`.
    pub fn tensors(&self) -> &[TensorDescriptor] {
        &self.tensors
    }

    /// Look up one tensor.
    pub fn get(&self, name: &str) -> Option<&TensorDescriptor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    /// Tensor names in header order.
    pub fn names(&self) -> Vec<&str> {
        self.tensors.iter().map(|t| t.name.as_str()).collect()
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the header describes no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The `__metadata__` entry, if present.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Copy of this header with `__metadata__` replaced, removed, or kept.
    ///
    /// Tensor descriptors are carried over untouched. A replaced entry keeps
    /// its original position; a newly added one goes after the tensors.
    #[must_use]
    pub fn with_metadata(&self, update: &MetadataUpdate) -> Self {
        let mut next = self.clone();
        match update {
            MetadataUpdate::Keep => {}
            MetadataUpdate::Remove => {
                next.metadata = None;
                next.metadata_position = next.tensors.len();
            }
            MetadataUpdate::Replace(metadata) => {
                if next.metadata.is_none() {
                    next.metadata_position = next.tensors.len();
                }
                next.metadata = Some(metadata.clone());
            }
        }
        next
    }

    /// Compact JSON encoding with keys in header order.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FormatError::MalformedJson(e.to_string()))
    }
}

#[derive(Serialize)]
struct DescriptorRepr<'a> {
    dtype: &'a str,
    shape: &'a [u64],
    data_offsets: [u64; 2],
}

impl<'a> From<&'a TensorDescriptor> for DescriptorRepr<'a> {
    fn from(t: &'a TensorDescriptor) -> Self {
        Self {
            dtype: &t.dtype,
            shape: &t.shape,
            data_offsets: [t.offset_start, t.offset_end],
        }
    }
}

impl Serialize for Header {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.tensors.len() + usize::from(self.metadata.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        let position = self.metadata_position.min(self.tensors.len());

        for (i, tensor) in self.tensors.iter().enumerate() {
            if i == position {
                if let Some(metadata) = &self.metadata {
                    map.serialize_entry(METADATA_KEY, metadata)?;
                }
            }
            map.serialize_entry(&tensor.name, &DescriptorRepr::from(tensor))?;
        }
        if position == self.tensors.len() {
            if let Some(metadata) = &self.metadata {
                map.serialize_entry(METADATA_KEY, metadata)?;
            }
        }
        map.end()
    }
}

/// Requested change to the `__metadata__` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// Leave the entry as it is.
    Keep,
    /// Drop the entry entirely.
    Remove,
    /// Replace the entry.
    Replace(Metadata),
}

impl MetadataUpdate {
    /// Build an update from an optional JSON value.
    ///
    /// `None` keeps the current metadata. `null` and empty objects, arrays,
    /// or strings remove it. A non-empty object becomes a string map with
    /// every value coerced to a string; any other value becomes a single
    /// string.
    pub fn from_json(value: Option<Value>) -> Self {
        let Some(value) = value else {
            return Self::Keep;
        };
        match value {
            Value::Null => Self::Remove,
            Value::Object(map) if map.is_empty() => Self::Remove,
            Value::Array(items) if items.is_empty() => Self::Remove,
            Value::String(text) if text.is_empty() => Self::Remove,
            Value::Object(map) => Self::Replace(Metadata::Map(
                map.into_iter()
                    .map(|(k, v)| (k, coerce_to_string(v)))
                    .collect(),
            )),
            other => Self::Replace(Metadata::Text(coerce_to_string(other))),
        }
    }

    /// Build an update from a string map; an empty map removes the entry.
    pub fn from_map(map: IndexMap<String, String>) -> Self {
        if map.is_empty() {
            Self::Remove
        } else {
            Self::Replace(Metadata::Map(map))
        }
    }
}

/// Strings pass through; everything else becomes compact JSON text.
fn coerce_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Top-level keys in source order, repeats included.
struct TopLevelKeys(Vec<String>);

impl<'de> Deserialize<'de> for TopLevelKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(KeysVisitor)
    }
}

struct KeysVisitor;

impl<'de> Visitor<'de> for KeysVisitor {
    type Value = TopLevelKeys;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut keys = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(key) = map.next_key::<String>()? {
            map.next_value::<IgnoredAny>()?;
            keys.push(key);
        }
        Ok(TopLevelKeys(keys))
    }
}

/// Fail with every top-level key that occurs more than once.
pub fn check_duplicate_keys(bytes: &[u8]) -> Result<()> {
    let TopLevelKeys(keys) =
        serde_json::from_slice(bytes).map_err(|e| FormatError::MalformedJson(e.to_string()))?;

    let mut counts: IndexMap<String, usize> = IndexMap::with_capacity(keys.len());
    for key in keys {
        *counts.entry(key).or_insert(0) += 1;
    }

    let duplicates: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
    if duplicates.is_empty() {
        Ok(())
    } else {
        for (key, count) in &duplicates {
            warn!(key = %key, count, "duplicate key in header");
        }
        Err(FormatError::DuplicateKeys(duplicates))
    }
}

fn invalid(key: &str, field: &'static str, reason: impl Into<String>) -> FormatError {
    FormatError::InvalidField {
        key: key.to_string(),
        field,
        reason: reason.into(),
    }
}

fn decode_descriptor(name: String, value: Value) -> Result<TensorDescriptor> {
    let Value::Object(fields) = value else {
        return Err(invalid(&name, "entry", "expected an object"));
    };

    let field = |field: &'static str| {
        fields.get(field).ok_or_else(|| FormatError::MissingField {
            key: name.clone(),
            field,
        })
    };

    let dtype = field("dtype")?
        .as_str()
        .ok_or_else(|| invalid(&name, "dtype", "expected a string"))?
        .to_string();

    let shape = field("shape")?
        .as_array()
        .and_then(|dims| dims.iter().map(Value::as_u64).collect::<Option<Vec<_>>>())
        .ok_or_else(|| invalid(&name, "shape", "expected an array of non-negative integers"))?;

    let offsets = field("data_offsets")?
        .as_array()
        .and_then(|pair| pair.iter().map(Value::as_u64).collect::<Option<Vec<_>>>())
        .ok_or_else(|| {
            invalid(
                &name,
                "data_offsets",
                "expected an array of non-negative integers",
            )
        })?;
    let [offset_start, offset_end] = offsets[..] else {
        return Err(invalid(
            &name,
            "data_offsets",
            format!("expected 2 elements, found {}", offsets.len()),
        ));
    };
    if offset_end < offset_start {
        return Err(invalid(
            &name,
            "data_offsets",
            format!("end {offset_end} is before start {offset_start}"),
        ));
    }

    Ok(TensorDescriptor {
        name,
        dtype,
        shape,
        offset_start,
        offset_end,
    })
}

fn decode_metadata(value: Value) -> Result<Metadata> {
    match value {
        Value::Object(map) => Ok(Metadata::Map(
            map.into_iter()
                .map(|(key, value)| {
                    if !value.is_string() {
                        warn!(key = %key, "non-string metadata value coerced to string");
                    }
                    (key, coerce_to_string(value))
                })
                .collect(),
        )),
        Value::String(text) => Ok(Metadata::Text(text)),
        _ => Err(invalid(
            METADATA_KEY,
            "value",
            "expected an object of strings",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{"t":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},"__metadata__":{"k":"v"}}"#;

    #[test]
    fn test_decode_sample() {
        let header = Header::decode(SAMPLE.as_bytes()).unwrap();
        assert_eq!(header.names(), vec!["t"]);
        let t = header.get("t").unwrap();
        assert_eq!(t.dtype, "F32");
        assert_eq!(t.shape, vec![2, 2]);
        assert_eq!((t.offset_start, t.offset_end), (0, 16));
        assert_eq!(header.metadata().and_then(|m| m.get("k")), Some("v"));
    }

    #[test]
    fn test_preserves_source_order() {
        let raw = r#"{"z":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"a":{"dtype":"U8","shape":[1],"data_offsets":[1,2]},"m":{"dtype":"U8","shape":[1],"data_offsets":[2,3]}}"#;
        let header = Header::decode(raw.as_bytes()).unwrap();
        assert_eq!(header.names(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_duplicate_keys_reported() {
        let raw = r#"{"a":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"b":{"dtype":"U8","shape":[1],"data_offsets":[1,2]},"a":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"b":{},"b":{}}"#;
        let err = Header::decode(raw.as_bytes()).unwrap_err();
        match err {
            FormatError::DuplicateKeys(keys) => {
                assert_eq!(keys, vec![("a".to_string(), 2), ("b".to_string(), 3)]);
            }
            other => panic!("expected DuplicateKeys, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_metadata_key() {
        let raw = r#"{"__metadata__":{"a":"1"},"__metadata__":{"a":"2"}}"#;
        let err = Header::decode(raw.as_bytes()).unwrap_err();
        assert_eq!(err.duplicate_keys(), Some(vec!["__metadata__"]));
    }

    #[test]
    fn test_malformed_json() {
        let cases: [&[u8]; 4] = [b"{\"a\":", b"[1,2]", b"not json", b"\xff\xfe"];
        for raw in cases {
            let err = Header::decode(raw).unwrap_err();
            assert!(
                matches!(err, FormatError::MalformedJson(_)),
                "{raw:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_trailing_space_padding_accepted() {
        let raw = format!("{SAMPLE}      ");
        assert_eq!(Header::decode(raw.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_fields() {
        for (raw, missing) in [
            (r#"{"t":{"shape":[1],"data_offsets":[0,1]}}"#, "dtype"),
            (r#"{"t":{"dtype":"U8","data_offsets":[0,1]}}"#, "shape"),
            (r#"{"t":{"dtype":"U8","shape":[1]}}"#, "data_offsets"),
        ] {
            match Header::decode(raw.as_bytes()).unwrap_err() {
                FormatError::MissingField { key, field } => {
                    assert_eq!(key, "t");
                    assert_eq!(field, missing);
                }
                other => panic!("expected MissingField, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_offsets() {
        for raw in [
            r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0]}}"#,
            r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1,2]}}"#,
            r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[4,1]}}"#,
            r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[-1,1]}}"#,
            r#"{"t":{"dtype":"U8","shape":[-2],"data_offsets":[0,1]}}"#,
            r#"{"t":{"dtype":8,"shape":[1],"data_offsets":[0,1]}}"#,
            r#"{"t":[1,2,3]}"#,
        ] {
            let err = Header::decode(raw.as_bytes()).unwrap_err();
            assert!(
                matches!(err, FormatError::InvalidField { .. }),
                "{raw} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_unknown_dtype_is_stored() {
        let raw = r#"{"q":{"dtype":"Q4_K","shape":[32],"data_offsets":[0,18]}}"#;
        let header = Header::decode(raw.as_bytes()).unwrap();
        assert_eq!(header.get("q").unwrap().dtype, "Q4_K");
    }

    #[test]
    fn test_non_string_metadata_values_coerced() {
        let raw = r#"{"__metadata__":{"steps":1200,"nested":{"x":[1,2]},"ok":"yes"}}"#;
        let header = Header::decode(raw.as_bytes()).unwrap();
        let md = header.metadata().unwrap();
        assert_eq!(md.get("steps"), Some("1200"));
        assert_eq!(md.get("nested"), Some(r#"{"x":[1,2]}"#));
        assert_eq!(md.get("ok"), Some("yes"));
    }

    #[test]
    fn test_metadata_of_wrong_type() {
        let err = Header::decode(br#"{"__metadata__":[1]}"#).unwrap_err();
        assert!(matches!(err, FormatError::InvalidField { .. }));
    }

    #[test]
    fn test_reserialize_is_compact_and_ordered() {
        let header = Header::decode(SAMPLE.as_bytes()).unwrap();
        let bytes = header.to_json_bytes().unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), SAMPLE);
    }

    #[test]
    fn test_metadata_position_preserved() {
        let raw = r#"{"__metadata__":{"format":"pt"},"b":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"a":{"dtype":"U8","shape":[1],"data_offsets":[1,2]}}"#;
        let header = Header::decode(raw.as_bytes()).unwrap();
        assert_eq!(header.to_json_bytes().unwrap(), raw.as_bytes());
    }

    #[test]
    fn test_with_metadata_is_copy_on_write() {
        let header = Header::decode(SAMPLE.as_bytes()).unwrap();
        let removed = header.with_metadata(&MetadataUpdate::Remove);
        assert!(removed.metadata().is_none());
        assert!(header.metadata().is_some());
        assert_eq!(removed.tensors(), header.tensors());

        let kept = header.with_metadata(&MetadataUpdate::Keep);
        assert_eq!(kept, header);
    }

    #[test]
    fn test_new_metadata_appended_after_tensors() {
        let raw = r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
        let header = Header::decode(raw.as_bytes()).unwrap();
        let update = MetadataUpdate::from_json(Some(json!({"a": "b"})));
        let bytes = header.with_metadata(&update).to_json_bytes().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"t":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"__metadata__":{"a":"b"}}"#
        );
    }

    #[test]
    fn test_metadata_update_from_json() {
        assert_eq!(MetadataUpdate::from_json(None), MetadataUpdate::Keep);
        assert_eq!(
            MetadataUpdate::from_json(Some(json!({}))),
            MetadataUpdate::Remove
        );
        assert_eq!(
            MetadataUpdate::from_json(Some(json!([]))),
            MetadataUpdate::Remove
        );
        assert_eq!(
            MetadataUpdate::from_json(Some(Value::Null)),
            MetadataUpdate::Remove
        );
        assert_eq!(
            MetadataUpdate::from_json(Some(json!(42))),
            MetadataUpdate::Replace(Metadata::Text("42".to_string()))
        );

        let update = MetadataUpdate::from_json(Some(json!({"n": 3, "flag": true, "s": "x"})));
        let MetadataUpdate::Replace(Metadata::Map(map)) = update else {
            panic!("expected a map");
        };
        assert_eq!(map.get("n").map(String::as_str), Some("3"));
        assert_eq!(map.get("flag").map(String::as_str), Some("true"));
        assert_eq!(map.get("s").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_text_metadata_roundtrips() {
        let header = Header::decode(br#"{"__metadata__":"free text"}"#).unwrap();
        assert_eq!(
            header.metadata(),
            Some(&Metadata::Text("free text".to_string()))
        );
        assert_eq!(
            header.to_json_bytes().unwrap(),
            br#"{"__metadata__":"free text"}"#
        );
    }
}
