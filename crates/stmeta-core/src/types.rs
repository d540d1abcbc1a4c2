//! Common type definitions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Reserved header key holding free-form metadata instead of a tensor.
pub const METADATA_KEY: &str = "__metadata__";

/// Descriptor of one tensor in a safetensors header.
///
/// Offsets are relative to the start of the data section, which begins
/// right after the length prefix and the header bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDescriptor {
    /// Tensor name (its header key).
    pub name: String,
    /// Dtype tag exactly as stored in the header, e.g. `"F32"`.
    pub dtype: String,
    /// Shape (dimensions).
    pub shape: Vec<u64>,
    /// Start of the tensor's bytes within the data section.
    pub offset_start: u64,
    /// End (exclusive) of the tensor's bytes within the data section.
    pub offset_end: u64,
}

impl TensorDescriptor {
    /// Number of bytes the descriptor claims.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.offset_end - self.offset_start
    }

    /// Number of elements implied by the shape, `None` on overflow.
    ///
    /// A scalar (empty shape) holds one element.
    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
    }

    /// Size in bytes of one element, for dtype tags known to the format.
    #[must_use]
    pub fn dtype_size(&self) -> Option<u64> {
        dtype_size(&self.dtype)
    }
}

/// Element size in bytes for a safetensors dtype tag.
///
/// Returns `None` for tags this crate does not know; callers must treat that
/// as "unknown", not as an error.
#[must_use]
pub fn dtype_size(tag: &str) -> Option<u64> {
    match tag {
        "BOOL" | "U8" | "I8" | "F8_E4M3" | "F8_E5M2" => Some(1),
        "I16" | "U16" | "F16" | "BF16" => Some(2),
        "I32" | "U32" | "F32" => Some(4),
        "I64" | "U64" | "F64" => Some(8),
        _ => None,
    }
}

/// Contents of the `__metadata__` header entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metadata {
    /// String-to-string mapping, the usual form.
    Map(IndexMap<String, String>),
    /// A single string, produced by a scalar-valued metadata rewrite.
    Text(String),
}

impl Metadata {
    /// The mapping form, if this is one.
    pub fn as_map(&self) -> Option<&IndexMap<String, String>> {
        match self {
            Self::Map(map) => Some(map),
            Self::Text(_) => None,
        }
    }

    /// Look up one item of the mapping form.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.as_map()?.get(key).map(String::as_str)
    }

    /// Whether the metadata holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Map(map) => map.is_empty(),
            Self::Text(text) => text.is_empty(),
        }
    }
}
