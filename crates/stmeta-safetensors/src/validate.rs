//! Layout checks of a decoded header against the real data section.

use std::fmt;

use crate::header::Header;

/// One problem (or notable irregularity) in a header's tensor layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutIssue {
    /// Tensor range ends past the data section.
    OutOfBounds {
        /// Tensor name.
        name: String,
        /// Declared end offset.
        offset_end: u64,
        /// Actual data-section length.
        data_len: u64,
    },
    /// Byte range does not match `product(shape) * dtype size`.
    SizeMismatch {
        /// Tensor name.
        name: String,
        /// Dtype tag.
        dtype: String,
        /// Bytes implied by dtype and shape.
        expected: u64,
        /// Bytes covered by `data_offsets`.
        actual: u64,
    },
    /// Shape product overflows u64.
    ShapeOverflow {
        /// Tensor name.
        name: String,
    },
    /// Two tensors share bytes.
    Overlap {
        /// Tensor whose range was passed.
        first: String,
        /// Tensor starting inside `first`.
        second: String,
    },
    /// Unreferenced bytes between tensors.
    Gap {
        /// First unreferenced byte.
        start: u64,
        /// End (exclusive) of the unreferenced bytes.
        end: u64,
    },
    /// Unreferenced bytes after the last tensor.
    TrailingBytes {
        /// First unreferenced byte.
        start: u64,
        /// Data-section length.
        end: u64,
    },
}

impl LayoutIssue {
    /// Whether this issue makes the file unusable, as opposed to merely wasteful.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Gap { .. } | Self::TrailingBytes { .. })
    }
}

impl fmt::Display for LayoutIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds {
                name,
                offset_end,
                data_len,
            } => write!(
                f,
                "tensor '{name}' ends at {offset_end}, past data section of {data_len} bytes"
            ),
            Self::SizeMismatch {
                name,
                dtype,
                expected,
                actual,
            } => write!(
                f,
                "tensor '{name}' ({dtype}) covers {actual} bytes, shape needs {expected}"
            ),
            Self::ShapeOverflow { name } => write!(f, "tensor '{name}' shape overflows u64"),
            Self::Overlap { first, second } => {
                write!(f, "tensor '{second}' overlaps tensor '{first}'")
            }
            Self::Gap { start, end } => write!(f, "unreferenced bytes [{start}, {end})"),
            Self::TrailingBytes { start, end } => {
                write!(f, "unreferenced trailing bytes [{start}, {end})")
            }
        }
    }
}

/// Collect every layout issue of `header` given a data section of `data_len` bytes.
pub fn validate_layout(header: &Header, data_len: u64) -> Vec<LayoutIssue> {
    let mut issues = Vec::new();

    for t in header.tensors() {
        if t.offset_end > data_len {
            issues.push(LayoutIssue::OutOfBounds {
                name: t.name.clone(),
                offset_end: t.offset_end,
                data_len,
            });
        }
        let Some(size) = t.dtype_size() else {
            continue;
        };
        match t.element_count().and_then(|n| n.checked_mul(size)) {
            Some(expected) if expected != t.byte_len() => {
                issues.push(LayoutIssue::SizeMismatch {
                    name: t.name.clone(),
                    dtype: t.dtype.clone(),
                    expected,
                    actual: t.byte_len(),
                });
            }
            Some(_) => {}
            None => issues.push(LayoutIssue::ShapeOverflow {
                name: t.name.clone(),
            }),
        }
    }

    let mut ordered: Vec<_> = header.tensors().iter().filter(|t| t.byte_len() > 0).collect();
    ordered.sort_by_key(|t| (t.offset_start, t.offset_end));

    let mut cursor = 0u64;
    let mut furthest: Option<&str> = None;
    for t in ordered {
        if t.offset_start < cursor {
            if let Some(first) = furthest {
                issues.push(LayoutIssue::Overlap {
                    first: first.to_string(),
                    second: t.name.clone(),
                });
            }
        } else if t.offset_start > cursor {
            issues.push(LayoutIssue::Gap {
                start: cursor,
                end: t.offset_start,
            });
        }
        if t.offset_end > cursor {
            cursor = t.offset_end;
            furthest = Some(&t.name);
        }
    }
    if cursor < data_len {
        issues.push(LayoutIssue::TrailingBytes {
            start: cursor,
            end: data_len,
        });
    }

    issues
}
