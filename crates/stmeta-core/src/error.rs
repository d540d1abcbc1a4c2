//! Error types for safetensors header handling.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for stmeta operations.
pub type Result<T> = std::result::Result<T, FormatError>;

/// Main error type for reading, validating, and rewriting safetensors files.
///
/// Every variant is terminal for the operation that raised it.
#[derive(Error, Debug)]
pub enum FormatError {
    /// File is shorter than the 8-byte length prefix.
    #[error("{}: not a valid safetensors file: length {size} is less than 8 bytes", .path.display())]
    TooSmall {
        /// Offending file.
        path: PathBuf,
        /// Actual file size in bytes.
        size: u64,
    },

    /// Length prefix is zero.
    #[error("{}: not a valid safetensors file: header size is 0", .path.display())]
    ZeroHeader {
        /// Offending file.
        path: PathBuf,
    },

    /// Header extends past the end of the file.
    #[error(
        "{}: not a valid safetensors file: header of {header_len} bytes extends past end of file ({file_size} bytes)",
        .path.display()
    )]
    HeaderOverflow {
        /// Offending file.
        path: PathBuf,
        /// Declared header length.
        header_len: u64,
        /// Actual file size in bytes.
        file_size: u64,
    },

    /// Header length exceeds the configured maximum.
    #[error(
        "{}: header of {header_len} bytes exceeds maximum of {max} bytes",
        .path.display()
    )]
    HeaderTooLarge {
        /// Offending file.
        path: PathBuf,
        /// Declared header length.
        header_len: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Fewer bytes were available than the file layout declares.
    #[error(
        "{}: tried to read {expected} bytes at offset {offset}, only read {actual}",
        .path.display()
    )]
    ShortRead {
        /// File being read.
        path: PathBuf,
        /// Absolute file offset of the read.
        offset: u64,
        /// Bytes requested.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// Header bytes are not a valid JSON object.
    #[error("malformed header JSON: {0}")]
    MalformedJson(String),

    /// One or more top-level header keys occur more than once.
    #[error("duplicate keys in header: {}", format_duplicates(.0))]
    DuplicateKeys(Vec<(String, usize)>),

    /// A tensor entry is missing a required field.
    #[error("tensor '{key}' is missing required field '{field}'")]
    MissingField {
        /// Tensor name.
        key: String,
        /// Missing field name.
        field: &'static str,
    },

    /// A header field has the wrong shape or type.
    #[error("invalid field '{field}' in '{key}': {reason}")]
    InvalidField {
        /// Header key holding the field.
        key: String,
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Requested tensor is not in the header.
    #[error("tensor not found: {0}")]
    UnknownTensor(String),

    /// Destination exists and overwriting was not permitted.
    #[error("output file \"{}\" already exists, overwrite not permitted", .0.display())]
    OutputExists(PathBuf),

    /// Fewer bytes were written than the output requires.
    #[error(
        "{}: write incomplete, expected {expected} bytes, wrote {written}",
        .path.display()
    )]
    WriteIncomplete {
        /// Destination file.
        path: PathBuf,
        /// Bytes the output requires.
        expected: u64,
        /// Bytes actually written.
        written: u64,
    },

    /// The session's file handle was already closed.
    #[error("{}: file handle is closed", .0.display())]
    Closed(PathBuf),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_duplicates(keys: &[(String, usize)]) -> String {
    keys.iter()
        .map(|(key, count)| format!("'{key}' used {count} times"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl FormatError {
    /// Names of the keys reported by a [`FormatError::DuplicateKeys`] error.
    pub fn duplicate_keys(&self) -> Option<Vec<&str>> {
        match self {
            Self::DuplicateKeys(keys) => Some(keys.iter().map(|(k, _)| k.as_str()).collect()),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for FormatError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
