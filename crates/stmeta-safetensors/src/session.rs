//! An open safetensors file bound to its decoded header.

use std::path::Path;

use stmeta_core::{
    KeyReport, KeyValidator, Metadata, ReaderConfig, Result, TensorDescriptor,
};
use tracing::debug;

use crate::header::Header;
use crate::reader::{FileHandle, RawHeader};
use crate::validate::{validate_layout, LayoutIssue};

/// Open file plus its validated header.
///
/// Operations that touch the descriptor take `&mut self`, so a session has
/// exactly one caller at a time. Dropping the session releases the file.
#[derive(Debug)]
pub struct Session {
    pub(crate) handle: FileHandle,
    pub(crate) raw: RawHeader,
    pub(crate) header: Header,
}

impl Session {
    /// Open and validate a file with the default reader configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &ReaderConfig::default())
    }

    /// Open and validate a file.
    ///
    /// Header decoding is eager: duplicate keys, malformed JSON, and missing
    /// descriptor fields are all reported here rather than on first access.
    pub fn open_with(path: impl AsRef<Path>, config: &ReaderConfig) -> Result<Self> {
        let (handle, raw) = FileHandle::open(path, config)?;
        let header = if raw.is_empty() {
            Header::default()
        } else {
            Header::decode(raw.as_bytes())?
        };
        debug!(
            path = %handle.path().display(),
            tensors = header.len(),
            has_metadata = header.metadata().is_some(),
            "decoded safetensors header"
        );
        Ok(Self {
            handle,
            raw,
            header,
        })
    }

    /// Path the session was opened from.
    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// The decoded header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The `__metadata__` entry, if present.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.header.metadata()
    }

    /// Tensor names in header order.
    pub fn list_names(&self) -> Vec<&str> {
        self.header.names()
    }

    /// Header bytes exactly as read from disk.
    pub fn raw_header(&self) -> &RawHeader {
        &self.raw
    }

    /// Declared header length.
    pub fn header_len(&self) -> u64 {
        self.handle.header_len()
    }

    /// File size observed at open time.
    pub fn file_size(&self) -> u64 {
        self.handle.file_size()
    }

    /// Length of the data section.
    pub fn data_len(&self) -> u64 {
        self.handle.data_len()
    }

    /// Check every descriptor against the real data-section length.
    pub fn check(&self) -> Vec<LayoutIssue> {
        validate_layout(&self.header, self.data_len())
    }

    /// Run a schema check over the tensor descriptors.
    pub fn validate_keys<V: KeyValidator + ?Sized>(&self, validator: &V) -> KeyReport {
        validator.validate(self.header.tensors())
    }

    /// Descriptors sorted by where their bytes start.
    pub fn tensors_by_offset(&self) -> Vec<&TensorDescriptor> {
        let mut tensors: Vec<_> = self.header.tensors().iter().collect();
        tensors.sort_by_key(|t| (t.offset_start, t.offset_end));
        tensors
    }

    /// Whether the file handle has been released.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Release the file handle; the decoded header stays readable.
    pub fn close(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{build_file, write_temp};
    use stmeta_core::{FormatError, ZeroHeaderPolicy};

    #[test]
    fn test_open_lists_names_without_metadata() {
        let header =
            br#"{"t":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},"__metadata__":{"k":"v"}}"#;
        let file = write_temp(&build_file(header, &[0u8; 16]));
        let session = Session::open(file.path()).unwrap();

        assert_eq!(session.list_names(), vec!["t"]);
        assert_eq!(session.metadata().and_then(|m| m.get("k")), Some("v"));
        assert_eq!(session.raw_header().as_bytes(), header);
        assert_eq!(session.data_len(), 16);
        assert!(session.check().is_empty());
    }

    #[test]
    fn test_open_surfaces_decode_errors() {
        let header = br#"{"a":{"dtype":"U8","shape":[1],"data_offsets":[0,1]},"a":{"dtype":"U8","shape":[1],"data_offsets":[0,1]}}"#;
        let file = write_temp(&build_file(header, &[1]));
        let err = Session::open(file.path()).unwrap_err();
        assert_eq!(err.duplicate_keys(), Some(vec!["a"]));
    }

    #[test]
    fn test_empty_header_policy() {
        let file = write_temp(&0u64.to_le_bytes());
        assert!(matches!(
            Session::open(file.path()).unwrap_err(),
            FormatError::ZeroHeader { .. }
        ));

        let config = ReaderConfig {
            zero_header: ZeroHeaderPolicy::AllowEmpty,
            ..ReaderConfig::default()
        };
        let session = Session::open_with(file.path(), &config).unwrap();
        assert!(session.header().is_empty());
        assert!(session.metadata().is_none());
    }

    #[test]
    fn test_tensors_by_offset() {
        let header = br#"{"b":{"dtype":"U8","shape":[2],"data_offsets":[2,4]},"a":{"dtype":"U8","shape":[2],"data_offsets":[0,2]}}"#;
        let file = write_temp(&build_file(header, &[1, 2, 3, 4]));
        let session = Session::open(file.path()).unwrap();
        let order: Vec<&str> = session
            .tensors_by_offset()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(session.list_names(), vec!["b", "a"]);
    }

    #[test]
    fn test_close_keeps_header() {
        let file = write_temp(&build_file(b"{}      ", &[]));
        let mut session = Session::open(file.path()).unwrap();
        session.close();
        assert!(session.is_closed());
        assert!(session.header().is_empty());
    }
}
