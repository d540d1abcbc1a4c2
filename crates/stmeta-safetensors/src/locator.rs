//! Tensor byte-range resolution and on-demand reads.

use stmeta_core::{FormatError, Result, TensorDescriptor};
use tracing::debug;

use crate::session::Session;

/// Absolute position of a tensor's bytes within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLocation {
    /// Absolute file offset of the first byte.
    pub offset: u64,
    /// Number of bytes.
    pub len: u64,
}

impl Session {
    /// Resolve a tensor name to its absolute file range.
    pub fn locate(&self, name: &str) -> Result<TensorLocation> {
        let descriptor = self
            .header
            .get(name)
            .ok_or_else(|| FormatError::UnknownTensor(name.to_string()))?;
        self.location_of(descriptor)
    }

    fn location_of(&self, descriptor: &TensorDescriptor) -> Result<TensorLocation> {
        let offset = self
            .handle
            .data_start()
            .checked_add(descriptor.offset_start)
            .ok_or_else(|| FormatError::InvalidField {
                key: descriptor.name.clone(),
                field: "data_offsets",
                reason: "absolute offset overflows u64".to_string(),
            })?;
        Ok(TensorLocation {
            offset,
            len: descriptor.byte_len(),
        })
    }

    /// Read one tensor's raw bytes.
    ///
    /// Fails with `ShortRead` when the data section ends before the
    /// descriptor's range does.
    pub fn read_tensor(&mut self, name: &str) -> Result<Vec<u8>> {
        let location = self.locate(name)?;
        debug!(
            tensor = name,
            offset = location.offset,
            len = location.len,
            "reading tensor"
        );
        self.handle.read_at(location.offset, location.len)
    }

    /// Read every tensor, issuing reads in ascending `offset_start` order.
    ///
    /// Results come back in that same read order.
    pub fn read_all_tensors(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let plan = self
            .tensors_by_offset()
            .into_iter()
            .map(|t| Ok((t.name.clone(), self.location_of(t)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut tensors = Vec::with_capacity(plan.len());
        for (name, location) in plan {
            let bytes = self.handle.read_at(location.offset, location.len)?;
            tensors.push((name, bytes));
        }
        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{build_file, write_temp};

    const HEADER: &[u8] =
        br#"{"t":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]},"__metadata__":{"k":"v"}}"#;

    #[test]
    fn test_read_tensor_returns_declared_range() {
        let data: Vec<u8> = (0..16).collect();
        let bytes = build_file(HEADER, &data);
        let file = write_temp(&bytes);
        let mut session = Session::open(file.path()).unwrap();

        let n = HEADER.len();
        let location = session.locate("t").unwrap();
        assert_eq!(location.offset, 8 + n as u64);
        assert_eq!(location.len, 16);
        assert_eq!(session.read_tensor("t").unwrap(), &bytes[8 + n..8 + n + 16]);
    }

    #[test]
    fn test_unknown_tensor() {
        let file = write_temp(&build_file(HEADER, &[0u8; 16]));
        let mut session = Session::open(file.path()).unwrap();
        assert!(matches!(
            session.read_tensor("__metadata__").unwrap_err(),
            FormatError::UnknownTensor(_)
        ));
        assert!(matches!(
            session.locate("missing").unwrap_err(),
            FormatError::UnknownTensor(_)
        ));
    }

    #[test]
    fn test_truncated_data_section() {
        let file = write_temp(&build_file(HEADER, &[0u8; 10]));
        let mut session = Session::open(file.path()).unwrap();
        let err = session.read_tensor("t").unwrap_err();
        assert!(matches!(
            err,
            FormatError::ShortRead {
                expected: 16,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_read_all_tensors_in_offset_order() {
        let header = br#"{"second":{"dtype":"U8","shape":[2],"data_offsets":[2,4]},"first":{"dtype":"U8","shape":[2],"data_offsets":[0,2]},"empty":{"dtype":"U8","shape":[0],"data_offsets":[4,4]}}"#;
        let file = write_temp(&build_file(header, &[1, 2, 3, 4]));
        let mut session = Session::open(file.path()).unwrap();

        let tensors = session.read_all_tensors().unwrap();
        assert_eq!(
            tensors,
            vec![
                ("first".to_string(), vec![1, 2]),
                ("second".to_string(), vec![3, 4]),
                ("empty".to_string(), vec![]),
            ]
        );
    }

    #[test]
    fn test_absolute_offset_overflow() {
        let header = br#"{"t":{"dtype":"U8","shape":[0],"data_offsets":[18446744073709551615,18446744073709551615]}}"#;
        let file = write_temp(&build_file(header, &[]));
        let mut session = Session::open(file.path()).unwrap();

        let err = session.locate("t").unwrap_err();
        assert!(matches!(
            err,
            FormatError::InvalidField {
                field: "data_offsets",
                ..
            }
        ));
        assert!(matches!(
            session.read_all_tensors().unwrap_err(),
            FormatError::InvalidField { .. }
        ));
    }

    #[test]
    fn test_read_after_close() {
        let file = write_temp(&build_file(HEADER, &[0u8; 16]));
        let mut session = Session::open(file.path()).unwrap();
        session.close();
        assert!(matches!(
            session.read_tensor("t").unwrap_err(),
            FormatError::Closed(_)
        ));
    }
}
