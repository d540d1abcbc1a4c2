//! Core trait definitions.

use crate::TensorDescriptor;

/// Outcome of checking a header's tensor names against a key schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    /// Keys the schema expects that the header does not contain.
    pub missing: Vec<String>,
    /// Keys the header contains that the schema does not expect.
    pub unexpected: Vec<String>,
}

impl KeyReport {
    /// True when the header matches the schema exactly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Pluggable schema check over a decoded header.
///
/// Implementations receive the tensor descriptors in header order and decide
/// which names are acceptable. Domain catalogs (LoRA key lists and the like)
/// live in implementations, never in the reader.
pub trait KeyValidator {
    /// Check the tensors and report every mismatch.
    fn validate(&self, tensors: &[TensorDescriptor]) -> KeyReport;
}

impl<F> KeyValidator for F
where
    F: Fn(&[TensorDescriptor]) -> KeyReport,
{
    fn validate(&self, tensors: &[TensorDescriptor]) -> KeyReport {
        self(tensors)
    }
}
