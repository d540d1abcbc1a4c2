//! Expected-key schema check, the default [`KeyValidator`] implementation.
//!
//! The catalog itself always comes from the caller, for example a LoRA key
//! list kept next to the training scripts that produce the files.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexSet;
use stmeta_core::{KeyReport, KeyValidator, Result, TensorDescriptor};

/// A caller-supplied set of tensor names a header must contain exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedKeys {
    keys: IndexSet<String>,
}

impl ExpectedKeys {
    /// Parse one key per line. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect()
    }

    /// Load a key list from a text file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Number of expected keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are expected.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ExpectedKeys {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyValidator for ExpectedKeys {
    fn validate(&self, tensors: &[TensorDescriptor]) -> KeyReport {
        let present: HashSet<&str> = tensors.iter().map(|t| t.name.as_str()).collect();
        KeyReport {
            missing: self
                .keys
                .iter()
                .filter(|k| !present.contains(k.as_str()))
                .cloned()
                .collect(),
            unexpected: tensors
                .iter()
                .filter(|t| !self.keys.contains(t.name.as_str()))
                .map(|t| t.name.clone())
                .collect(),
        }
    }
}
