//! Configuration types for reading and rewriting safetensors files.

use serde::{Deserialize, Serialize};

/// Default upper bound on header length (100 MiB).
pub const DEFAULT_MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// Default chunk size for copying the data section (16 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// How to treat a length prefix of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZeroHeaderPolicy {
    /// Reject the file with `FormatError::ZeroHeader`.
    #[default]
    Reject,
    /// Accept the file as having an empty header and no tensors.
    AllowEmpty,
}

/// Options for opening a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Zero-length header policy.
    #[serde(default)]
    pub zero_header: ZeroHeaderPolicy,

    /// Largest header length accepted before any allocation.
    #[serde(default = "default_max_header_len")]
    pub max_header_len: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            zero_header: ZeroHeaderPolicy::default(),
            max_header_len: default_max_header_len(),
        }
    }
}

/// Options for writing output files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Replace an existing output file.
    #[serde(default)]
    pub overwrite: bool,

    /// Bytes copied per read/write cycle when streaming the data section.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            overwrite: false,
            chunk_size: default_chunk_size(),
        }
    }
}

impl RewriteConfig {
    /// Set overwrite permission.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the copy chunk size. Zero is clamped to one byte.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// Complete tool configuration, typically loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Reader options.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Writer options.
    #[serde(default)]
    pub rewrite: RewriteConfig,
}

impl ToolConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.rewrite.chunk_size == 0 {
            return Err(crate::FormatError::Config(
                "rewrite.chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.reader.max_header_len == 0 {
            return Err(crate::FormatError::Config(
                "reader.max_header_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_header_len() -> u64 {
    DEFAULT_MAX_HEADER_LEN
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
