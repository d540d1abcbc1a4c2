//! Core types, errors, and configuration for safetensors header tooling.
//!
//! This crate provides the foundational pieces shared by the reader/rewriter
//! and the command-line tool:
//!
//! - The [`FormatError`] taxonomy and [`Result`] alias
//! - Reader and rewrite configuration, loadable from YAML
//! - Tensor descriptor and metadata types
//! - The [`KeyValidator`] seam for schema checks layered on top of a header

#![warn(missing_docs)]

mod config;
mod error;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ReaderConfig, RewriteConfig, ToolConfig, ZeroHeaderPolicy};
    pub use crate::error::{FormatError, Result};
    pub use crate::traits::*;
    pub use crate::types::*;
}
