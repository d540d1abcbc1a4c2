//! Safetensors header reading, validation, tensor lookup, and metadata rewriting.
//!
//! A [`Session`] binds an open file to its decoded [`Header`]. Everything the
//! header declares is validated when the session is opened; tensor bytes are
//! only read on request.
//!
//! # Example
//!
//! ```rust,ignore
//! use stmeta_safetensors::{open, MetadataUpdate};
//! use stmeta_core::RewriteConfig;
//!
//! let mut session = open("model.safetensors")?;
//! for name in session.list_names() {
//!     println!("{name}");
//! }
//! let update = MetadataUpdate::from_json(Some(serde_json::json!({"license": "mit"})));
//! session.rewrite_metadata(&update, "model.new.safetensors", &RewriteConfig::default())?;
//! ```

#![warn(missing_docs)]

mod header;
mod keys;
mod locator;
mod reader;
mod session;
mod validate;
mod writer;

#[cfg(test)]
mod test_util;

use std::path::Path;

pub use header::{check_duplicate_keys, Header, MetadataUpdate};
pub use keys::ExpectedKeys;
pub use locator::TensorLocation;
pub use reader::{FileHandle, RawHeader, LENGTH_PREFIX_SIZE};
pub use session::Session;
pub use validate::{validate_layout, LayoutIssue};
pub use writer::{alignment_padding, padded_header_bytes, RewriteSummary, DATA_ALIGNMENT};

/// Open a file with the default reader configuration.
pub fn open(path: impl AsRef<Path>) -> stmeta_core::Result<Session> {
    Session::open(path)
}
