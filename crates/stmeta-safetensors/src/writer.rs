//! Header rewriting and raw header export.
//!
//! Outputs are written to a temporary file next to the destination and
//! renamed into place only after every byte has been written and synced, so
//! a failed rewrite never leaves a truncated file behind. The same rule makes
//! rewriting a file onto itself safe: the source is fully drained before the
//! rename replaces it.

use std::fs::Permissions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use stmeta_core::{FormatError, Result, RewriteConfig};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::header::{Header, MetadataUpdate};
use crate::reader::LENGTH_PREFIX_SIZE;
use crate::session::Session;

/// Alignment of the data section start.
pub const DATA_ALIGNMENT: usize = 8;

/// Sizes of a completed rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteSummary {
    /// New header length, padding included.
    pub header_len: u64,
    /// Space bytes appended to the JSON.
    pub padding: u64,
    /// Data-section bytes copied verbatim.
    pub data_len: u64,
}

/// Spaces needed after `len` header bytes to reach the data alignment.
#[must_use]
pub fn alignment_padding(len: usize) -> usize {
    ((len + DATA_ALIGNMENT - 1) & !(DATA_ALIGNMENT - 1)) - len
}

/// Serialize `header` and pad it with spaces to a multiple of 8 bytes.
pub fn padded_header_bytes(header: &Header) -> Result<Vec<u8>> {
    let mut bytes = header.to_json_bytes()?;
    let padding = alignment_padding(bytes.len());
    bytes.resize(bytes.len() + padding, b' ');
    Ok(bytes)
}

impl Session {
    /// Write a copy of the file with `__metadata__` changed per `update`.
    ///
    /// Tensor descriptors keep their order and offsets, and the data section
    /// is copied byte for byte in `config.chunk_size` chunks. The session's
    /// own header is left untouched.
    pub fn rewrite_metadata(
        &mut self,
        update: &MetadataUpdate,
        output: impl AsRef<Path>,
        config: &RewriteConfig,
    ) -> Result<RewriteSummary> {
        let output = output.as_ref();
        let header = self.header.with_metadata(update);
        let json_len = header.to_json_bytes()?.len();
        let header_bytes = padded_header_bytes(&header)?;
        let header_len = header_bytes.len() as u64;
        let data_len = self.handle.data_len();
        let permissions = self.handle.permissions()?;

        let handle = &mut self.handle;
        write_atomically(output, config.overwrite, Some(permissions), |writer| {
            writer.write_u64::<LittleEndian>(header_len)?;
            writer.write_all(&header_bytes)?;
            let copied = handle.copy_data_section(writer, config.chunk_size)?;
            if copied != data_len {
                return Err(FormatError::WriteIncomplete {
                    path: output.to_path_buf(),
                    expected: LENGTH_PREFIX_SIZE + header_len + data_len,
                    written: LENGTH_PREFIX_SIZE + header_len + copied,
                });
            }
            Ok(())
        })?;

        info!(
            input = %self.handle.path().display(),
            output = %output.display(),
            header_len,
            data_len,
            "rewrote safetensors metadata"
        );
        Ok(RewriteSummary {
            header_len,
            padding: header_len - json_len as u64,
            data_len,
        })
    }

    /// Write the raw header bytes, without the length prefix, to `output`.
    pub fn extract_raw_header(&self, output: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let output = output.as_ref();
        let raw = self.raw.as_bytes();
        write_atomically(output, overwrite, None, |writer| {
            writer.write_all(raw)?;
            Ok(())
        })?;
        info!(
            output = %output.display(),
            bytes = raw.len(),
            "header saved"
        );
        Ok(())
    }

    /// Write one tensor's raw bytes to `output`.
    pub fn extract_tensor(
        &mut self,
        name: &str,
        output: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<u64> {
        let bytes = self.read_tensor(name)?;
        write_atomically(output.as_ref(), overwrite, None, |writer| {
            writer.write_all(&bytes)?;
            Ok(())
        })?;
        Ok(bytes.len() as u64)
    }
}

/// Write `output` through a synced temporary file in the same directory.
fn write_atomically<F>(
    output: &Path,
    overwrite: bool,
    permissions: Option<Permissions>,
    write: F,
) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    if !overwrite && output.exists() {
        return Err(FormatError::OutputExists(output.to_path_buf()));
    }

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    debug!(tmp = %tmp.path().display(), output = %output.display(), "writing output");

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    if let Some(permissions) = permissions {
        tmp.as_file().set_permissions(permissions)?;
    }
    tmp.as_file().sync_all()?;

    if overwrite {
        tmp.persist(output).map_err(|e| FormatError::Io(e.error))?;
    } else {
        tmp.persist_noclobber(output).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                FormatError::OutputExists(output.to_path_buf())
            } else {
                FormatError::Io(e.error)
            }
        })?;
    }
    Ok(())
}
