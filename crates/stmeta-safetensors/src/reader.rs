//! Byte-level reader for the safetensors length prefix and header bytes.
//!
//! # Layout
//!
//! ```text
//! offset 0      : u64 header length N (little-endian)
//! offset 8      : N bytes of UTF-8 JSON
//! offset 8 + N  : raw tensor data
//! ```
//!
//! This module never parses JSON. It validates that the declared header fits
//! inside the file, reads exactly that many bytes, and keeps the descriptor
//! open so tensor bytes and the data section can be read later.

use std::fs::{File, Permissions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use stmeta_core::{FormatError, ReaderConfig, Result, ZeroHeaderPolicy};
use tracing::debug;

/// Size of the little-endian header-length prefix.
pub const LENGTH_PREFIX_SIZE: u64 = 8;

/// Header bytes exactly as stored in the file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawHeader(Vec<u8>);

impl RawHeader {
    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the header is empty (only possible under `AllowEmpty`).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Open safetensors file plus its validated size bookkeeping.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Option<File>,
    file_size: u64,
    header_len: u64,
}

impl FileHandle {
    /// Open `path`, validate the length prefix, and read the header bytes.
    ///
    /// On success the descriptor is left positioned at the end of the header.
    pub fn open(path: impl AsRef<Path>, config: &ReaderConfig) -> Result<(Self, RawHeader)> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < LENGTH_PREFIX_SIZE {
            return Err(FormatError::TooSmall {
                path,
                size: file_size,
            });
        }

        let header_len = match file.read_u64::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(FormatError::ShortRead {
                    path,
                    offset: 0,
                    expected: LENGTH_PREFIX_SIZE,
                    actual: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if header_len == 0 {
            match config.zero_header {
                ZeroHeaderPolicy::Reject => return Err(FormatError::ZeroHeader { path }),
                ZeroHeaderPolicy::AllowEmpty => {
                    debug!(path = %path.display(), file_size, "empty header accepted");
                    let handle = Self {
                        path,
                        file: Some(file),
                        file_size,
                        header_len,
                    };
                    return Ok((handle, RawHeader::default()));
                }
            }
        }

        let fits = LENGTH_PREFIX_SIZE
            .checked_add(header_len)
            .is_some_and(|end| end <= file_size);
        if !fits {
            return Err(FormatError::HeaderOverflow {
                path,
                header_len,
                file_size,
            });
        }

        if header_len > config.max_header_len {
            return Err(FormatError::HeaderTooLarge {
                path,
                header_len,
                max: config.max_header_len,
            });
        }
        let capacity = usize::try_from(header_len).map_err(|_| FormatError::HeaderTooLarge {
            path: path.clone(),
            header_len,
            max: usize::MAX as u64,
        })?;

        debug!(
            path = %path.display(),
            file_size,
            header_len,
            "reading safetensors header"
        );

        let mut bytes = Vec::with_capacity(capacity);
        let read = (&mut file).take(header_len).read_to_end(&mut bytes)? as u64;
        if read != header_len {
            return Err(FormatError::ShortRead {
                path,
                offset: LENGTH_PREFIX_SIZE,
                expected: header_len,
                actual: read,
            });
        }

        let handle = Self {
            path,
            file: Some(file),
            file_size,
            header_len,
        };
        Ok((handle, RawHeader(bytes)))
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file size observed at open time.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Declared header length.
    pub fn header_len(&self) -> u64 {
        self.header_len
    }

    /// Absolute offset of the first data-section byte.
    pub fn data_start(&self) -> u64 {
        LENGTH_PREFIX_SIZE + self.header_len
    }

    /// Length of the data section observed at open time.
    pub fn data_len(&self) -> u64 {
        self.file_size - self.data_start()
    }

    /// Whether [`FileHandle::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Release the descriptor. Later reads fail with `FormatError::Closed`.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "closed safetensors file");
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        let path = &self.path;
        self.file
            .as_mut()
            .ok_or_else(|| FormatError::Closed(path.clone()))
    }

    /// Permissions of the open file, read through the descriptor.
    pub fn permissions(&mut self) -> Result<Permissions> {
        Ok(self.file_mut()?.metadata()?.permissions())
    }

    /// Read exactly `len` bytes starting at absolute `offset`.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let available = self.file_size.saturating_sub(offset).min(len);
        let mut bytes = Vec::with_capacity(usize::try_from(available).unwrap_or(0));

        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let read = file.take(len).read_to_end(&mut bytes)? as u64;

        if read != len {
            return Err(FormatError::ShortRead {
                path: self.path.clone(),
                offset,
                expected: len,
                actual: read,
            });
        }
        Ok(bytes)
    }

    /// Stream the data section into `writer` in chunks of `chunk_size` bytes.
    ///
    /// Returns the number of bytes copied, which is less than
    /// [`FileHandle::data_len`] only if the file shrank after it was opened.
    pub fn copy_data_section<W: Write + ?Sized>(
        &mut self,
        writer: &mut W,
        chunk_size: usize,
    ) -> Result<u64> {
        let start = self.data_start();
        let mut remaining = self.data_len();
        let chunk_size = chunk_size.max(1);
        let buf_len = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
        let mut buf = vec![0u8; buf_len];

        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(start))?;

        let mut copied = 0u64;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buf_len, |r| r.min(buf_len));
            let got = fill(file, &mut buf[..want])?;
            writer.write_all(&buf[..got])?;
            copied += got as u64;
            remaining -= got as u64;
            if got < want {
                break;
            }
        }
        Ok(copied)
    }
}

/// Read until `buf` is full or EOF, returning the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
