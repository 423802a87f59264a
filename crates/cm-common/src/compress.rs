//! Decompression of batched multi payloads.
//!
//! When a multi message reports a non-zero `size_unzipped`, its body is a
//! zip archive holding a single entry named `"z"`; the entry's contents are
//! the concatenated length-prefixed sub-messages.

use std::io::{Cursor, Read};
use thiserror::Error;
use zip::ZipArchive;

/// Name of the single entry inside a compressed multi payload.
pub const MULTI_ENTRY_NAME: &str = "z";

/// Errors that can occur while unpacking a multi payload.
#[derive(Debug, Error)]
pub enum CompressError {
    /// The payload is not a readable zip archive, or the entry is missing.
    #[error("multi archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// The entry could not be read to completion.
    #[error("multi entry: {0}")]
    Io(#[from] std::io::Error),
}

/// Unpacks a compressed multi payload, returning the contents of the `"z"`
/// entry.
///
/// # Errors
///
/// Returns [`CompressError`] when the payload is not a zip archive, the
/// entry is absent, or the entry is truncated.
pub fn unpack_multi(data: &[u8]) -> Result<Vec<u8>, CompressError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut entry = archive.by_name(MULTI_ENTRY_NAME)?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut out)?;
    Ok(out)
}
