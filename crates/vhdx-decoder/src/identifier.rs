//! File identifier (offset 0)

use crate::layout::{decode_utf16, CREATOR_LENGTH, CREATOR_OFFSET, FILE_IDENTIFIER_SIGNATURE};
use serde::Serialize;
use vhdx_core::{ByteSource, Error, Result};

/// The file type identifier at the start of every VHDX file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIdentifier {
    /// Application that created the file, informational only
    pub creator: String,
}

/// Check the "vhdxfile" signature and read the creator string.
///
/// Runs before anything else so a non-VHDX file is rejected without
/// touching the header region.
pub fn read_identifier<S: ByteSource + ?Sized>(source: &mut S) -> Result<FileIdentifier> {
    let available = source.len().min(FILE_IDENTIFIER_SIGNATURE.len() as u64) as usize;
    let head = source.read_bytes(0, available)?;

    let mut found = [0u8; 8];
    found[..available].copy_from_slice(&head);
    if &found != FILE_IDENTIFIER_SIGNATURE {
        return Err(Error::NotVhdx { found });
    }

    let raw = source.read_bytes(CREATOR_OFFSET as u64, CREATOR_LENGTH)?;
    // NUL terminated; stop at the first NUL code unit
    let end = raw
        .chunks_exact(2)
        .position(|unit| unit == [0, 0])
        .map(|units| units * 2)
        .unwrap_or(raw.len());
    let creator = decode_utf16(&raw[..end])
        .unwrap_or_else(|| String::from_utf16_lossy(&utf16_units(&raw[..end])));

    tracing::debug!("file identifier ok, creator {:?}", creator);
    Ok(FileIdentifier { creator })
}

fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
