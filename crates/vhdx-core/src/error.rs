//! Decoder error types

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for VHDX decoding
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside of a ranged read (opening a file, mapping it)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A byte range could not be read from the source
    #[error("Failed to read {length} bytes at offset 0x{offset:X}: {source}")]
    Read {
        offset: u64,
        length: u64,
        source: std::io::Error,
    },

    /// The file identifier signature is not "vhdxfile"
    #[error("Not a VHDX file: file identifier signature is {found:02X?}, expected \"vhdxfile\"")]
    NotVhdx { found: [u8; 8] },

    /// Both redundant copies of the header or of the region table are invalid
    #[error("Corrupt {structure}: both copies are invalid ({first}; {second})")]
    CorruptHeader {
        structure: Structure,
        first: CopyDefect,
        second: CopyDefect,
    },

    /// A region marked required has a GUID this decoder does not recognize
    #[error("Unsupported required region {guid}")]
    UnsupportedRequiredRegion { guid: Uuid },

    /// A metadata item marked required has a GUID this decoder does not recognize
    #[error("Unsupported required metadata item {guid}")]
    UnsupportedRequiredMetadata { guid: Uuid },

    /// A declared structure extends past its container or overlaps another one
    #[error("{structure} at 0x{offset:X} (0x{length:X} bytes) is out of bounds: limit 0x{limit:X}")]
    RegionOutOfBounds {
        structure: String,
        offset: u64,
        length: u64,
        limit: u64,
    },

    /// A format rule was violated
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    /// Valid but unsupported input (format version, size beyond limits)
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Parent chain resolution failed
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Result type alias for decoder operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid structure error
    pub fn invalid_structure(msg: impl Into<String>) -> Self {
        Error::InvalidStructure(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create an out of bounds error for a named structure
    pub fn out_of_bounds(structure: impl Into<String>, offset: u64, length: u64, limit: u64) -> Self {
        Error::RegionOutOfBounds {
            structure: structure.into(),
            offset,
            length,
            limit,
        }
    }

    /// Wrap an I/O failure of a ranged read
    pub fn read(offset: u64, length: u64, source: std::io::Error) -> Self {
        Error::Read {
            offset,
            length,
            source,
        }
    }
}

/// Redundantly stored structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Structure {
    Header,
    RegionTable,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Structure::Header => write!(f, "header"),
            Structure::RegionTable => write!(f, "region table"),
        }
    }
}

/// Why one copy of a redundant structure was discarded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CopyDefect {
    #[error("copy at 0x{offset:X} has signature {found:02X?}, expected {expected:02X?}")]
    BadSignature {
        offset: u64,
        found: [u8; 4],
        expected: [u8; 4],
    },

    #[error("copy at 0x{offset:X} has checksum 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("copy at 0x{offset:X} declares {count} entries, maximum is {max}")]
    TooManyEntries { offset: u64, count: u32, max: u32 },
}

/// One parent path that was tried and rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentAttempt {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for ParentAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Differencing chain failures
///
/// These never abort the decode of the child image; they are stored as the
/// terminal marker of its parent link.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainError {
    #[error("Parent not found after {} attempt(s){}", .attempts.len(), format_attempts(.attempts))]
    ParentNotFound { attempts: Vec<ParentAttempt> },

    #[error("Parent chain cycle detected at {}", .path.display())]
    ParentCycleDetected { path: PathBuf },

    #[error("Parent locator type {locator_type} is not supported")]
    UnsupportedLocator { locator_type: Uuid },

    #[error("Parent chain deeper than {limit} images")]
    ChainTooDeep { limit: usize },
}

fn format_attempts(attempts: &[ParentAttempt]) -> String {
    if attempts.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = attempts.iter().map(|a| a.to_string()).collect();
    format!(": {}", joined.join("; "))
}
