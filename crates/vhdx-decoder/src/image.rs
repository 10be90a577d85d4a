//! The decode pipeline and its result

use crate::bat::{decode_bat, Bat, BatGeometry};
use crate::chain::resolve_parent;
use crate::header::{resolve_headers, resolve_region_table, HeaderSet};
use crate::identifier::{read_identifier, FileIdentifier};
use crate::log::{log_region, replay_log, LogReplay};
use crate::metadata::{parse_metadata, FileParameters, Metadata};
use crate::region::{parse_region_table, RegionTable};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use vhdx_core::{ByteSource, ChainError, Result};
use vhdx_pipeline::{FileSource, MmapSource};

/// Kind of virtual disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn from_parameters(parameters: &FileParameters) -> Self {
        if parameters.has_parent {
            DiskType::Differencing
        } else if parameters.leave_blocks_allocated {
            DiskType::Fixed
        } else {
            DiskType::Dynamic
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::Fixed => write!(f, "fixed"),
            DiskType::Dynamic => write!(f, "dynamic"),
            DiskType::Differencing => write!(f, "differencing"),
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Locate and decode parents of differencing disks
    pub follow_parent_chain: bool,
    /// Read files through a memory mapping instead of positional reads
    pub use_mmap: bool,
    /// Most parents decoded above the first image
    pub max_chain_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            follow_parent_chain: false,
            use_mmap: false,
            max_chain_depth: 16,
        }
    }
}

/// Link from an image to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParentLink {
    /// Not a differencing disk
    Absent,
    /// Differencing disk, but the chain was not followed
    NotRequested,
    Decoded(Box<DecodedImage>),
    /// The chain ends here; the child itself decoded fine
    Unresolved(ChainError),
}

/// Everything decoded from one VHDX file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedImage {
    /// Canonical path when decoded from a file
    pub path: Option<PathBuf>,
    pub file_size: u64,
    pub identifier: FileIdentifier,
    pub disk_type: DiskType,
    pub headers: HeaderSet,
    pub log: LogReplay,
    pub region_table: RegionTable,
    pub metadata: Metadata,
    pub bat: Bat,
    pub parent: ParentLink,
}

impl DecodedImage {
    /// This image followed by each decoded parent, nearest first
    pub fn chain(&self) -> impl Iterator<Item = &DecodedImage> {
        std::iter::successors(Some(self), |image| match &image.parent {
            ParentLink::Decoded(parent) => Some(parent.as_ref()),
            _ => None,
        })
    }

    /// The link that ends the chain
    pub fn chain_end(&self) -> &ParentLink {
        let last = self.chain().fold(self, |_, image| image);
        &last.parent
    }
}

/// Decode an image from an already open source.
///
/// Parents are never followed: there is no directory to resolve them against.
pub fn decode_source<S: ByteSource>(source: S, options: &DecodeOptions) -> Result<DecodedImage> {
    if options.follow_parent_chain {
        tracing::debug!("decoding from a source without a path; parent chain not followed");
    }
    decode_structure(source)
}

/// Decode the image at `path`, following its parent chain when asked to.
pub fn decode_path(path: &Path, options: &DecodeOptions) -> Result<DecodedImage> {
    let canonical = path.canonicalize()?;
    let mut visited = HashSet::from([canonical.clone()]);
    decode_file(&canonical, options, &mut visited)
}

/// Decode one file of a chain; `visited` holds the canonical paths of the
/// images already on the chain, this one included.
pub(crate) fn decode_file(
    path: &Path,
    options: &DecodeOptions,
    visited: &mut HashSet<PathBuf>,
) -> Result<DecodedImage> {
    tracing::debug!("decoding {}", path.display());

    // The source is dropped when decode_structure returns, before any parent
    // is opened
    let mut image = if options.use_mmap {
        decode_structure(MmapSource::open(path)?)?
    } else {
        decode_structure(FileSource::open(path)?)?
    };
    image.path = Some(path.to_path_buf());

    if options.follow_parent_chain && image.metadata.file_parameters.has_parent {
        if let Some(locator) = &image.metadata.parent_locator {
            image.parent = resolve_parent(path, locator, options, visited);
        }
    }
    Ok(image)
}

fn decode_structure<S: ByteSource>(mut source: S) -> Result<DecodedImage> {
    let file_size = source.len();
    let identifier = read_identifier(&mut source)?;
    let headers = resolve_headers(&mut source)?;

    let (mut overlay, log) = replay_log(source, &headers.active.header)?;

    let region_copy = resolve_region_table(&mut overlay)?;
    let region_table = parse_region_table(
        &region_copy,
        overlay.len(),
        log_region(&headers.active.header),
    )?;
    let metadata = parse_metadata(&mut overlay, region_table.metadata())?;
    let geometry = BatGeometry::from_metadata(&metadata)?;
    let bat = decode_bat(&mut overlay, region_table.bat(), geometry)?;

    let disk_type = DiskType::from_parameters(&metadata.file_parameters);
    let parent = if metadata.file_parameters.has_parent {
        ParentLink::NotRequested
    } else {
        ParentLink::Absent
    };

    Ok(DecodedImage {
        path: None,
        file_size,
        identifier,
        disk_type,
        headers,
        log,
        region_table,
        metadata,
        bat,
        parent,
    })
}
