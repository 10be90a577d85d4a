//! # VHDX Decoder
//!
//! Read-only structural decoder for Microsoft VHDX (version 2) images.
//!
//! Decoding runs in a fixed order:
//! - **Identifier**: the `vhdxfile` signature and creator string
//! - **Headers**: the current of two checksummed header copies
//! - **Log**: pending metadata writes, applied to an in-memory overlay
//! - **Region table**: located on the replayed view
//! - **Metadata**: known items decoded, unknown ones preserved
//! - **BAT**: every entry classified and decoded
//! - **Parent chain**: optional, for differencing disks
//!
//! The input file is never written.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdx_decoder::{decode_path, DecodeOptions};
//! use std::path::Path;
//!
//! let options = DecodeOptions {
//!     follow_parent_chain: true,
//!     ..DecodeOptions::default()
//! };
//! let image = decode_path(Path::new("disk.vhdx"), &options).unwrap();
//!
//! println!("Type: {}", image.disk_type);
//! println!("Size: {} bytes", image.metadata.virtual_disk_size);
//! ```

pub mod bat;
pub mod chain;
pub mod checksum;
pub mod header;
pub mod identifier;
pub mod image;
pub mod layout;
pub mod log;
pub mod metadata;
pub mod region;

#[cfg(test)]
mod testing;

pub use bat::{decode_bat, Bat, BatEntry, BatEntryKind, BatGeometry, BatSummary, BlockState};
pub use chain::{candidate_paths, resolve_parent};
pub use header::{resolve_headers, resolve_region_table, CopySlot, HeaderCopy, HeaderSet};
pub use identifier::{read_identifier, FileIdentifier};
pub use image::{decode_path, decode_source, DecodeOptions, DecodedImage, DiskType, ParentLink};
pub use log::{replay_log, LogReplay, LogState, StopReason};
pub use metadata::{parse_metadata, FileParameters, Metadata, ParentLocator};
pub use region::{parse_region_table, RegionKind, RegionTable, RegionTableEntry};
