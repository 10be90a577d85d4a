//! # VHDX Pipeline
//!
//! `ByteSource` implementations the decoder reads through:
//! - **StreamSource**: positional reads over any `Read + Seek` stream,
//!   aliased as `FileSource` (a `std::fs::File`) and `MemorySource`
//!   (an in-memory buffer)
//! - **MmapSource**: memory-mapped file access
//! - **OverlaySource**: a view of another source with replayed log writes
//!   applied on top
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdx_core::ByteSource;
//! use vhdx_pipeline::{FileSource, OverlaySource, Patch};
//! use std::path::Path;
//!
//! let file = FileSource::open(Path::new("disk.vhdx")).unwrap();
//! let mut overlay = OverlaySource::new(file);
//! overlay.push(Patch::Zero { offset: 0x200000, length: 4096 });
//!
//! let bytes = overlay.read_bytes(0x200000, 16).unwrap();
//! assert!(bytes.iter().all(|&b| b == 0));
//! ```

pub mod mmap;
pub mod overlay;
pub mod stream;

pub use mmap::MmapSource;
pub use overlay::{OverlaySource, Patch};
pub use stream::{FileSource, MemorySource, StreamSource};
