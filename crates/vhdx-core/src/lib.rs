//! # VHDX Core
//!
//! Shared foundations for the VHDX inspector workspace.
//!
//! This crate provides the pieces every other crate builds on:
//! - **ByteSource**: the read-only, random-access byte range provider the
//!   decoder reads through
//! - **Error**: the error kinds a decode can fail with, including the
//!   non-fatal chain markers stored on a decoded image
//! - **Limits**: allocation caps and checked arithmetic for untrusted input
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdx_core::{ByteSource, Result};
//!
//! fn signature(source: &mut dyn ByteSource) -> Result<Vec<u8>> {
//!     source.read_bytes(0, 8)
//! }
//! ```

pub mod error;
pub mod limits;
pub mod traits;

pub use error::{ChainError, CopyDefect, Error, ParentAttempt, Result, Structure};
pub use limits::*;
pub use traits::ByteSource;
