//! Core traits

use crate::error::{Error, Result};
use std::io;

/// Read-only, random-access provider of the bytes of one image file
///
/// Implementations own whatever handle backs them; dropping the source
/// releases it.
pub trait ByteSource: Send {
    /// Total length of the source in bytes
    fn len(&self) -> u64;

    /// Is the source zero bytes long?
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`; a short source is an `UnexpectedEof`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Read `length` bytes at `offset` into a new buffer
    fn read_bytes(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)
            .map_err(|e| Error::read(offset, length as u64, e))?;
        Ok(buf)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}
