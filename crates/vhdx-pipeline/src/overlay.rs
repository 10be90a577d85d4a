//! Overlay source - pending writes layered over another source

use std::io;
use vhdx_core::ByteSource;

/// One write recorded on top of the underlying bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// `length` zero bytes at `offset`
    Zero { offset: u64, length: u64 },
    /// `bytes` at `offset`
    Data { offset: u64, bytes: Vec<u8> },
}

impl Patch {
    fn range(&self) -> (u64, u64) {
        match self {
            Patch::Zero { offset, length } => (*offset, offset.saturating_add(*length)),
            Patch::Data { offset, bytes } => (*offset, offset.saturating_add(bytes.len() as u64)),
        }
    }
}

/// A view of `inner` with patches applied in the order they were pushed.
///
/// The underlying source is never written. The logical length can be
/// extended past the end of `inner`; bytes there read as zero unless a
/// patch covers them.
pub struct OverlaySource<S: ByteSource> {
    inner: S,
    patches: Vec<Patch>,
    length: u64,
}

impl<S: ByteSource> OverlaySource<S> {
    /// Wrap a source with no patches
    pub fn new(inner: S) -> Self {
        let length = inner.len();
        Self {
            inner,
            patches: Vec::new(),
            length,
        }
    }

    /// Record a write; later patches win over earlier ones
    pub fn push(&mut self, patch: Patch) {
        let (start, end) = patch.range();
        tracing::trace!("overlay patch 0x{:X}..0x{:X}", start, end);
        self.length = self.length.max(end);
        self.patches.push(patch);
    }

    /// Grow the logical length to at least `length`
    pub fn extend_to(&mut self, length: u64) {
        self.length = self.length.max(length);
    }

    /// Number of recorded patches
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Borrow the underlying source
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop the patches and return the underlying source
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ByteSource> ByteSource for OverlaySource<S> {
    fn len(&self) -> u64 {
        self.length
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read range overflows"))?;
        if end > self.length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "range 0x{:X}..0x{:X} extends past end of overlay (0x{:X})",
                    offset, end, self.length
                ),
            ));
        }

        // Part backed by the inner source, zeros past its end
        let inner_len = self.inner.len();
        let backed = inner_len.saturating_sub(offset).min(buf.len() as u64) as usize;
        if backed > 0 {
            self.inner.read_at(offset, &mut buf[..backed])?;
        }
        buf[backed..].fill(0);

        for patch in &self.patches {
            let (patch_start, patch_end) = patch.range();
            let start = patch_start.max(offset);
            let stop = patch_end.min(end);
            if start >= stop {
                continue;
            }

            let dst = &mut buf[(start - offset) as usize..(stop - offset) as usize];
            match patch {
                Patch::Zero { .. } => dst.fill(0),
                Patch::Data { bytes, .. } => {
                    let from = (start - patch_start) as usize;
                    dst.copy_from_slice(&bytes[from..from + dst.len()]);
                }
            }
        }

        Ok(())
    }
}
