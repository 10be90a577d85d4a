//! Memory-mapped source

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;
use vhdx_core::{ByteSource, MAX_MMAP_SIZE};

/// A source backed by a read-only memory mapping of the whole file.
///
/// # Example
///
/// ```rust,no_run
/// use vhdx_pipeline::MmapSource;
/// use std::path::Path;
///
/// let source = MmapSource::open(Path::new("disk.vhdx")).unwrap();
/// ```
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    /// Map a file read-only
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, is not a
    /// regular file, or is larger than `MAX_MMAP_SIZE`
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping. The file must not be truncated while
    /// the mapping is alive (caller responsibility).
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Map an already open file
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "File size {} exceeds memory mapping limit {}",
                    metadata.len(),
                    MAX_MMAP_SIZE
                ),
            ));
        }

        // SAFETY: the descriptor is valid, the file is a regular file of
        // bounded size, and the mapping is read-only.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap })
    }

    /// The whole mapped file
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MmapSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds usize"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} bytes at 0x{:X} extend past end of mapping (0x{:X})",
                        buf.len(),
                        offset,
                        self.mmap.len()
                    ),
                )
            })?;

        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }
}
