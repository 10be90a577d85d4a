//! Stream source - positional reads over a seekable stream

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use vhdx_core::ByteSource;

/// A `ByteSource` over any `Read + Seek` stream.
///
/// The length is taken once when the source is created; images are opened
/// read-only and are not expected to change underneath the decoder.
///
/// # Example
///
/// ```rust,no_run
/// use vhdx_pipeline::MemorySource;
/// use vhdx_core::ByteSource;
///
/// let mut source = MemorySource::from_bytes(vec![0u8; 1024]);
/// let header = source.read_bytes(512, 256).unwrap();
/// ```
pub struct StreamSource<R: Read + Seek + Send> {
    inner: R,
    length: u64,
}

/// A source backed by an open file
pub type FileSource = StreamSource<File>;

/// A source backed by an in-memory buffer
pub type MemorySource = StreamSource<Cursor<Vec<u8>>>;

impl<R: Read + Seek + Send> StreamSource<R> {
    /// Wrap a stream, measuring its length by seeking to the end
    pub fn new(mut inner: R) -> io::Result<Self> {
        let length = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, length })
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl FileSource {
    /// Open a file read-only
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a regular file or cannot be opened
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if !file.metadata()?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Self::new(file)
    }
}

impl MemorySource {
    /// Wrap an owned buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Self {
            inner: Cursor::new(bytes),
            length,
        }
    }
}

impl<R: Read + Seek + Send> ByteSource for StreamSource<R> {
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
                    "range 0x{:X}..0x{:X} extends past end of source (0x{:X})",
                    offset, end, self.length
                ),
            ));
        }

        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)
    }
}
