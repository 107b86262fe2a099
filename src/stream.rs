//! Buffered byte streams feeding the data block engine.
//!
//! A [`ByteStream`] hands out views of its internal buffer instead of copying into a caller
//! buffer: the consumer asks for "at least N bytes", looks at what it got, and then says how
//! much of it was used.  This decouples the size of the underlying reads from the block size.

use std::{
    fs::File,
    io::{ErrorKind, Read, Result},
    path::{Path, PathBuf},
};

/// A source of file content with a look-ahead buffer.
pub trait ByteStream {
    /// Returns a view of the buffered data, reading more first if fewer than `min_wanted` bytes
    /// are available.  The flag is true when the stream is exhausted, i.e. no data beyond the
    /// returned view will ever arrive.
    ///
    /// The view may be shorter than `min_wanted` only at the end of the stream.
    fn get_buffered_data(&mut self, min_wanted: usize) -> Result<(&[u8], bool)>;

    /// Marks `consumed` bytes of the last returned view as used.
    ///
    /// # Panics
    ///
    /// Panics if `consumed` is larger than the length of the last returned view.
    fn advance(&mut self, consumed: usize);

    /// A name for the stream, for diagnostics.
    fn filename(&self) -> &Path;
}

/// The default read buffer for [`BufferedStream`].
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// A [`ByteStream`] over anything implementing [`Read`], usually a [`File`].
#[derive(Debug)]
pub struct BufferedStream<R> {
    reader: R,
    name: PathBuf,
    buffer: Box<[u8]>,
    offset: usize,
    used: usize,
    available: usize,
    eof: bool,
}

impl BufferedStream<File> {
    /// Opens a file on the host for reading.
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        Ok(Self::new(File::open(path)?, path, buffer_size))
    }
}

impl<R: Read> BufferedStream<R> {
    pub fn new(reader: R, name: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            reader,
            name: name.into(),
            buffer: vec![0; buffer_size.max(1)].into_boxed_slice(),
            offset: 0,
            used: 0,
            available: 0,
            eof: false,
        }
    }

    /// Moves the unconsumed tail of the buffer to the front and fills the rest.
    fn precache(&mut self) -> Result<()> {
        if self.offset > 0 {
            self.buffer.copy_within(self.offset..self.used, 0);
            self.used -= self.offset;
            self.offset = 0;
        }

        while self.used < self.buffer.len() {
            match self.reader.read(&mut self.buffer[self.used..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.used += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<R: Read> ByteStream for BufferedStream<R> {
    fn get_buffered_data(&mut self, min_wanted: usize) -> Result<(&[u8], bool)> {
        let wanted = min_wanted.min(self.buffer.len());
        if self.used - self.offset < wanted && !self.eof {
            self.precache()?;
        }
        self.available = self.used - self.offset;
        Ok((&self.buffer[self.offset..self.used], self.eof))
    }

    fn advance(&mut self, consumed: usize) {
        assert!(
            consumed <= self.available,
            "advancing {consumed} bytes past {} available in {:?}",
            self.available,
            self.name
        );
        self.offset += consumed;
        self.available -= consumed;
    }

    fn filename(&self) -> &Path {
        &self.name
    }
}

/// A [`ByteStream`] over bytes that are already in memory.
#[derive(Debug)]
pub struct MemoryStream<'a> {
    data: &'a [u8],
    name: PathBuf,
    offset: usize,
    available: usize,
}

impl<'a> MemoryStream<'a> {
    pub fn new(data: &'a [u8], name: impl Into<PathBuf>) -> Self {
        Self {
            data,
            name: name.into(),
            offset: 0,
            available: 0,
        }
    }
}

impl ByteStream for MemoryStream<'_> {
    fn get_buffered_data(&mut self, _min_wanted: usize) -> Result<(&[u8], bool)> {
        self.available = self.data.len() - self.offset;
        Ok((&self.data[self.offset..], true))
    }

    fn advance(&mut self, consumed: usize) {
        assert!(
            consumed <= self.available,
            "advancing {consumed} bytes past {} available in {:?}",
            self.available,
            self.name
        );
        self.offset += consumed;
        self.available -= consumed;
    }

    fn filename(&self) -> &Path {
        &self.name
    }
}
