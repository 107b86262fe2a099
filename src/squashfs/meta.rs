//! Metadata block packing.
//!
//! Inode records and directory listings are variable-length records packed back to back into
//! blocks of at most [`META_BLOCK_SIZE`] bytes, each block compressed on its own and prefixed by
//! a u16 header.  A record is addressed by a [`MetaRef`]: the byte offset of the block header
//! within its table and the offset of the record within the uncompressed block.

use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use log::trace;
use zerocopy::{FromBytes, IntoBytes};

use super::{
    format::{META_BLOCK_SIZE, META_SIZE_MASK, META_UNCOMPRESSED},
    reader::ReaderError,
};
use crate::compress::{CompressError, Compressor};

/// A reference to a record inside a metadata table.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaRef {
    /// Byte offset of the block header, relative to the start of the table.
    pub block: u64,
    /// Offset of the record in the uncompressed block.
    pub offset: u16,
}

impl MetaRef {
    pub fn new(block: u64, offset: u16) -> Self {
        Self { block, offset }
    }

    /// The packed 64-bit form stored in the superblock, export table and xattr ids.
    pub fn to_raw(self) -> u64 {
        (self.block << 16) | self.offset as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            block: raw >> 16,
            offset: (raw & 0xffff) as u16,
        }
    }
}

impl fmt::Debug for MetaRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.block, self.offset)
    }
}

/// Decodes a metadata block header into `(stored length, compressed)`.
pub fn parse_header(header: u16) -> (usize, bool) {
    (
        (header & META_SIZE_MASK) as usize,
        header & META_UNCOMPRESSED == 0,
    )
}

/// Accumulates records and seals them into compressed metadata blocks.
///
/// The writer is finished by value, so no reference can be handed out after the final block
/// has been sealed.
pub struct MetaWriter<'c> {
    compressor: &'c dyn Compressor,
    store_uncompressed: bool,
    current: Vec<u8>,
    sealed: Vec<u8>,
    block_starts: Vec<u64>,
}

impl fmt::Debug for MetaWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MetaWriter")
            .field("position", &self.position())
            .field("blocks", &self.block_starts.len())
            .finish()
    }
}

impl<'c> MetaWriter<'c> {
    pub fn new(compressor: &'c dyn Compressor, store_uncompressed: bool) -> Self {
        Self {
            compressor,
            store_uncompressed,
            current: Vec::with_capacity(META_BLOCK_SIZE),
            sealed: Vec::new(),
            block_starts: Vec::new(),
        }
    }

    /// The reference the next appended byte would get.
    pub fn position(&self) -> MetaRef {
        MetaRef::new(self.sealed.len() as u64, self.current.len() as u16)
    }

    /// Whether anything has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.current.is_empty()
    }

    /// Appends one record, returning its reference.
    ///
    /// A record that doesn't fit in the rest of the current block starts a new one; records
    /// larger than a whole block are split across consecutive blocks.
    pub fn append(&mut self, record: &[u8]) -> Result<MetaRef, CompressError> {
        if !self.current.is_empty() && self.current.len() + record.len() > META_BLOCK_SIZE {
            self.seal()?;
        }

        let reference = self.position();
        let mut rest = record;
        while !rest.is_empty() {
            let room = META_BLOCK_SIZE - self.current.len();
            let (now, later) = rest.split_at(room.min(rest.len()));
            self.current.extend_from_slice(now);
            rest = later;
            if self.current.len() == META_BLOCK_SIZE {
                self.seal()?;
            }
        }

        trace!("metadata record of {} bytes at {reference:?}", record.len());
        Ok(reference)
    }

    fn seal(&mut self) -> Result<(), CompressError> {
        if self.current.is_empty() {
            return Ok(());
        }

        self.block_starts.push(self.sealed.len() as u64);
        let compressed = match self.store_uncompressed {
            true => None,
            false => Some(self.compressor.compress(&self.current)?),
        };
        match compressed {
            Some(data) if data.len() < self.current.len() => {
                self.sealed
                    .extend_from_slice(&(data.len() as u16).to_le_bytes());
                self.sealed.extend_from_slice(&data);
            }
            _ => {
                let header = self.current.len() as u16 | META_UNCOMPRESSED;
                self.sealed.extend_from_slice(&header.to_le_bytes());
                self.sealed.extend_from_slice(&self.current);
            }
        }
        self.current.clear();
        Ok(())
    }

    /// Seals the last block and returns the table bytes.
    pub fn finish(self) -> Result<Vec<u8>, CompressError> {
        self.finish_with_index().map(|(table, _)| table)
    }

    /// Like [`Self::finish()`], additionally returning the offset of every block within the
    /// table.  Lookup tables store these offsets so that entries can be found by index.
    pub fn finish_with_index(mut self) -> Result<(Vec<u8>, Vec<u64>), CompressError> {
        self.seal()?;
        Ok((self.sealed, self.block_starts))
    }
}

/// One decompressed metadata block and the table offset of the block after it.
#[derive(Clone)]
struct CachedBlock {
    data: Rc<[u8]>,
    next: u64,
}

/// Read access to a metadata table inside an image.
///
/// `data` runs from the start of the table to the end of the image, so a block may be read from
/// anywhere in it; every header and length is checked against that bound.
pub struct MetaTable<'i> {
    name: &'static str,
    data: &'i [u8],
    compressor: Rc<dyn Compressor>,
    cache: RefCell<HashMap<u64, CachedBlock>>,
}

impl fmt::Debug for MetaTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MetaTable")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl<'i> MetaTable<'i> {
    pub fn new(name: &'static str, data: &'i [u8], compressor: Rc<dyn Compressor>) -> Self {
        Self {
            name,
            data,
            compressor,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn out_of_bounds(&self, offset: u64, len: u64) -> ReaderError {
        ReaderError::OutOfBounds {
            table: self.name,
            offset,
            len,
            size: self.data.len() as u64,
        }
    }

    fn load(&self, start: u64) -> Result<CachedBlock, ReaderError> {
        if let Some(block) = self.cache.borrow().get(&start) {
            return Ok(block.clone());
        }

        let header = usize::try_from(start)
            .ok()
            .and_then(|s| self.data.get(s..s.checked_add(2)?))
            .ok_or_else(|| self.out_of_bounds(start, 2))?;
        let (len, compressed) = parse_header(u16::from_le_bytes([header[0], header[1]]));
        let body_start = start + 2;
        let stored = self
            .data
            .get(body_start as usize..body_start as usize + len)
            .ok_or_else(|| self.out_of_bounds(body_start, len as u64))?;

        let data: Rc<[u8]> = match compressed {
            true => self
                .compressor
                .decompress(stored, META_BLOCK_SIZE)
                .map_err(|source| ReaderError::Decompress {
                    table: self.name,
                    source,
                })?
                .into(),
            false => stored.into(),
        };
        if data.is_empty() || data.len() > META_BLOCK_SIZE {
            return Err(ReaderError::corrupt(
                self.name,
                format!("metadata block at {start:#x} holds {} bytes", data.len()),
            ));
        }

        let block = CachedBlock {
            data,
            next: body_start + len as u64,
        };
        self.cache.borrow_mut().insert(start, block.clone());
        Ok(block)
    }

    /// Returns the decompressed block whose header is at `start`.
    pub fn block(&self, start: u64) -> Result<Rc<[u8]>, ReaderError> {
        Ok(self.load(start)?.data)
    }

    /// Returns a cursor positioned at `reference`.
    pub fn cursor(&self, reference: MetaRef) -> MetaCursor<'_, 'i> {
        MetaCursor {
            table: self,
            block: reference.block,
            offset: reference.offset as usize,
        }
    }
}

/// Reads records sequentially from a [`MetaTable`], crossing block boundaries as needed.
#[derive(Debug)]
pub struct MetaCursor<'t, 'i> {
    table: &'t MetaTable<'i>,
    block: u64,
    offset: usize,
}

impl MetaCursor<'_, '_> {
    /// The reference of the next byte to be read.
    pub fn position(&self) -> MetaRef {
        MetaRef::new(self.block, self.offset as u16)
    }

    pub fn table(&self) -> &'static str {
        self.table.name
    }

    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<(), ReaderError> {
        while !buf.is_empty() {
            let block = self.table.load(self.block)?;
            if self.offset > block.data.len() {
                return Err(ReaderError::corrupt(
                    self.table.name,
                    format!(
                        "offset {:#x} past the end of the block at {:#x}",
                        self.offset, self.block
                    ),
                ));
            }
            if self.offset == block.data.len() {
                self.block = block.next;
                self.offset = 0;
                continue;
            }

            let n = buf.len().min(block.data.len() - self.offset);
            let (now, rest) = buf.split_at_mut(n);
            now.copy_from_slice(&block.data[self.offset..self.offset + n]);
            self.offset += n;
            buf = rest;
        }
        Ok(())
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, ReaderError> {
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads one fixed-layout structure.
    pub fn read<T: FromBytes + IntoBytes>(&mut self) -> Result<T, ReaderError> {
        let mut value = T::new_zeroed();
        self.read_exact(value.as_mut_bytes())?;
        Ok(value)
    }
}
