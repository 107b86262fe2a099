//! The data block engine.
//!
//! Each regular file is cut into `block_size` chunks which are compressed (see [`pool`]) and
//! appended to the data region.  A file's blocks must be contiguous on disk, so deduplication
//! works on whole runs: once all of a file's blocks are written, earlier runs with the same
//! per-block hashes and size words are compared byte-for-byte against the new one, and on a
//! match the new bytes are truncated away again.  The remainder of a file that doesn't fill a
//! whole block is packed into a shared fragment block, or written as a short block of its own
//! that ends the file's run and takes part in the comparison.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    mem,
    thread::Scope,
};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    compress::{CompressError, Compressor},
    squashfs::format::{FragmentEntry, DATA_SIZE_MASK},
    stream::ByteStream,
};

pub(crate) mod pool;

use pool::{process_block, BlockPool, Job};

/// Errors from packing file content.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("Compression failed")]
    Compress(#[from] CompressError),
    #[error("Compression workers exited unexpectedly")]
    WorkersGone,
    #[error("Too many fragment blocks")]
    TooManyFragments,
}

/// The destination of an image: written sequentially, but read back for deduplication and
/// truncated when a duplicate run is dropped.
pub trait ImageOutput: Read + Write + Seek {
    /// Cuts the output to `len` bytes and moves the write position there.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl ImageOutput for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

impl ImageOutput for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len_usize = usize::try_from(len).map_err(io::Error::other)?;
        self.get_mut().truncate(len_usize);
        self.set_position(len);
        Ok(())
    }
}

/// Where a file's tail lives inside a fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
    pub len: u32,
}

/// The placement of one regular file's content in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLayout {
    /// Absolute offset of the first stored block.
    pub blocks_start: u64,
    /// One size word per block, see [`crate::squashfs::format::DATA_UNCOMPRESSED`].
    pub block_sizes: Vec<u32>,
    pub fragment: Option<FragmentRef>,
    pub size: u64,
    /// Bytes covered by sparse (all-zero, unstored) blocks.
    pub sparse: u64,
}

impl FileLayout {
    /// The number of blocks a file of `size` bytes has with the given block size, depending on
    /// whether the tail is in a fragment.
    pub fn block_count(size: u64, block_size: u32, has_fragment: bool) -> u64 {
        match has_fragment {
            true => size / block_size as u64,
            false => size.div_ceil(block_size as u64),
        }
    }

    /// The number of bytes the blocks occupy on disk.
    pub fn stored_len(&self) -> u64 {
        self.block_sizes.iter().map(|w| stored_len(*w)).sum()
    }
}

/// Per-file packing flags, usually from a sort file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackFlags {
    pub dont_compress: bool,
    pub dont_fragment: bool,
    pub dont_deduplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOptions {
    pub block_size: u32,
    pub tail_packing: bool,
    pub deduplicate: bool,
    pub workers: usize,
}

/// Counters reported after packing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataStats {
    pub files: u64,
    pub bytes_in: u64,
    /// Stored data blocks, short tail blocks included.
    pub blocks_written: u64,
    pub sparse_blocks: u64,
    pub duplicate_blocks: u64,
    pub tail_blocks: u64,
    pub fragment_blocks: u64,
}

/// The result of [`DataWriter::finish()`].
#[derive(Debug)]
pub struct DataSummary {
    pub fragments: Vec<FragmentEntry>,
    pub stats: DataStats,
    /// The output position after the data region.
    pub end: u64,
}

fn stored_len(size_word: u32) -> u64 {
    (size_word & DATA_SIZE_MASK) as u64
}

/// A block written for some file, remembered for deduplication.
#[derive(Debug)]
struct BlockRecord {
    hash: u32,
    raw_len: usize,
    offset: u64,
    size_word: u32,
}

#[derive(Debug, Default)]
struct FileState {
    blocks_start: Option<u64>,
    block_sizes: Vec<u32>,
    sparse: u64,
}

/// Packs file content into the data region of an image.
pub struct DataWriter<'o, 'env, W: ImageOutput> {
    output: &'o mut W,
    compressor: &'env dyn Compressor,
    pool: BlockPool<'env>,
    options: DataOptions,
    position: u64,
    records: Vec<BlockRecord>,
    by_hash: HashMap<u32, Vec<usize>>,
    fragment: Vec<u8>,
    fragments: Vec<FragmentEntry>,
    stats: DataStats,
}

impl<'o, 'env, W: ImageOutput> DataWriter<'o, 'env, W> {
    /// Starts a data region at the output's current position.  Compression threads are
    /// spawned on `scope`.
    pub fn new<'scope>(
        scope: &'scope Scope<'scope, 'env>,
        output: &'o mut W,
        compressor: &'env dyn Compressor,
        options: DataOptions,
    ) -> io::Result<Self> {
        let position = output.stream_position()?;
        Ok(Self {
            output,
            compressor,
            pool: BlockPool::new(scope, compressor, options.workers),
            options,
            position,
            records: Vec::new(),
            by_hash: HashMap::new(),
            fragment: Vec::with_capacity(options.block_size as usize),
            fragments: Vec::new(),
            stats: DataStats::default(),
        })
    }

    /// Reads a whole stream and packs it, returning where the content ended up.
    pub fn ingest(
        &mut self,
        stream: &mut dyn ByteStream,
        flags: PackFlags,
    ) -> Result<FileLayout, DataError> {
        let block_size = self.options.block_size as usize;
        let first_record = self.records.len();
        let mut file = FileState::default();
        let mut size = 0u64;

        let mut tail = loop {
            let (data, eof) = stream.get_buffered_data(block_size)?;
            if data.len() >= block_size {
                let block = data[..block_size].to_vec();
                stream.advance(block_size);
                size += block_size as u64;
                self.submit(
                    Job {
                        data: block,
                        compress: !flags.dont_compress,
                        sparse: true,
                    },
                    &mut file,
                )?;
            } else if eof {
                let tail = data.to_vec();
                stream.advance(tail.len());
                size += tail.len() as u64;
                break tail;
            }
        };

        while let Some(block) = self.pool.next_block()? {
            self.commit(block, &mut file)?;
        }

        let to_fragment =
            !tail.is_empty() && self.options.tail_packing && !flags.dont_fragment;
        let tail_block = !tail.is_empty() && !to_fragment;
        if tail_block {
            // the short block ends the run and is deduplicated along with it
            let block = process_block(
                self.compressor,
                0,
                Job {
                    data: mem::take(&mut tail),
                    compress: !flags.dont_compress,
                    sparse: false,
                },
            )?;
            self.commit(block, &mut file)?;
            self.stats.tail_blocks += 1;
        }
        let mut blocks_start = file.blocks_start;

        let run = first_record..self.records.len();
        if !run.is_empty() {
            if self.options.deduplicate && !flags.dont_deduplicate {
                if let Some(start) = self.find_duplicate(run.clone())? {
                    let file_start = self.records[run.start].offset;
                    trace!(
                        "{:?}: {} blocks duplicate the run at {start:#x}",
                        stream.filename(),
                        run.len()
                    );
                    let stored = self.records[run.clone()]
                        .iter()
                        .filter(|r| r.size_word != 0)
                        .count() as u64;
                    self.output.truncate(file_start)?;
                    self.position = file_start;
                    self.records.truncate(run.start);
                    self.stats.duplicate_blocks += stored;
                    self.stats.blocks_written -= stored;
                    if tail_block {
                        self.stats.tail_blocks -= 1;
                    }
                    blocks_start = Some(start);
                }
            }
            for index in run.start..self.records.len() {
                self.by_hash
                    .entry(self.records[index].hash)
                    .or_default()
                    .push(index);
            }
        }

        let fragment = match to_fragment {
            true => Some(self.add_fragment(&tail)?),
            false => None,
        };

        self.stats.files += 1;
        self.stats.bytes_in += size;

        Ok(FileLayout {
            blocks_start: blocks_start.unwrap_or(0),
            block_sizes: file.block_sizes,
            fragment,
            size,
            sparse: file.sparse,
        })
    }

    fn submit(&mut self, job: Job, file: &mut FileState) -> Result<(), DataError> {
        while self.pool.is_full() {
            match self.pool.next_block()? {
                Some(block) => self.commit(block, file)?,
                None => break,
            }
        }
        self.pool.submit(job)
    }

    fn commit(&mut self, block: pool::Block, file: &mut FileState) -> Result<(), DataError> {
        file.blocks_start.get_or_insert(self.position);
        if block.size_word == 0 {
            file.sparse += block.raw_len as u64;
            self.stats.sparse_blocks += 1;
        } else {
            self.output.write_all(&block.stored)?;
            self.stats.blocks_written += 1;
        }

        self.records.push(BlockRecord {
            hash: block.hash,
            raw_len: block.raw_len,
            offset: self.position,
            size_word: block.size_word,
        });
        self.position += block.stored.len() as u64;
        file.block_sizes.push(block.size_word);
        Ok(())
    }

    /// Looks for an earlier, physically contiguous run with the same blocks as `run`.
    fn find_duplicate(&mut self, run: std::ops::Range<usize>) -> Result<Option<u64>, DataError> {
        let count = run.len();
        let Some(candidates) = self.by_hash.get(&self.records[run.start].hash) else {
            return Ok(None);
        };

        let mut matches = vec![];
        for &start in candidates {
            if start + count > run.start {
                continue;
            }
            let same_shape = (0..count).all(|k| {
                let old = &self.records[start + k];
                let new = &self.records[run.start + k];
                old.hash == new.hash
                    && old.raw_len == new.raw_len
                    && old.size_word == new.size_word
            });
            let contiguous = (start..start + count - 1).all(|i| {
                self.records[i].offset + stored_len(self.records[i].size_word)
                    == self.records[i + 1].offset
            });
            if same_shape && contiguous {
                matches.push(start);
            }
        }

        let new_start = self.records[run.start].offset;
        let len = self.position - new_start;
        for start in matches {
            let old_start = self.records[start].offset;
            if self.same_bytes(old_start, new_start, len)? {
                return Ok(Some(old_start));
            }
        }
        Ok(None)
    }

    /// Compares two stored ranges of the output, leaving the position at the end.
    fn same_bytes(&mut self, a: u64, b: u64, len: u64) -> io::Result<bool> {
        const CHUNK: u64 = 64 * 1024;
        let mut left = vec![0; CHUNK as usize];
        let mut right = vec![0; CHUNK as usize];
        let mut done = 0;
        let mut equal = true;

        while done < len && equal {
            let n = CHUNK.min(len - done) as usize;
            self.output.seek(SeekFrom::Start(a + done))?;
            self.output.read_exact(&mut left[..n])?;
            self.output.seek(SeekFrom::Start(b + done))?;
            self.output.read_exact(&mut right[..n])?;
            equal = left[..n] == right[..n];
            done += n as u64;
        }

        self.output.seek(SeekFrom::Start(self.position))?;
        Ok(equal)
    }

    fn add_fragment(&mut self, tail: &[u8]) -> Result<FragmentRef, DataError> {
        if self.fragment.len() + tail.len() > self.options.block_size as usize {
            self.flush_fragment()?;
        }
        let index =
            u32::try_from(self.fragments.len()).map_err(|_| DataError::TooManyFragments)?;
        let reference = FragmentRef {
            index,
            offset: self.fragment.len() as u32,
            len: tail.len() as u32,
        };
        self.fragment.extend_from_slice(tail);
        Ok(reference)
    }

    fn flush_fragment(&mut self) -> Result<(), DataError> {
        if self.fragment.is_empty() {
            return Ok(());
        }

        let data = mem::take(&mut self.fragment);
        let block = process_block(
            self.compressor,
            0,
            Job {
                data,
                compress: true,
                sparse: false,
            },
        )?;
        trace!(
            "fragment block {} at {:#x}, {} bytes",
            self.fragments.len(),
            self.position,
            block.stored.len()
        );
        self.fragments.push(FragmentEntry {
            start: self.position.into(),
            size: block.size_word.into(),
            unused: 0.into(),
        });
        self.output.write_all(&block.stored)?;
        self.position += block.stored.len() as u64;
        self.stats.fragment_blocks += 1;
        Ok(())
    }

    /// Writes the last fragment block and shuts the compression workers down.
    pub fn finish(mut self) -> Result<DataSummary, DataError> {
        self.flush_fragment()?;
        debug!("data region packed: {:?}", self.stats);
        Ok(DataSummary {
            fragments: self.fragments,
            stats: self.stats,
            end: self.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::{CompressorConfig, CompressorRegistry},
        squashfs::format::DATA_UNCOMPRESSED,
        stream::MemoryStream,
    };

    const BS: u32 = 4096;

    fn options(workers: usize) -> DataOptions {
        DataOptions {
            block_size: BS,
            tail_packing: true,
            deduplicate: true,
            workers,
        }
    }

    fn pattern(len: usize, seed: u32) -> Vec<u8> {
        (0..len as u32)
            .map(|i| (i.wrapping_mul(2654435761).wrapping_add(seed) >> 13) as u8)
            .collect()
    }

    fn pack(
        options: DataOptions,
        files: &[(&[u8], PackFlags)],
    ) -> (Vec<FileLayout>, DataSummary, Vec<u8>) {
        let compressor = CompressorRegistry::with_defaults()
            .create(&CompressorConfig::default())
            .unwrap();
        let compressor = &*compressor;
        let mut output = Cursor::new(vec![0u8; 96]);
        output.seek(SeekFrom::End(0)).unwrap();

        let (layouts, summary) = std::thread::scope(|scope| {
            let mut writer = DataWriter::new(scope, &mut output, compressor, options).unwrap();
            let layouts: Vec<_> = files
                .iter()
                .map(|(data, flags)| {
                    writer
                        .ingest(&mut MemoryStream::new(data, "test"), *flags)
                        .unwrap()
                })
                .collect();
            (layouts, writer.finish().unwrap())
        });
        (layouts, summary, output.into_inner())
    }

    #[test]
    fn exact_multiple_has_no_tail() {
        let data = pattern(3 * BS as usize, 1);
        let (layouts, summary, image) = pack(options(1), &[(&data, PackFlags::default())]);
        let layout = &layouts[0];
        assert_eq!(layout.blocks_start, 96);
        assert_eq!(layout.block_sizes.len(), 3);
        assert_eq!(layout.fragment, None);
        assert!(summary.fragments.is_empty());
        assert_eq!(image.len() as u64, 96 + layout.stored_len());
    }

    #[test]
    fn identical_files_share_blocks() {
        let data = pattern(2 * BS as usize + 100, 2);
        let other = pattern(BS as usize, 3);
        let (layouts, summary, image) = pack(
            options(3),
            &[
                (&data, PackFlags::default()),
                (&other, PackFlags::default()),
                (&data, PackFlags::default()),
            ],
        );
        assert_eq!(layouts[0].blocks_start, layouts[2].blocks_start);
        assert_eq!(layouts[0].block_sizes, layouts[2].block_sizes);
        assert_eq!(summary.stats.duplicate_blocks, 2);
        assert_eq!(summary.stats.blocks_written, 3);

        // both tails are packed into the single fragment block
        let (a, b) = (layouts[0].fragment.unwrap(), layouts[2].fragment.unwrap());
        assert_eq!(a.index, b.index);
        assert_ne!(a.offset, b.offset);
        assert_eq!(summary.fragments.len(), 1);

        let expected = 96 + layouts[0].stored_len() + layouts[1].stored_len();
        let fragment_size = (summary.fragments[0].size.get() & DATA_SIZE_MASK) as u64;
        assert_eq!(image.len() as u64, expected + fragment_size);
    }

    #[test]
    fn dedup_can_be_disabled() {
        let data = pattern(2 * BS as usize, 4);
        let flags = PackFlags {
            dont_deduplicate: true,
            ..Default::default()
        };
        let (layouts, summary, _) = pack(
            options(1),
            &[(&data, PackFlags::default()), (&data, flags)],
        );
        assert_ne!(layouts[0].blocks_start, layouts[1].blocks_start);
        assert_eq!(summary.stats.duplicate_blocks, 0);
    }

    #[test]
    fn tail_blocks_without_packing() {
        let data = pattern(2 * BS as usize + 100, 5);
        let other = pattern(BS as usize + 10, 9);
        let opts = DataOptions {
            tail_packing: false,
            ..options(1)
        };
        let (layouts, summary, image) = pack(
            opts,
            &[
                (&data, PackFlags::default()),
                (&other, PackFlags::default()),
                (&data, PackFlags::default()),
            ],
        );
        for layout in &layouts {
            assert_eq!(layout.fragment, None);
        }
        assert_eq!(layouts[0].block_sizes.len(), 3);

        // the whole run, short block included, is shared
        assert_eq!(layouts[0].blocks_start, layouts[2].blocks_start);
        assert_eq!(layouts[0].block_sizes, layouts[2].block_sizes);
        assert_eq!(summary.stats.duplicate_blocks, 3);
        assert_eq!(summary.stats.blocks_written, 5);
        assert_eq!(summary.stats.tail_blocks, 2);
        assert!(summary.fragments.is_empty());
        assert_eq!(
            image.len() as u64,
            96 + layouts[0].stored_len() + layouts[1].stored_len()
        );
    }

    #[test]
    fn unfragmented_file_matches_only_with_the_same_tail() {
        let mut data = pattern(BS as usize, 10);
        let mut longer = data.clone();
        data.extend(pattern(50, 11));
        longer.extend(pattern(60, 11));
        let no_frag = PackFlags {
            dont_fragment: true,
            ..Default::default()
        };
        let (layouts, summary, _) = pack(
            options(1),
            &[(&data, no_frag), (&longer, no_frag), (&data, no_frag)],
        );
        assert_ne!(layouts[0].blocks_start, layouts[1].blocks_start);
        assert_eq!(layouts[0].blocks_start, layouts[2].blocks_start);
        assert_eq!(summary.stats.duplicate_blocks, 2);
    }

    #[test]
    fn fragment_block_rolls_over() {
        let a = pattern(3000, 6);
        let b = pattern(3000, 7);
        let no_frag = PackFlags {
            dont_fragment: true,
            ..Default::default()
        };
        let (layouts, summary, _) = pack(
            options(1),
            &[
                (&a, PackFlags::default()),
                (&b, PackFlags::default()),
                (&a, no_frag),
            ],
        );
        assert_eq!(layouts[0].fragment.unwrap().index, 0);
        assert_eq!(layouts[1].fragment.unwrap().index, 1);
        assert_eq!(layouts[1].fragment.unwrap().offset, 0);
        assert_eq!(layouts[2].fragment, None);
        assert_eq!(layouts[2].block_sizes.len(), 1);
        assert_eq!(summary.fragments.len(), 2);
    }

    #[test]
    fn sparse_and_raw_blocks() {
        let mut data = vec![0u8; 2 * BS as usize];
        data.extend(pattern(BS as usize, 8));
        let raw = PackFlags {
            dont_compress: true,
            ..Default::default()
        };
        let (layouts, summary, _) = pack(options(2), &[(&data, raw)]);
        let layout = &layouts[0];
        assert_eq!(layout.block_sizes, [0, 0, BS | DATA_UNCOMPRESSED]);
        assert_eq!(layout.sparse, 2 * BS as u64);
        assert_eq!(summary.stats.sparse_blocks, 2);
    }

    #[test]
    fn empty_file() {
        let (layouts, summary, image) = pack(options(1), &[(b"", PackFlags::default())]);
        assert_eq!(layouts[0], FileLayout::default());
        assert_eq!(summary.stats.files, 1);
        assert_eq!(image.len(), 96);
    }
}
