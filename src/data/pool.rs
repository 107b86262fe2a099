//! The block compression pool.
//!
//! With more than one worker, blocks are handed to a fixed set of threads over a bounded
//! crossbeam channel and come back in whatever order the workers finish them.  A min-heap keyed
//! on the sequence number restores submission order before the owner sees them, so the data
//! region is laid out identically no matter how the work was scheduled.  With a single worker
//! the blocks are compressed inline.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    thread::Scope,
};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use xxhash_rust::xxh32::xxh32;

use super::DataError;
use crate::{
    compress::{CompressError, Compressor},
    squashfs::format::DATA_UNCOMPRESSED,
};

/// How many blocks each worker may have queued or in progress.
const IN_FLIGHT_PER_WORKER: usize = 4;

/// A block waiting to be compressed.
#[derive(Debug)]
pub(crate) struct Job {
    pub data: Vec<u8>,
    pub compress: bool,
    /// Whether an all-zero block may be recorded as a hole.
    pub sparse: bool,
}

/// A block that is ready to be written.
#[derive(Debug)]
pub(crate) struct Block {
    pub seq: u64,
    /// xxh32 of the uncompressed content.
    pub hash: u32,
    pub raw_len: usize,
    /// The bytes to write; empty for sparse blocks.
    pub stored: Vec<u8>,
    pub size_word: u32,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Block {}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Hashes and compresses one block, storing it raw when compression doesn't pay off.
pub(crate) fn process_block(
    compressor: &dyn Compressor,
    seq: u64,
    job: Job,
) -> Result<Block, CompressError> {
    let hash = xxh32(&job.data, 0);
    let raw_len = job.data.len();

    if job.sparse && job.data.iter().all(|b| *b == 0) {
        return Ok(Block {
            seq,
            hash,
            raw_len,
            stored: Vec::new(),
            size_word: 0,
        });
    }

    let compressed = match job.compress {
        true => Some(compressor.compress(&job.data)?),
        false => None,
    };

    Ok(match compressed {
        Some(stored) if stored.len() < raw_len => Block {
            seq,
            hash,
            raw_len,
            size_word: stored.len() as u32,
            stored,
        },
        _ => Block {
            seq,
            hash,
            raw_len,
            size_word: raw_len as u32 | DATA_UNCOMPRESSED,
            stored: job.data,
        },
    })
}

pub(crate) struct MultiThreadedState {
    jobs: Sender<(u64, Job)>,
    results: Receiver<(u64, Result<Block, CompressError>)>,
    heap: BinaryHeap<Reverse<Block>>,
    next: u64,
    limit: usize,
}

pub(crate) enum PoolMode<'env> {
    SingleThreaded {
        compressor: &'env dyn Compressor,
        ready: VecDeque<Block>,
    },
    MultiThreaded(MultiThreadedState),
}

/// Compresses blocks in submission order, possibly on several threads.
pub(crate) struct BlockPool<'env> {
    mode: PoolMode<'env>,
    submitted: u64,
    in_flight: usize,
}

impl<'env> BlockPool<'env> {
    /// Creates a pool with `workers` threads spawned on `scope`.  The threads exit when the
    /// pool is dropped.
    pub fn new<'scope>(
        scope: &'scope Scope<'scope, 'env>,
        compressor: &'env dyn Compressor,
        workers: usize,
    ) -> Self {
        let mode = if workers <= 1 {
            PoolMode::SingleThreaded {
                compressor,
                ready: VecDeque::new(),
            }
        } else {
            let limit = workers * IN_FLIGHT_PER_WORKER;
            let (job_sender, job_receiver) = bounded::<(u64, Job)>(limit);
            // Never holds more than `limit` entries because of the in-flight bound.
            let (result_sender, result_receiver) = unbounded();

            for _ in 0..workers {
                let jobs = job_receiver.clone();
                let results = result_sender.clone();
                scope.spawn(move || {
                    for (seq, job) in jobs {
                        if results.send((seq, process_block(compressor, seq, job))).is_err() {
                            break;
                        }
                    }
                });
            }
            debug!("started {workers} compression workers");

            PoolMode::MultiThreaded(MultiThreadedState {
                jobs: job_sender,
                results: result_receiver,
                heap: BinaryHeap::new(),
                next: 0,
                limit,
            })
        };

        Self {
            mode,
            submitted: 0,
            in_flight: 0,
        }
    }

    /// Whether [`Self::next_block()`] has to be called before the next submission.
    pub fn is_full(&self) -> bool {
        match &self.mode {
            PoolMode::SingleThreaded { .. } => self.in_flight > 0,
            PoolMode::MultiThreaded(state) => self.in_flight >= state.limit,
        }
    }

    pub fn submit(&mut self, job: Job) -> Result<(), DataError> {
        debug_assert!(!self.is_full());

        let seq = self.submitted;
        match &mut self.mode {
            PoolMode::SingleThreaded { compressor, ready } => {
                ready.push_back(process_block(*compressor, seq, job)?);
            }
            PoolMode::MultiThreaded(state) => {
                state
                    .jobs
                    .send((seq, job))
                    .map_err(|_| DataError::WorkersGone)?;
            }
        }
        self.submitted += 1;
        self.in_flight += 1;
        Ok(())
    }

    /// Returns the next block in submission order, waiting for it if necessary, or `None` if
    /// nothing is pending.
    ///
    /// A compression failure is returned as soon as any worker reports it.
    pub fn next_block(&mut self) -> Result<Option<Block>, DataError> {
        if self.in_flight == 0 {
            return Ok(None);
        }

        let block = match &mut self.mode {
            PoolMode::SingleThreaded { ready, .. } => ready.pop_front(),
            PoolMode::MultiThreaded(state) => loop {
                if state
                    .heap
                    .peek()
                    .is_some_and(|Reverse(top)| top.seq == state.next)
                {
                    break state.heap.pop().map(|Reverse(block)| block);
                }

                let (_, result) = state
                    .results
                    .recv()
                    .map_err(|_| DataError::WorkersGone)?;
                state.heap.push(Reverse(result?));
            },
        };

        if let PoolMode::MultiThreaded(state) = &mut self.mode {
            state.next += 1;
        }
        self.in_flight -= 1;
        Ok(block)
    }
}
