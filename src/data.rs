//! Data writer: compresses file content into fixed-size blocks or packs small tails into shared
//! fragments, spreading block compression across a worker pool while keeping each file's blocks
//! in their original order in the data section.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use deku::prelude::*;
use rustc_hash::FxHasher;
use tracing::instrument;

use crate::compressor::{self, FilesystemCompressor};
use crate::error::Error;
use crate::fragment::Fragment;

/// A compressed block size as stored in a file's block-size list: bit 24 marks "stored
/// uncompressed" (the block is copied verbatim because compression would have expanded it), the
/// low 24 bits hold the length. A value of zero denotes a sparse hole: no bytes are stored for
/// that block at all.
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DataSize(u32);

const UNCOMPRESSED_BIT: u32 = 1 << 24;

impl DataSize {
    pub fn compressed(len: u32) -> Self {
        Self(len)
    }

    pub fn uncompressed(len: u32) -> Self {
        Self(len | UNCOMPRESSED_BIT)
    }

    pub fn hole() -> Self {
        Self(0)
    }

    pub fn is_hole(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0 & !UNCOMPRESSED_BIT
    }

    pub fn is_uncompressed(self) -> bool {
        self.0 & UNCOMPRESSED_BIT != 0
    }
}

pub(crate) enum Added {
    Data {
        blocks_start: u64,
        block_sizes: Vec<DataSize>,
        /// A multi-block file's undersized final sub-block, packed into the shared fragment
        /// buffer instead of emitted as a short standalone block. `None` when the file's length
        /// is an exact multiple of the block size.
        tail: Option<(u32, u32)>,
    },
    Fragment {
        frag_index: u32,
        block_offset: u32,
    },
}

/// A file's materialised content as handed over by the tar decoder.
pub(crate) enum FileBody {
    /// A contiguous run of bytes (the common case).
    Dense(Vec<u8>),
    /// A sparse file: `logical_size` is block-aligned (callers pad the final block), and
    /// `extents` lists the materialised byte ranges in ascending, non-overlapping order. Any
    /// block not covered by an extent is a hole.
    Sparse {
        logical_size: u64,
        extents: Vec<(u64, Vec<u8>)>,
    },
}

struct Job {
    index: usize,
    payload: Vec<u8>,
}

struct JobResult {
    index: usize,
    outcome: Result<(DataSize, Vec<u8>), String>,
}

fn compress_one(
    payload: &[u8],
    fc: &FilesystemCompressor,
    block_size: u32,
) -> Result<(DataSize, Vec<u8>), Error> {
    match compressor::compress_block(payload, fc, block_size)? {
        Some(compressed) => Ok((DataSize::compressed(compressed.len() as u32), compressed)),
        None => Ok((DataSize::uncompressed(payload.len() as u32), payload.to_vec())),
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Persistent worker pool (`num_jobs` threads, each holding its own [`FilesystemCompressor`])
/// plus the data and fragment sections being assembled. Each call that submits a file's blocks
/// collects them back in original order before appending to the data section, so two files never
/// interleave their blocks; the pool itself is shared and reused across the whole image.
pub(crate) struct DataWriter {
    block_size: u32,
    compressor: FilesystemCompressor,
    data_bytes: Vec<u8>,
    data_start: u64,
    fragment_bytes: Vec<u8>,
    fragment_table: Vec<Fragment>,
    dedup: HashMap<u64, Added>,
    job_tx: SyncSender<Job>,
    result_rx: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
}

impl Added {
    fn clone_for_dedup(&self) -> Self {
        match self {
            Added::Data {
                blocks_start,
                block_sizes,
                tail,
            } => Added::Data {
                blocks_start: *blocks_start,
                block_sizes: block_sizes.clone(),
                tail: *tail,
            },
            Added::Fragment {
                frag_index,
                block_offset,
            } => Added::Fragment {
                frag_index: *frag_index,
                block_offset: *block_offset,
            },
        }
    }
}

impl DataWriter {
    #[instrument(skip_all)]
    pub fn new(
        compressor: FilesystemCompressor,
        data_start: u64,
        block_size: u32,
        num_jobs: usize,
        backlog: usize,
    ) -> Self {
        let num_jobs = num_jobs.max(1);
        let (job_tx, job_rx) = sync_channel::<Job>(backlog.max(num_jobs));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx): (Sender<JobResult>, Receiver<JobResult>) = channel();

        let workers = (0..num_jobs)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                let fc = compressor;
                std::thread::spawn(move || loop {
                    let job = {
                        let rx = job_rx.lock().expect("job queue mutex poisoned");
                        rx.recv()
                    };
                    let Ok(job) = job else { break };
                    let outcome = compress_one(&job.payload, &fc, block_size)
                        .map_err(|e| e.to_string());
                    if result_tx
                        .send(JobResult {
                            index: job.index,
                            outcome,
                        })
                        .is_err()
                    {
                        break;
                    }
                })
            })
            .collect();

        Self {
            block_size,
            compressor,
            data_bytes: Vec::new(),
            data_start,
            fragment_bytes: Vec::new(),
            fragment_table: Vec::new(),
            dedup: HashMap::new(),
            job_tx,
            result_rx,
            workers,
        }
    }

    /// Submits `payloads` to the worker pool and collects the results back in submission order,
    /// appending non-hole blocks to the data section as they arrive in sequence. `payloads[i] ==
    /// None` marks a sparse hole and is never sent to a worker.
    fn write_blocks(&mut self, payloads: Vec<Option<Vec<u8>>>) -> Result<Vec<DataSize>, Error> {
        let mut pending = 0usize;
        for (index, payload) in payloads.iter().enumerate() {
            if let Some(bytes) = payload {
                self.job_tx
                    .send(Job {
                        index,
                        payload: bytes.clone(),
                    })
                    .map_err(|_| Error::internal("data worker pool hung up"))?;
                pending += 1;
            }
        }

        // Workers may finish out of order; collect every result first (they land here regardless
        // of arrival order, keyed by their original block index) and only then append to the data
        // section in index order, so two files' blocks never interleave.
        let mut slots: Vec<Option<(DataSize, Vec<u8>)>> = payloads
            .iter()
            .map(|p| p.as_ref().map(|_| None).unwrap_or(Some((DataSize::hole(), Vec::new()))))
            .collect();

        for _ in 0..pending {
            let result = self
                .result_rx
                .recv()
                .map_err(|_| Error::internal("data worker pool hung up"))?;
            let outcome = result.outcome.map_err(Error::Compression)?;
            slots[result.index] = Some(outcome);
        }

        let mut sizes = Vec::with_capacity(slots.len());
        for slot in slots {
            let (size, bytes) = slot.ok_or_else(|| Error::internal("data block missing after collection"))?;
            if !bytes.is_empty() {
                self.data_bytes.write_all(&bytes)?;
            }
            sizes.push(size);
        }
        Ok(sizes)
    }

    /// Adds a file's content, returning whether it landed in the data section or a fragment.
    #[instrument(skip(self, body))]
    pub fn add_file(&mut self, body: FileBody) -> Result<Added, Error> {
        match body {
            FileBody::Dense(bytes) => self.add_dense(bytes),
            FileBody::Sparse {
                logical_size,
                extents,
            } => self.add_sparse(logical_size, extents),
        }
    }

    fn add_dense(&mut self, bytes: Vec<u8>) -> Result<Added, Error> {
        let is_empty = bytes.is_empty();

        if !is_empty && (bytes.len() as u32) < self.block_size {
            return self.add_fragment(bytes);
        }

        if is_empty {
            return Ok(Added::Data {
                blocks_start: self.data_bytes.len() as u64 + self.data_start,
                block_sizes: vec![],
                tail: None,
            });
        }

        let hash = hash_bytes(&bytes);
        if let Some(cached) = self.dedup.get(&hash) {
            return Ok(cached.clone_for_dedup());
        }

        // Full blocks go through the worker pool in order; a non-empty undersized remainder is
        // packed into the shared fragment buffer instead of written out as a short block, so its
        // bytes can be deduplicated against other files' tails.
        let block_size = self.block_size as usize;
        let full_len = (bytes.len() / block_size) * block_size;
        let (full_bytes, tail_bytes) = bytes.split_at(full_len);

        let blocks_start = self.data_bytes.len() as u64 + self.data_start;
        let payloads: Vec<Option<Vec<u8>>> = full_bytes
            .chunks(block_size)
            .map(|c| Some(c.to_vec()))
            .collect();
        let block_sizes = self.write_blocks(payloads)?;

        let tail = if tail_bytes.is_empty() {
            None
        } else {
            match self.add_fragment(tail_bytes.to_vec())? {
                Added::Fragment {
                    frag_index,
                    block_offset,
                } => Some((frag_index, block_offset)),
                Added::Data { .. } => unreachable!("add_fragment always returns Added::Fragment"),
            }
        };

        let added = Added::Data {
            blocks_start,
            block_sizes,
            tail,
        };
        self.dedup.insert(hash, added.clone_for_dedup());
        Ok(added)
    }

    fn add_sparse(&mut self, logical_size: u64, extents: Vec<(u64, Vec<u8>)>) -> Result<Added, Error> {
        let block_size = self.block_size as u64;
        let num_blocks = (logical_size / block_size) as usize;
        let mut payloads: Vec<Option<Vec<u8>>> = vec![None; num_blocks];

        for (offset, data) in &extents {
            let mut pos = *offset;
            let mut remaining = &data[..];
            while !remaining.is_empty() {
                let block_idx = (pos / block_size) as usize;
                let in_block = (pos % block_size) as usize;
                let space = block_size as usize - in_block;
                let take = space.min(remaining.len());

                let slot = payloads[block_idx].get_or_insert_with(|| vec![0u8; block_size as usize]);
                slot[in_block..in_block + take].copy_from_slice(&remaining[..take]);

                remaining = &remaining[take..];
                pos += take as u64;
            }
        }

        let blocks_start = self.data_bytes.len() as u64 + self.data_start;
        let block_sizes = self.write_blocks(payloads)?;
        Ok(Added::Data {
            blocks_start,
            block_sizes,
            tail: None,
        })
    }

    /// Buffers a small tail into the current fragment, flushing it to the data section first if
    /// it wouldn't fit.
    fn add_fragment(&mut self, bytes: Vec<u8>) -> Result<Added, Error> {
        if bytes.len() + self.fragment_bytes.len() > self.block_size as usize {
            self.flush_fragment()?;
        }

        let frag_index = self.fragment_table.len() as u32;
        let block_offset = self.fragment_bytes.len() as u32;
        self.fragment_bytes.extend_from_slice(&bytes);

        Ok(Added::Fragment {
            frag_index,
            block_offset,
        })
    }

    fn flush_fragment(&mut self) -> Result<(), Error> {
        if self.fragment_bytes.is_empty() {
            return Ok(());
        }
        let start = self.data_bytes.len() as u64 + self.data_start;
        let (size, bytes) = compress_one(&self.fragment_bytes, &self.compressor, self.block_size)?;
        self.fragment_table.push(Fragment {
            start,
            size: size.0,
            unused: 0,
        });
        self.data_bytes.write_all(&bytes)?;
        self.fragment_bytes.clear();
        Ok(())
    }

    /// Flushes the last in-progress fragment. Must be called before [`DataWriter::into_parts`].
    pub fn finalize(&mut self) -> Result<(), Error> {
        self.flush_fragment()
    }

    /// Shuts down the worker pool and returns the assembled data section and fragment table.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Fragment>) {
        drop(self.job_tx);
        for worker in self.workers {
            let _ = worker.join();
        }
        (self.data_bytes, self.fragment_table)
    }
}
