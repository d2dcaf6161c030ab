//! Chunk pipeline
//!
//! Applies `skipFile`, `skipLines` and `chunkSize` to a record sequence and
//! yields batches. Nothing is read ahead: a batch is pulled from the record
//! stream only when the caller asks for it, so at most one batch is held in
//! memory per source.

use crate::config::SourceSpec;
use crate::reader::RawRecord;

/// Chunking rules of one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub skip_file: bool,
    pub skip_lines: usize,
    /// `None` puts every remaining record in a single batch
    pub chunk_size: Option<usize>,
}

impl From<&SourceSpec> for ChunkPolicy {
    fn from(spec: &SourceSpec) -> Self {
        Self {
            skip_file: spec.skip_file,
            skip_lines: spec.skip_lines,
            chunk_size: spec.chunk_size,
        }
    }
}

/// Consecutive records written in one round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 0-based position of the batch within its source
    pub index: usize,
    pub records: Vec<RawRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazy batch iterator over a record sequence
pub struct Chunks<I> {
    records: I,
    policy: ChunkPolicy,
    skipped: usize,
    next_index: usize,
    done: bool,
}

/// Group `records` into batches under `policy`
pub fn chunk<I, E>(records: I, policy: ChunkPolicy) -> Chunks<I>
where
    I: Iterator<Item = Result<RawRecord, E>>,
{
    Chunks {
        records,
        policy,
        skipped: 0,
        next_index: 0,
        done: policy.skip_file,
    }
}

impl<I> Chunks<I> {
    /// Records discarded by `skipLines` so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of batches yielded so far
    pub fn batches(&self) -> usize {
        self.next_index
    }
}

impl<I, E> Iterator for Chunks<I>
where
    I: Iterator<Item = Result<RawRecord, E>>,
{
    type Item = Result<Batch, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while self.skipped < self.policy.skip_lines {
            match self.records.next() {
                Some(Ok(_)) => self.skipped += 1,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                },
                None => {
                    self.done = true;
                    return None;
                },
            }
        }

        let limit = self.policy.chunk_size.unwrap_or(usize::MAX);
        let mut records = Vec::with_capacity(limit.min(1024));
        while records.len() < limit {
            match self.records.next() {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => {
                    // the partial batch is dropped, never written
                    self.done = true;
                    return Some(Err(e));
                },
                None => {
                    self.done = true;
                    break;
                },
            }
        }

        if records.is_empty() {
            self.done = true;
            return None;
        }

        let batch = Batch {
            index: self.next_index,
            records,
        };
        self.next_index += 1;
        Some(Ok(batch))
    }
}
