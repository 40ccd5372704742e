//! Micro-batch partitioning
//!
//! Records arrive one at a time from the paginated reader and leave as
//! numbered [`Batch`]es. Two thresholds are supported:
//!
//! - [`BatchPolicy::RecordCount`]: emit the whole accumulator once it holds
//!   `n` records. Every batch but the last has exactly `n` records.
//! - [`BatchPolicy::ByteSize`]: track the serialized (JSON) size of the
//!   accumulator. When it reaches the bound, **split in half**: the first
//!   half (at least one record) is emitted, the second half stays and keeps
//!   accumulating. This bounds peak memory without draining on every
//!   crossing. Records still buffered when the process dies are lost; only
//!   [`Partitioner::finish`] flushes the tail.
//!
//! Sequence numbers start at 1 and increase by one per emitted batch.

use crate::error::Result;
use crate::models::{Batch, BatchId, StudyRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    RecordCount(usize),
    ByteSize(usize),
}

pub struct Partitioner {
    batch_id: BatchId,
    policy: BatchPolicy,
    buffer: Vec<StudyRecord>,
    /// Serialized size of each buffered record, parallel to `buffer`
    sizes: Vec<usize>,
    buffered_bytes: usize,
    next_sequence: u32,
    records_emitted: u64,
}

impl Partitioner {
    pub fn new(batch_id: BatchId, policy: BatchPolicy) -> Self {
        Self {
            batch_id,
            policy,
            buffer: Vec::new(),
            sizes: Vec::new(),
            buffered_bytes: 0,
            next_sequence: 1,
            records_emitted: 0,
        }
    }

    /// Add one record; returns a batch when the threshold was reached.
    pub fn accumulate(&mut self, record: StudyRecord) -> Result<Option<Batch>> {
        match self.policy {
            BatchPolicy::RecordCount(max) => {
                self.buffer.push(record);
                if self.buffer.len() >= max.max(1) {
                    let records = std::mem::take(&mut self.buffer);
                    return Ok(Some(self.emit(records)));
                }
            },
            BatchPolicy::ByteSize(max) => {
                // +1 for the separator inside a JSON array
                let size = serde_json::to_vec(&record)?.len() + 1;
                self.buffer.push(record);
                self.sizes.push(size);
                self.buffered_bytes += size;

                if self.buffered_bytes + 2 >= max {
                    let half = (self.buffer.len() / 2).max(1);
                    let records: Vec<StudyRecord> = self.buffer.drain(..half).collect();
                    let freed: usize = self.sizes.drain(..half).sum();
                    self.buffered_bytes -= freed;
                    return Ok(Some(self.emit(records)));
                }
            },
        }
        Ok(None)
    }

    /// Feed a whole page, collecting every batch it completes.
    pub fn accumulate_all(
        &mut self,
        records: impl IntoIterator<Item = StudyRecord>,
    ) -> Result<Vec<Batch>> {
        let mut ready = Vec::new();
        for record in records {
            if let Some(batch) = self.accumulate(record)? {
                ready.push(batch);
            }
        }
        Ok(ready)
    }

    /// Source exhausted: emit any remainder as a final, possibly short batch.
    pub fn finish(mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.buffer);
        Some(self.emit(records))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn batches_emitted(&self) -> u32 {
        self.next_sequence - 1
    }

    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    fn emit(&mut self, records: Vec<StudyRecord>) -> Batch {
        let batch = Batch {
            batch_id: self.batch_id.clone(),
            sequence: self.next_sequence,
            records,
        };
        self.next_sequence += 1;
        self.records_emitted += batch.len() as u64;
        tracing::debug!(
            batch_id = %batch.batch_id,
            sequence = batch.sequence,
            records = batch.len(),
            "Micro-batch ready"
        );
        batch
    }
}
