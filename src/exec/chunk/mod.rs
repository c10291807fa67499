// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;

use crate::runtime::mem_tracker::MemTracker;

/// A record batch plus the memory tracker currently charged for it.
///
/// The batch is cheap to clone (buffers are shared); accounting is shared by
/// clones and released once the last clone drops.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    accounting: Option<Arc<ChunkAccounting>>,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            accounting: None,
        }
    }

    /// Wrap `batch` and charge it to `tracker` immediately.
    pub fn new_tracked(batch: RecordBatch, tracker: &Arc<MemTracker>) -> Self {
        let mut chunk = Self::new(batch);
        chunk.transfer_to(tracker);
        chunk
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    /// Zero-copy slice sharing this chunk's charge; the buffers stay charged
    /// until the last holder drops. The slice reports its row share of the charge.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
            accounting: self.accounting.clone(),
        }
    }

    /// Bytes charged (or that would be charged) for this chunk.
    ///
    /// A slice of a tracked chunk reports the charge pro rata by rows, so the
    /// slices of one charge never sum to more than the charge itself.
    pub fn logical_bytes(&self) -> usize {
        match self.accounting.as_ref() {
            Some(accounting) => accounting.share(self.len()),
            None => record_batch_bytes(&self.batch),
        }
    }

    pub fn tracker(&self) -> Option<Arc<MemTracker>> {
        self.accounting.as_ref().map(|a| a.tracker())
    }

    /// Move the charge for this chunk to `tracker` (charging it first if untracked).
    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return;
        }
        let bytes = chunk_bytes_i64(&self.batch);
        if bytes <= 0 {
            return;
        }
        self.accounting = Some(Arc::new(ChunkAccounting::new(
            bytes,
            self.batch.num_rows(),
            tracker,
        )));
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within one batch; slices sharing buffers
/// across batches are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    /// Rows of the batch the charge was taken for.
    rows: usize,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn new(bytes: i64, rows: usize, tracker: &Arc<MemTracker>) -> Self {
        tracker.consume(bytes);
        Self {
            bytes,
            rows,
            tracker: Mutex::new(Arc::clone(tracker)),
        }
    }

    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.release(self.bytes);
        tracker.consume(self.bytes);
        *guard = Arc::clone(tracker);
    }

    fn share(&self, rows: usize) -> usize {
        let bytes = u128::try_from(self.bytes).unwrap_or(0);
        if rows >= self.rows || self.rows == 0 {
            return usize::try_from(bytes).unwrap_or(usize::MAX);
        }
        usize::try_from(bytes * rows as u128 / self.rows as u128).unwrap_or(usize::MAX)
    }

    fn tracker(&self) -> Arc<MemTracker> {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        guard.release(self.bytes);
    }
}

fn chunk_bytes_i64(batch: &RecordBatch) -> i64 {
    i64::try_from(record_batch_bytes(batch)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None, Some(3)])),
                Arc::new(StringArray::from(vec!["x", "y", "z"])),
            ],
        )
        .expect("record batch")
    }

    #[test]
    fn accounting_follows_transfers_and_last_clone() {
        let upstream = MemTracker::new_root("upstream");
        let sort = MemTracker::new_root("sort");
        let chunk = Chunk::new_tracked(batch(), &upstream);
        let bytes = i64::try_from(chunk.logical_bytes()).expect("bytes");
        assert!(bytes > 0);
        assert_eq!(upstream.current(), bytes);

        let mut moved = chunk.clone();
        moved.transfer_to(&sort);
        assert_eq!(upstream.current(), 0);
        assert_eq!(sort.current(), bytes);

        drop(chunk);
        assert_eq!(sort.current(), bytes);
        drop(moved);
        assert_eq!(sort.current(), 0);
    }

    #[test]
    fn slice_shares_parent_charge() {
        let tracker = MemTracker::new_root("sort");
        let chunk = Chunk::new_tracked(batch(), &tracker);
        let charged = tracker.current();
        let slice = chunk.slice(1, 2);
        assert_eq!(slice.len(), 2);
        assert_eq!(tracker.current(), charged);
        assert!(Arc::ptr_eq(&slice.tracker().expect("tracked"), &tracker));
        drop(chunk);
        assert_eq!(tracker.current(), charged);
        drop(slice);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn slices_split_the_parent_charge_by_rows() {
        let tracker = MemTracker::new_root("sort");
        let values = (0..1000).collect::<Vec<i32>>();
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))])
            .expect("record batch");
        let chunk = Chunk::new_tracked(batch, &tracker);
        let charged = chunk.logical_bytes();
        assert_eq!(i64::try_from(charged).expect("bytes"), tracker.current());

        let slices = [chunk.slice(0, 400), chunk.slice(400, 400), chunk.slice(800, 200)];
        let total: usize = slices.iter().map(Chunk::logical_bytes).sum();
        assert!(total <= charged, "slices={total} charged={charged}");
        assert!(slices[0].logical_bytes() > slices[2].logical_bytes());
        assert_eq!(chunk.slice(0, 1000).logical_bytes(), charged);
    }
}
