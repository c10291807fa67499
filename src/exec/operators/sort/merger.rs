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
//! K-way priority-queue merge over batch groups.
//!
//! Each group contributes its sorted runs one at a time. The heap holds the
//! current key of every live group; popping the smallest names the next
//! output row. Winning rows are gathered column-wise once per output chunk.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::row::OwnedRow;

use crate::common::error::Result;
use crate::exec::chunk::Chunk;
use crate::exec::operators::sort::batch_group::{BatchGroup, RestoreContext, SortedRun};
use crate::exec::operators::sort::comparator::RowComparator;
use crate::exec::spill::SpillProfile;
use crate::runtime::mem_tracker::MemTracker;

#[derive(Debug)]
struct MergeHeapEntry {
    key: OwnedRow,
    source: usize,
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeHeapEntry {}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap keeps the largest element on top; reverse for a min-heap.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

#[derive(Debug)]
struct MergeCursor {
    run: SortedRun,
    pos: usize,
    slot: usize,
}

/// Merges the runs of several batch groups into sorted output chunks.
#[derive(Debug)]
pub struct KWayMerger {
    comparator: Arc<RowComparator>,
    tracker: Arc<MemTracker>,
    profile: Option<SpillProfile>,
    groups: Vec<BatchGroup>,
    cursors: Vec<Option<MergeCursor>>,
    heap: BinaryHeap<MergeHeapEntry>,
    /// Batches referenced by the rows collected for the chunk being built.
    arena: Vec<RecordBatch>,
    rows_remaining: u64,
}

impl KWayMerger {
    pub fn try_new(
        comparator: Arc<RowComparator>,
        tracker: Arc<MemTracker>,
        profile: Option<SpillProfile>,
        groups: Vec<BatchGroup>,
    ) -> Result<Self> {
        let rows_remaining = groups.iter().map(BatchGroup::rows).sum();
        let mut merger = Self {
            comparator,
            tracker,
            profile,
            cursors: (0..groups.len()).map(|_| None).collect(),
            groups,
            heap: BinaryHeap::new(),
            arena: Vec::new(),
            rows_remaining,
        };
        for source in 0..merger.groups.len() {
            merger.load_next_run(source)?;
        }
        Ok(merger)
    }

    pub fn schema(&self) -> &SchemaRef {
        self.comparator.schema()
    }

    pub fn rows_remaining(&self) -> u64 {
        self.rows_remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }

    /// Merge up to `max_rows` rows into one chunk charged to the merge tracker.
    pub fn next_chunk(&mut self, max_rows: usize) -> Result<Option<Chunk>> {
        let max_rows = max_rows.max(1);
        let mut indices = Vec::with_capacity(max_rows.min(self.rows_remaining as usize));
        while indices.len() < max_rows {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            let source = entry.source;
            let Some(cursor) = self.cursors[source].as_mut() else {
                continue;
            };
            indices.push((cursor.slot, cursor.run.row_at(cursor.pos)));
            cursor.pos += 1;
            if cursor.pos < cursor.run.len() {
                self.heap.push(MergeHeapEntry {
                    key: cursor.run.key_at(cursor.pos).owned(),
                    source,
                });
            } else {
                self.load_next_run(source)?;
            }
        }
        if indices.is_empty() {
            self.arena.clear();
            return Ok(None);
        }
        let batches = self.arena.iter().collect::<Vec<_>>();
        let batch = self.comparator.copy_rows(&batches, &indices)?;
        self.rows_remaining = self.rows_remaining.saturating_sub(indices.len() as u64);
        self.compact_arena();
        Ok(Some(Chunk::new_tracked(batch, &self.tracker)))
    }

    fn load_next_run(&mut self, source: usize) -> Result<()> {
        self.cursors[source] = None;
        let ctx = RestoreContext {
            comparator: self.comparator.as_ref(),
            tracker: &self.tracker,
            profile: self.profile.as_ref(),
        };
        while let Some(run) = self.groups[source].next_run(&ctx)? {
            if run.is_empty() {
                continue;
            }
            let slot = self.arena.len();
            self.arena.push(run.batch().clone());
            self.heap.push(MergeHeapEntry {
                key: run.key_at(0).owned(),
                source,
            });
            self.cursors[source] = Some(MergeCursor { run, pos: 0, slot });
            break;
        }
        Ok(())
    }

    /// Keep only the batches live cursors still point into.
    fn compact_arena(&mut self) {
        let mut retained = Vec::with_capacity(self.cursors.len());
        for cursor in self.cursors.iter_mut().flatten() {
            let batch = std::mem::replace(
                &mut self.arena[cursor.slot],
                RecordBatch::new_empty(self.comparator.schema().clone()),
            );
            cursor.slot = retained.len();
            retained.push(batch);
        }
        self.arena = retained;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::operators::sort::comparator::SortExpression;
    use crate::exec::operators::sort::single_batch_sorter::sort_batch;
    use crate::exec::selection::SelectionVector2;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, true),
            Field::new("v", DataType::Utf8, true),
        ]))
    }

    fn resident_group(
        cmp: &RowComparator,
        tracker: &Arc<MemTracker>,
        k: Vec<Option<i32>>,
        v: Vec<&str>,
    ) -> BatchGroup {
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int32Array::from(k)), Arc::new(StringArray::from(v))],
        )
        .expect("record batch");
        let mut sv2 = SelectionVector2::identity(batch.num_rows());
        let keys = sort_batch(cmp, &batch, &mut sv2).expect("sort");
        BatchGroup::resident(SortedRun::with_selection(
            Chunk::new_tracked(batch, tracker),
            sv2,
            keys,
            tracker,
        ))
    }

    fn keys_of(chunk: &Chunk) -> Vec<Option<i32>> {
        chunk
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .expect("int32")
            .iter()
            .collect()
    }

    #[test]
    fn merges_groups_in_bounded_chunks() {
        let tracker = MemTracker::new_root("merge");
        let cmp = Arc::new(
            RowComparator::try_new(schema(), &[SortExpression::asc("k")]).expect("comparator"),
        );
        let groups = vec![
            resident_group(&cmp, &tracker, vec![Some(5), Some(1), None], vec!["e", "a", "n"]),
            resident_group(&cmp, &tracker, vec![Some(4), Some(2)], vec!["d", "b"]),
            resident_group(&cmp, &tracker, vec![Some(3)], vec!["c"]),
        ];
        let mut merger =
            KWayMerger::try_new(Arc::clone(&cmp), Arc::clone(&tracker), None, groups)
                .expect("merger");
        assert_eq!(merger.rows_remaining(), 6);

        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while let Some(chunk) = merger.next_chunk(4).expect("merge") {
            sizes.push(chunk.len());
            out.extend(keys_of(&chunk));
        }
        assert_eq!(sizes, vec![4, 2]);
        assert_eq!(
            out,
            vec![Some(1), Some(2), Some(3), Some(4), Some(5), None]
        );
        assert!(merger.is_exhausted());
        drop(merger);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn equal_keys_are_all_emitted() {
        let tracker = MemTracker::new_root("merge");
        let cmp = Arc::new(
            RowComparator::try_new(schema(), &[SortExpression::desc("k")]).expect("comparator"),
        );
        let groups = vec![
            resident_group(&cmp, &tracker, vec![Some(7), Some(7)], vec!["x", "y"]),
            resident_group(&cmp, &tracker, vec![Some(7), Some(9)], vec!["z", "w"]),
        ];
        let mut merger =
            KWayMerger::try_new(cmp, tracker, None, groups).expect("merger");
        let chunk = merger.next_chunk(100).expect("merge").expect("chunk");
        assert_eq!(keys_of(&chunk), vec![Some(9), Some(7), Some(7), Some(7)]);
        assert!(merger.next_chunk(100).expect("merge").is_none());
    }
}
