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
//! Batch groups: the sorted units an external sort stages and merges.
//!
//! A group is either one resident batch ordered by its SV2, or a spill file
//! whose first merged chunk is still held in memory. Either way the group is
//! consumed as a sequence of sorted runs whose concatenation is ordered.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::row::{Row, Rows};

use crate::common::error::Result;
use crate::exec::chunk::Chunk;
use crate::exec::operators::sort::comparator::RowComparator;
use crate::exec::selection::SelectionVector2;
use crate::exec::spill::{SpillFile, SpillProfile, SpillStream};
use crate::runtime::mem_tracker::{MemTracker, TrackedBytes};
use crate::runtime::profile::ScopedTimer;

#[derive(Debug)]
enum RunOrder {
    /// Physical order is arbitrary; logical order goes through the SV2.
    Selection(SelectionVector2),
    /// Physical order is the sorted order.
    Physical,
}

/// One batch with its encoded sort keys, readable in sorted order.
#[derive(Debug)]
pub struct SortedRun {
    chunk: Chunk,
    keys: Rows,
    order: RunOrder,
    _keys_reservation: TrackedBytes,
}

impl SortedRun {
    /// A batch ordered through `sv2`; `keys` are indexed by physical row.
    pub(crate) fn with_selection(
        chunk: Chunk,
        sv2: SelectionVector2,
        keys: Rows,
        tracker: &Arc<MemTracker>,
    ) -> Self {
        debug_assert_eq!(sv2.len(), chunk.len());
        let reservation = TrackedBytes::new(keys.size(), Arc::clone(tracker));
        Self {
            chunk,
            keys,
            order: RunOrder::Selection(sv2),
            _keys_reservation: reservation,
        }
    }

    /// A batch whose rows are already in sorted order.
    pub(crate) fn in_order(chunk: Chunk, keys: Rows, tracker: &Arc<MemTracker>) -> Self {
        let reservation = TrackedBytes::new(keys.size(), Arc::clone(tracker));
        Self {
            chunk,
            keys,
            order: RunOrder::Physical,
            _keys_reservation: reservation,
        }
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Physical row holding logical position `pos`.
    pub fn row_at(&self, pos: usize) -> usize {
        match &self.order {
            RunOrder::Selection(sv2) => sv2.get(pos),
            RunOrder::Physical => pos,
        }
    }

    pub fn key_at(&self, pos: usize) -> Row<'_> {
        self.keys.row(self.row_at(pos))
    }

    /// Key of physical row `row`.
    pub fn key_of_row(&self, row: usize) -> Row<'_> {
        self.keys.row(row)
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.chunk.batch
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn selection(&self) -> Option<&SelectionVector2> {
        match &self.order {
            RunOrder::Selection(sv2) => Some(sv2),
            RunOrder::Physical => None,
        }
    }

    /// Drop the keys and selection vector, keeping the column buffers.
    pub fn into_chunk(self) -> Chunk {
        self.chunk
    }

    /// Resident bytes: column buffers, encoded keys and the selection vector.
    pub fn memory_bytes(&self) -> usize {
        let sv2_bytes = self.selection().map_or(0, SelectionVector2::memory_bytes);
        self.chunk
            .logical_bytes()
            .saturating_add(self.keys.size())
            .saturating_add(sv2_bytes)
    }
}

/// What restoring spilled runs needs: key encoding and memory accounting.
pub(crate) struct RestoreContext<'a> {
    pub comparator: &'a RowComparator,
    pub tracker: &'a Arc<MemTracker>,
    pub profile: Option<&'a SpillProfile>,
}

#[derive(Debug)]
struct SpillSource {
    stream: Option<SpillStream>,
    file: SpillFile,
}

/// A sorted unit staged by the operator. Owned exclusively; dropping it
/// releases its buffers and deletes its spill file.
#[derive(Debug)]
pub struct BatchGroup {
    head: Option<SortedRun>,
    spill: Option<SpillSource>,
    rows: u64,
}

impl BatchGroup {
    pub fn resident(run: SortedRun) -> Self {
        let rows = run.len() as u64;
        Self {
            head: Some(run),
            spill: None,
            rows,
        }
    }

    /// A spilled group: `head` is the first merged chunk, `file` holds the rest.
    pub fn spilled(head: Option<SortedRun>, file: SpillFile) -> Self {
        let rows = head.as_ref().map_or(0, |r| r.len() as u64) + file.num_rows();
        Self {
            head,
            spill: Some(SpillSource { stream: None, file }),
            rows,
        }
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Bytes held in memory by this group.
    pub fn resident_bytes(&self) -> usize {
        self.head.as_ref().map_or(0, SortedRun::memory_bytes)
    }

    pub fn head(&self) -> Option<&SortedRun> {
        self.head.as_ref()
    }

    /// The single run of a resident group.
    pub(crate) fn into_resident_run(self) -> Option<SortedRun> {
        if self.spill.is_some() {
            return None;
        }
        self.head
    }

    /// Next sorted run: the resident head first, then restored spill chunks.
    pub(crate) fn next_run(&mut self, ctx: &RestoreContext<'_>) -> Result<Option<SortedRun>> {
        if let Some(run) = self.head.take() {
            return Ok(Some(run));
        }
        let Some(source) = self.spill.as_mut() else {
            return Ok(None);
        };
        let _timer = ctx
            .profile
            .map(|p| ScopedTimer::new(Arc::clone(&p.restore_time)));
        if source.stream.is_none() {
            source.stream = Some(source.file.open_stream()?);
        }
        let Some(stream) = source.stream.as_mut() else {
            return Ok(None);
        };
        let Some(batch) = stream.next_batch()? else {
            return Ok(None);
        };
        if let Some(profile) = ctx.profile {
            profile.restore_rows.add(batch.num_rows() as i64);
        }
        let keys = ctx.comparator.encode_keys(&batch)?;
        let chunk = Chunk::new_tracked(batch, ctx.tracker);
        Ok(Some(SortedRun::in_order(chunk, keys, ctx.tracker)))
    }
}
