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
//! Final merge of an external sort.
//!
//! Without spills the resident groups are merged in memory into one global
//! SV4 over a hyper-batch, and output is served as SV4 windows. With spills
//! (or when the in-memory build is refused) the operator streams merged
//! chunks from a [`KWayMerger`](super::merger::KWayMerger) instead.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::row::Row;

use crate::common::error::Result;
use crate::exec::operators::sort::batch_group::{BatchGroup, SortedRun};
use crate::exec::selection::{HyperBatch, MAX_SV4_BATCHES, SelectionVector4};
use crate::runtime::mem_tracker::MemTracker;

/// Largest hyper-batch, in resident bytes, sorted in memory.
pub const MAX_SORT_BYTES: usize = 1 << 30;

/// A read-only window of the global SV4 over the shared hyper-batch.
#[derive(Clone, Debug)]
pub struct IndirectBatch {
    hyper: Arc<HyperBatch>,
    sv4: Arc<SelectionVector4>,
    start: usize,
    len: usize,
}

impl IndirectBatch {
    pub fn schema(&self) -> &SchemaRef {
        self.hyper.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.len
    }

    pub fn hyper_batch(&self) -> &HyperBatch {
        &self.hyper
    }

    /// Packed `(batch, row)` entries of this window, in output order.
    pub fn entries(&self) -> &[u32] {
        self.sv4.window(self.start, self.len)
    }

    /// Materialize the window into a contiguous batch.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        Ok(self.hyper.gather(self.entries())?)
    }
}

/// Globally ordered view of all resident rows.
#[derive(Debug)]
pub struct InMemoryMerge {
    hyper: Arc<HyperBatch>,
    sv4: Arc<SelectionVector4>,
    position: usize,
}

impl InMemoryMerge {
    pub fn total_rows(&self) -> usize {
        self.sv4.len()
    }

    pub fn num_batches(&self) -> usize {
        self.hyper.num_batches()
    }

    /// Next window of at most `max_rows` rows.
    pub fn next_window(&mut self, max_rows: usize) -> Option<IndirectBatch> {
        if self.position >= self.sv4.len() {
            return None;
        }
        let len = max_rows.max(1).min(self.sv4.len() - self.position);
        let window = IndirectBatch {
            hyper: Arc::clone(&self.hyper),
            sv4: Arc::clone(&self.sv4),
            start: self.position,
            len,
        };
        self.position += len;
        Some(window)
    }
}

pub(crate) enum InMemoryBuild {
    Sorted(InMemoryMerge),
    /// The groups are handed back untouched; merge them by streaming instead.
    Refused {
        groups: Vec<BatchGroup>,
        reason: String,
    },
}

/// Merge the sorted runs of resident `groups` into one SV4.
///
/// Refuses spilled groups, more groups than an SV4 can address, more than
/// `max_sort_bytes` resident bytes, and SV4 allocations `tracker` cannot fit.
pub(crate) fn build_in_memory(
    schema: SchemaRef,
    groups: Vec<BatchGroup>,
    tracker: &Arc<MemTracker>,
    max_sort_bytes: usize,
) -> Result<InMemoryBuild> {
    if groups.iter().any(BatchGroup::is_spilled) {
        return Ok(InMemoryBuild::Refused {
            groups,
            reason: "spilled groups present".to_string(),
        });
    }
    if groups.len() > MAX_SV4_BATCHES {
        let reason = format!("{} batches exceed SV4 addressing", groups.len());
        return Ok(InMemoryBuild::Refused { groups, reason });
    }
    let resident_bytes = groups
        .iter()
        .map(BatchGroup::resident_bytes)
        .fold(0usize, usize::saturating_add);
    if resident_bytes > max_sort_bytes {
        let reason = format!("{resident_bytes} resident bytes exceed {max_sort_bytes}");
        return Ok(InMemoryBuild::Refused { groups, reason });
    }
    let total_rows = groups.iter().map(|g| g.rows() as usize).sum::<usize>();
    let sv4 = match SelectionVector4::allocate(total_rows, tracker) {
        Ok(sv4) => sv4,
        Err(err) => {
            return Ok(InMemoryBuild::Refused {
                groups,
                reason: err.to_string(),
            });
        }
    };
    let aux = match SelectionVector4::allocate(total_rows, tracker) {
        Ok(aux) => aux,
        Err(err) => {
            return Ok(InMemoryBuild::Refused {
                groups,
                reason: err.to_string(),
            });
        }
    };

    let runs = groups
        .into_iter()
        .filter_map(BatchGroup::into_resident_run)
        .collect::<Vec<_>>();
    let sv4 = merge_runs(&runs, sv4, aux);
    let chunks = runs.into_iter().map(SortedRun::into_chunk).collect();
    let hyper = HyperBatch::try_new(schema, chunks)?;
    Ok(InMemoryBuild::Sorted(InMemoryMerge {
        hyper: Arc::new(hyper),
        sv4: Arc::new(sv4),
        position: 0,
    }))
}

/// Concatenate the runs' logical orders, then merge adjacent runs pairwise
/// until one remains.
fn merge_runs(
    runs: &[SortedRun],
    mut src: SelectionVector4,
    mut dst: SelectionVector4,
) -> SelectionVector4 {
    let mut bounds = Vec::with_capacity(runs.len() + 1);
    bounds.push(0usize);
    {
        let out = src.as_mut_slice();
        let mut k = 0;
        for (batch, run) in runs.iter().enumerate() {
            for pos in 0..run.len() {
                out[k] = SelectionVector4::pack(batch, run.row_at(pos));
                k += 1;
            }
            bounds.push(k);
        }
    }

    while bounds.len() > 2 {
        let segments = bounds.len() - 1;
        let mut next = Vec::with_capacity(segments / 2 + 2);
        next.push(0usize);
        let mut seg = 0;
        while seg < segments {
            let lo = bounds[seg];
            let mid = bounds[seg + 1];
            let hi = if seg + 2 <= segments {
                bounds[seg + 2]
            } else {
                mid
            };
            merge_pair(
                &src.as_slice()[lo..mid],
                &src.as_slice()[mid..hi],
                &mut dst.as_mut_slice()[lo..hi],
                runs,
            );
            next.push(hi);
            seg += 2;
        }
        bounds = next;
        std::mem::swap(&mut src, &mut dst);
    }
    src
}

fn merge_pair(left: &[u32], right: &[u32], out: &mut [u32], runs: &[SortedRun]) {
    let (mut i, mut j, mut k) = (0, 0, 0);
    while i < left.len() && j < right.len() {
        if key_of(runs, right[j]) < key_of(runs, left[i]) {
            out[k] = right[j];
            j += 1;
        } else {
            out[k] = left[i];
            i += 1;
        }
        k += 1;
    }
    let rest_left = left.len() - i;
    out[k..k + rest_left].copy_from_slice(&left[i..]);
    k += rest_left;
    out[k..].copy_from_slice(&right[j..]);
}

fn key_of(runs: &[SortedRun], entry: u32) -> Row<'_> {
    runs[SelectionVector4::batch_of(entry)].key_of_row(SelectionVector4::row_of(entry))
}
