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
//! Spill merger: merges half of the resident batch groups into one spill file.
//!
//! The first merged chunk stays in memory as the head of the new group, every
//! later chunk is appended to the spill file of this spill event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::error::{Result, SortError};
use crate::common::logging::debug;
use crate::exec::operators::sort::batch_group::{BatchGroup, SortedRun};
use crate::exec::operators::sort::comparator::RowComparator;
use crate::exec::operators::sort::merger::KWayMerger;
use crate::exec::spill::{SpillProfile, Spiller};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::ScopedTimer;

/// Rows per merged chunk: about `target_bytes` of data, at least one row,
/// at most `max_rows`.
pub fn merge_chunk_rows(row_width: usize, target_bytes: usize, max_rows: usize) -> usize {
    (target_bytes / row_width.max(1)).max(1).min(max_rows.max(1))
}

/// Take up to half of `groups` from the oldest end, stopping at the first
/// group that is already spilled.
pub fn select_spill_candidates(groups: &mut VecDeque<BatchGroup>) -> Vec<BatchGroup> {
    let count = groups.len() / 2;
    let mut selected = Vec::with_capacity(count);
    while selected.len() < count {
        if groups.front().is_none_or(BatchGroup::is_spilled) {
            break;
        }
        if let Some(group) = groups.pop_front() {
            selected.push(group);
        }
    }
    selected
}

pub(crate) struct SpillContext<'a> {
    pub comparator: &'a Arc<RowComparator>,
    pub tracker: &'a Arc<MemTracker>,
    pub spiller: &'a mut Spiller,
    pub profile: Option<&'a SpillProfile>,
    pub chunk_rows: usize,
    pub cancelled: &'a AtomicBool,
}

/// Result of one spill event.
#[derive(Debug)]
pub struct SpillOutcome {
    pub group: BatchGroup,
    pub merged_groups: usize,
    /// Resident bytes of the merged groups, now released.
    pub released_bytes: usize,
    /// Resident bytes of the retained first chunk.
    pub retained_bytes: usize,
    pub spilled_rows: u64,
    pub spilled_bytes: u64,
}

/// Merge `selected` into a new spilled batch group. Returns `None` when
/// nothing was selected.
pub(crate) fn merge_and_spill(
    selected: Vec<BatchGroup>,
    ctx: SpillContext<'_>,
) -> Result<Option<SpillOutcome>> {
    if selected.is_empty() {
        return Ok(None);
    }
    let _timer = ctx
        .profile
        .map(|p| ScopedTimer::new(Arc::clone(&p.spill_time)));
    let merged_groups = selected.len();
    let released_bytes = selected
        .iter()
        .map(BatchGroup::resident_bytes)
        .fold(0usize, usize::saturating_add);
    let schema = ctx.comparator.schema().clone();

    let mut merger = KWayMerger::try_new(
        Arc::clone(ctx.comparator),
        Arc::clone(ctx.tracker),
        ctx.profile.cloned(),
        selected,
    )?;
    let Some(first) = merger.next_chunk(ctx.chunk_rows)? else {
        return Ok(None);
    };
    let mut writer = ctx.spiller.create_writer(&schema)?;
    while let Some(chunk) = merger.next_chunk(ctx.chunk_rows)? {
        if ctx.cancelled.load(Ordering::Acquire) {
            return Err(SortError::Cancelled);
        }
        writer.append(&chunk.batch)?;
    }
    let file = writer.finish()?;
    drop(merger);

    let keys = ctx.comparator.encode_keys(&first.batch)?;
    let head = SortedRun::in_order(first, keys, ctx.tracker);
    let retained_bytes = head.memory_bytes();
    let spilled_rows = file.num_rows();
    let spilled_bytes = file.num_bytes();
    if let Some(profile) = ctx.profile {
        profile.spill_count.add(1);
        profile.spill_rows.add(i64::try_from(spilled_rows).unwrap_or(i64::MAX));
        profile
            .spill_bytes
            .add(i64::try_from(spilled_bytes).unwrap_or(i64::MAX));
    }
    debug!(
        "sort spill finished: path={} merged_groups={} spilled_rows={} retained_rows={} released_bytes={}",
        file.path().display(),
        merged_groups,
        spilled_rows,
        head.len(),
        released_bytes
    );
    Ok(Some(SpillOutcome {
        group: BatchGroup::spilled(Some(head), file),
        merged_groups,
        released_bytes,
        retained_bytes,
        spilled_rows,
        spilled_bytes,
    }))
}
