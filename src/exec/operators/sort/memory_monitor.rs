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
//! Memory-pressure monitor and spill policy.
//!
//! Tracks the bytes held by resident batch groups and decides, after each
//! staged group, whether half of them should be merged to disk.

use std::fmt;

/// Why a spill was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillReason {
    /// Resident memory climbed back to 75% of the last out-of-memory level.
    HighWaterMark,
    /// The in-memory final sort would not fit in the remaining allocation.
    InMemorySortUnaffordable,
    /// Resident memory above 95% of the operator allocation.
    AllocationLimit,
    /// Resident memory above 95% of the enclosing fragment limit.
    FragmentLimit,
    /// Too many resident groups staged since the last spill.
    GroupCount,
    /// Upstream or an allocation reported out-of-memory.
    OutOfMemory,
}

impl fmt::Display for SpillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpillReason::HighWaterMark => "high_water_mark",
            SpillReason::InMemorySortUnaffordable => "in_memory_sort_unaffordable",
            SpillReason::AllocationLimit => "allocation_limit",
            SpillReason::FragmentLimit => "fragment_limit",
            SpillReason::GroupCount => "group_count",
            SpillReason::OutOfMemory => "out_of_memory",
        };
        f.write_str(s)
    }
}

/// Allocator state sampled when the policy is evaluated.
#[derive(Clone, Copy, Debug)]
pub struct MemorySnapshot {
    /// Bytes currently charged to the operator's allocator.
    pub allocator_current: i64,
    /// Limit of the enclosing fragment, if any.
    pub fragment_limit: Option<i64>,
    /// Number of resident batch groups.
    pub resident_groups: usize,
}

#[derive(Debug)]
pub struct MemoryMonitor {
    max_allocation: i64,
    high_water_mark: i64,
    resident_bytes: i64,
    spill_threshold: usize,
    spill_group_size: usize,
    batches_since_spill: usize,
    spill_count: u64,
    total_rows: u64,
}

impl MemoryMonitor {
    pub fn new(max_allocation: i64, spill_threshold: usize, spill_group_size: usize) -> Self {
        Self {
            max_allocation,
            high_water_mark: i64::MAX,
            resident_bytes: 0,
            spill_threshold,
            spill_group_size,
            batches_since_spill: 0,
            spill_count: 0,
            total_rows: 0,
        }
    }

    pub fn resident_bytes(&self) -> i64 {
        self.resident_bytes
    }

    pub fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }

    pub fn spill_count(&self) -> u64 {
        self.spill_count
    }

    pub fn batches_since_spill(&self) -> usize {
        self.batches_since_spill
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Record a newly staged resident group.
    pub fn on_staged(&mut self, rows: u64, bytes: usize) {
        self.resident_bytes = self.resident_bytes.saturating_add(to_i64(bytes));
        self.total_rows = self.total_rows.saturating_add(rows);
        self.batches_since_spill += 1;
    }

    /// Record a completed spill: `released` bytes of merged groups are gone,
    /// `retained` bytes of the first merged chunk stay resident.
    pub fn on_spilled(&mut self, released: usize, retained: usize) {
        self.resident_bytes = self
            .resident_bytes
            .saturating_sub(to_i64(released))
            .saturating_add(to_i64(retained))
            .max(0);
        self.spill_count += 1;
        self.batches_since_spill = 0;
    }

    /// A spill was attempted but nothing was eligible.
    pub fn on_spill_skipped(&mut self) {
        self.batches_since_spill = 0;
    }

    /// Record an out-of-memory signal. Returns whether to spill immediately.
    pub fn on_out_of_memory(&mut self) -> bool {
        self.high_water_mark = self.resident_bytes;
        let spill_now = self.batches_since_spill > 2;
        self.batches_since_spill = 0;
        spill_now
    }

    /// Evaluate the spill rules in order; the first that holds wins.
    pub fn should_spill(&self, snapshot: MemorySnapshot) -> Option<SpillReason> {
        let resident = i128::from(self.resident_bytes);
        if self.spill_count > 0 && resident * 4 > i128::from(self.high_water_mark) * 3 {
            return Some(SpillReason::HighWaterMark);
        }
        if self.spill_count == 0 {
            let available = self.max_allocation.saturating_sub(snapshot.allocator_current);
            if available <= in_memory_sort_cost(self.total_rows) {
                return Some(SpillReason::InMemorySortUnaffordable);
            }
        }
        if above_95_percent(resident, self.max_allocation) {
            return Some(SpillReason::AllocationLimit);
        }
        if let Some(limit) = snapshot.fragment_limit
            && above_95_percent(resident, limit)
        {
            return Some(SpillReason::FragmentLimit);
        }
        if snapshot.resident_groups > self.spill_threshold
            && self.batches_since_spill >= self.spill_group_size
        {
            return Some(SpillReason::GroupCount);
        }
        None
    }
}

/// Bytes an in-memory final sort of `rows` rows needs: the global SV4 plus
/// the merge's auxiliary SV4.
pub fn in_memory_sort_cost(rows: u64) -> i64 {
    let sv4 = rows
        .saturating_mul(4)
        .checked_next_power_of_two()
        .unwrap_or(u64::MAX);
    i64::try_from(sv4.saturating_mul(2)).unwrap_or(i64::MAX)
}

fn above_95_percent(value: i128, limit: i64) -> bool {
    value * 100 > i128::from(limit) * 95
}

fn to_i64(bytes: usize) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
