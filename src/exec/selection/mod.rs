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
//! Selection vectors: row indirection without moving column data.
//!
//! - `SelectionVector2` holds 16-bit row offsets into exactly one batch, so a
//!   batch addressed this way has at most `MAX_SV2_ROWS` rows.
//! - `SelectionVector4` holds `(batch ordinal, row offset)` pairs packed into
//!   a `u32` and addresses a `HyperBatch`.
//!
//! Both may carry a reservation against a memory tracker for their own storage.

use std::sync::Arc;

use crate::runtime::mem_tracker::{MemLimitExceeded, MemTracker, TrackedBytes};

pub mod hyper_batch;

pub use hyper_batch::HyperBatch;

/// Largest batch an SV2 can address.
pub const MAX_SV2_ROWS: usize = 1 << 16;
/// Largest number of batches an SV4 can address.
pub const MAX_SV4_BATCHES: usize = 1 << 16;

#[derive(Debug)]
pub struct SelectionVector2 {
    offsets: Vec<u16>,
    _reservation: Option<TrackedBytes>,
}

impl SelectionVector2 {
    /// Identity permutation `0..len`, untracked.
    pub fn identity(len: usize) -> Self {
        debug_assert!(len <= MAX_SV2_ROWS);
        Self {
            offsets: identity_offsets(len),
            _reservation: None,
        }
    }

    /// Identity permutation whose storage is reserved against `tracker`.
    pub fn allocate(len: usize, tracker: &Arc<MemTracker>) -> Result<Self, MemLimitExceeded> {
        debug_assert!(len <= MAX_SV2_ROWS);
        let reservation = TrackedBytes::try_new(Self::bytes_for(len), Arc::clone(tracker))?;
        Ok(Self {
            offsets: identity_offsets(len),
            _reservation: Some(reservation),
        })
    }

    pub fn bytes_for(len: usize) -> usize {
        len.saturating_mul(std::mem::size_of::<u16>())
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Physical row of logical position `i`.
    pub fn get(&self, i: usize) -> usize {
        self.offsets[i] as usize
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.offsets
    }

    pub fn as_mut_slice(&mut self) -> &mut [u16] {
        &mut self.offsets
    }

    pub fn memory_bytes(&self) -> usize {
        Self::bytes_for(self.offsets.len())
    }
}

fn identity_offsets(len: usize) -> Vec<u16> {
    (0..len).map(|i| i as u16).collect()
}

#[derive(Debug)]
pub struct SelectionVector4 {
    entries: Vec<u32>,
    _reservation: Option<TrackedBytes>,
}

impl SelectionVector4 {
    pub fn pack(batch: usize, row: usize) -> u32 {
        debug_assert!(batch < MAX_SV4_BATCHES && row < MAX_SV2_ROWS);
        ((batch as u32) << 16) | (row as u32 & 0xFFFF)
    }

    pub fn batch_of(entry: u32) -> usize {
        (entry >> 16) as usize
    }

    pub fn row_of(entry: u32) -> usize {
        (entry & 0xFFFF) as usize
    }

    pub fn new(entries: Vec<u32>) -> Self {
        Self {
            entries,
            _reservation: None,
        }
    }

    /// Zero-filled SV4 of `len` entries reserved against `tracker`.
    pub fn allocate(len: usize, tracker: &Arc<MemTracker>) -> Result<Self, MemLimitExceeded> {
        let reservation = TrackedBytes::try_new(Self::bytes_for(len), Arc::clone(tracker))?;
        Ok(Self {
            entries: vec![0; len],
            _reservation: Some(reservation),
        })
    }

    pub fn bytes_for(len: usize) -> usize {
        len.saturating_mul(std::mem::size_of::<u32>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> (usize, usize) {
        let e = self.entries[i];
        (Self::batch_of(e), Self::row_of(e))
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.entries
    }

    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.entries
    }

    /// Entries `[start, start + len)` clamped to the vector's end.
    pub fn window(&self, start: usize, len: usize) -> &[u32] {
        let start = start.min(self.entries.len());
        let end = start.saturating_add(len).min(self.entries.len());
        &self.entries[start..end]
    }
}
