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
//! Single-batch sorter: orders one batch by permuting its SV2.

use arrow::array::RecordBatch;
use arrow::row::Rows;

use crate::common::error::{Result, SortError};
use crate::exec::operators::sort::comparator::RowComparator;
use crate::exec::selection::SelectionVector2;

/// Permute `sv2` so that `batch` read through it is non-decreasing.
///
/// The column buffers of `batch` are never touched. Returns the encoded sort
/// keys, indexed by physical row, for later merges.
pub(crate) fn sort_batch(
    comparator: &RowComparator,
    batch: &RecordBatch,
    sv2: &mut SelectionVector2,
) -> Result<Rows> {
    if sv2.len() != batch.num_rows() {
        return Err(SortError::Unsupported(format!(
            "selection vector covers {} rows but the batch has {}",
            sv2.len(),
            batch.num_rows()
        )));
    }
    let keys = comparator.encode_keys(batch)?;
    sv2.as_mut_slice()
        .sort_unstable_by(|&a, &b| keys.row(a as usize).cmp(&keys.row(b as usize)));
    Ok(keys)
}
