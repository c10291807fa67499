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
//! External sort: sorted batch groups, spill-to-disk merges and the pull-driven driver.
//!
//! Responsibilities:
//! - Host the comparator, single-batch sorter, spill policy and merge kernels.
//! - Keep sorting algorithms isolated from operator state transitions.

pub mod batch_group;
pub mod comparator;
pub mod final_merge;
pub mod memory_monitor;
pub mod merger;
mod operator;
pub(crate) mod single_batch_sorter;
pub mod spill_merger;

pub use comparator::{
    ColumnComparatorGenerator, ComparatorGenerator, RowComparator, SortExpression, SortKeyExpr,
};
pub use final_merge::{IndirectBatch, MAX_SORT_BYTES};
pub use memory_monitor::SpillReason;
pub use operator::{
    CancelHandle, ExternalSortFactory, ExternalSortOperator, ExternalSortOptions, SortPoll,
    SortedOutput,
};
