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
use crate::xsort_config::config as xsort_app_config;

pub(crate) fn sort_spill_batch_group_size() -> usize {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.spill_batch_group_size)
        .unwrap_or(40_000)
}

pub(crate) fn sort_spill_threshold() -> usize {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.spill_threshold)
        .unwrap_or(40_000)
}

pub(crate) fn sort_spill_fs() -> String {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.spill_fs.clone())
        .unwrap_or_else(|| "file:///".to_string())
}

pub(crate) fn sort_spill_dirs() -> Vec<String> {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.spill_dirs.clone())
        .unwrap_or_default()
}

pub(crate) fn sort_max_allocation_bytes() -> i64 {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.max_allocation_bytes)
        .unwrap_or(10_000_000_000)
}

pub(crate) fn sort_target_spill_chunk_bytes() -> usize {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.target_spill_chunk_bytes)
        .unwrap_or(256 * 1024)
}

pub(crate) fn sort_output_batch_rows() -> usize {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.output_batch_rows)
        .unwrap_or(4096)
}

pub(crate) fn sort_spill_compression() -> String {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.spill_compression.clone())
        .unwrap_or_else(|| "lz4".to_string())
}

pub(crate) fn sort_sv2_alloc_retry_unit_ms() -> u64 {
    xsort_app_config()
        .ok()
        .map(|c| c.sort.sv2_alloc_retry_unit_ms)
        .unwrap_or(1000)
}
