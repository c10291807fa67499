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
//! Local spill storage: directory rotation, the spill file layout, the IPC
//! codec, append-only writers and sequential readers.

pub mod block_format;
pub mod dir_manager;
pub mod ipc_serde;
pub mod spill_stream;
pub mod spiller;

use crate::common::error::{Result, SortError};
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile};

pub use ipc_serde::SpillCodec;
pub use spill_stream::SpillStream;
pub use spiller::{SpillFile, SpillWriter, Spiller};

const LOCAL_FS_SCHEME: &str = "file://";

/// Validate the spill file-system URI. Only the local file system is supported.
pub fn validate_spill_fs(uri: &str) -> Result<()> {
    let uri = uri.trim();
    if uri
        .get(..LOCAL_FS_SCHEME.len())
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case(LOCAL_FS_SCHEME))
    {
        return Ok(());
    }
    Err(SortError::Config(format!(
        "sort.spill_fs must be a {LOCAL_FS_SCHEME} URI, got '{uri}'"
    )))
}

#[derive(Clone, Debug)]
pub struct SpillProfile {
    pub spill_count: CounterRef,
    pub spill_rows: CounterRef,
    pub spill_bytes: CounterRef,
    pub spill_time: CounterRef,
    pub restore_rows: CounterRef,
    pub restore_time: CounterRef,
}

impl SpillProfile {
    pub fn new(profile: &RuntimeProfile) -> Self {
        let profile = profile.child("Spill");
        Self {
            spill_count: profile.add_counter("SpillCount", CounterUnit::Unit),
            spill_rows: profile.add_counter("SpillRows", CounterUnit::Unit),
            spill_bytes: profile.add_counter("SpillBytes", CounterUnit::Bytes),
            spill_time: profile.add_timer("SpillTime"),
            restore_rows: profile.add_counter("RestoreRows", CounterUnit::Unit),
            restore_time: profile.add_timer("RestoreTime"),
        }
    }
}
