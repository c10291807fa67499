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
use std::sync::{Arc, Mutex};

use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::{self, MemTracker};
use crate::runtime::profile::RuntimeProfile;

/// Per-fragment-instance execution context.
///
/// Owns the fragment's memory tracker (child of a per-query tracker under the
/// process tracker), its profile and the failure handler operators report to.
#[derive(Clone, Debug)]
pub struct RuntimeState {
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    mem_tracker: Arc<MemTracker>,
    error_state: Arc<RuntimeErrorState>,
    profile: RuntimeProfile,
}

/// First-failure-wins slot for the fragment.
#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl RuntimeState {
    /// `fragment_mem_limit < 0` means unlimited.
    pub fn new(query_id: UniqueId, fragment_instance_id: UniqueId, fragment_mem_limit: i64) -> Self {
        let process = mem_tracker::process_mem_tracker();
        let query_tracker = MemTracker::new_child(format!("query_{}", query_id.to_label()), &process);
        let fragment_tracker = MemTracker::new_child_with_limit(
            format!("fragment_{}", fragment_instance_id.to_label()),
            fragment_mem_limit,
            &query_tracker,
        );
        Self::with_mem_tracker(query_id, fragment_instance_id, fragment_tracker)
    }

    pub fn with_mem_tracker(
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        let profile = RuntimeProfile::new(format!("Fragment {fragment_instance_id}"));
        Self {
            query_id,
            fragment_instance_id,
            mem_tracker,
            error_state: Arc::new(RuntimeErrorState::default()),
            profile,
        }
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn error_state(&self) -> &Arc<RuntimeErrorState> {
        &self.error_state
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }
}
