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
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::error::{Result, SortError};

/// Round-robin chooser over the configured spill directories.
#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
}

impl DirManager {
    /// Creates every directory up front; an unusable directory is a config error.
    pub fn new(dirs: Vec<PathBuf>) -> Result<Self> {
        if dirs.is_empty() {
            return Err(SortError::Config("sort.spill_dirs is empty".to_string()));
        }
        for dir in &dirs {
            ensure_dir(dir)?;
        }
        Ok(Self {
            dirs,
            next_dir: AtomicUsize::new(0),
        })
    }

    pub fn next_dir(&self) -> &Path {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        &self.dirs[idx % self.dirs.len()]
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SortError::Config(
            "sort.spill_dirs contains an empty path".to_string(),
        ));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        SortError::Config(format!(
            "create spill directory {} failed: {e}",
            path.display()
        ))
    })
}
