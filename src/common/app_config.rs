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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<XsortConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static XsortConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = XsortConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config was not installed"))
}

pub fn init_from_env_or_default() -> Result<&'static XsortConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static XsortConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("XSORT_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("xsort.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $XSORT_CONFIG or create ./xsort.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct XsortConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "xsort=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Log file path; overrides `$XSORT_LOG_FILE` and `$XSORT_LOG_DIR`.
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub sort: SortConfig,
}

impl XsortConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: XsortConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn log_filter_or_level(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for XsortConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            log_file: None,
            sort: SortConfig::default(),
        }
    }
}

/// `[sort]` table: knobs of the external sort operator.
#[derive(Clone, Debug, Deserialize)]
pub struct SortConfig {
    /// Minimum batches staged between two threshold-triggered spills.
    #[serde(default = "default_spill_batch_group_size")]
    pub spill_batch_group_size: usize,
    /// Resident batch-group count above which a spill is considered.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,
    /// File-system URI for spill files. Only `file://` is supported.
    #[serde(default = "default_spill_fs")]
    pub spill_fs: String,
    /// Spill directories, used round-robin. Empty means the system temp dir.
    #[serde(default)]
    pub spill_dirs: Vec<String>,
    /// Operator memory budget (`maxAllocation`).
    #[serde(default = "default_max_allocation_bytes")]
    pub max_allocation_bytes: i64,
    #[serde(default = "default_target_spill_chunk_bytes")]
    pub target_spill_chunk_bytes: usize,
    #[serde(default = "default_output_batch_rows")]
    pub output_batch_rows: usize,
    #[serde(default = "default_spill_compression")]
    pub spill_compression: String,
    #[serde(default = "default_sv2_alloc_retry_unit_ms")]
    pub sv2_alloc_retry_unit_ms: u64,
}

fn default_spill_batch_group_size() -> usize {
    40_000
}

fn default_spill_threshold() -> usize {
    40_000
}

fn default_spill_fs() -> String {
    "file:///".to_string()
}

fn default_max_allocation_bytes() -> i64 {
    10_000_000_000
}

fn default_target_spill_chunk_bytes() -> usize {
    256 * 1024
}

fn default_output_batch_rows() -> usize {
    4096
}

fn default_spill_compression() -> String {
    "lz4".to_string()
}

fn default_sv2_alloc_retry_unit_ms() -> u64 {
    1000
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            spill_batch_group_size: default_spill_batch_group_size(),
            spill_threshold: default_spill_threshold(),
            spill_fs: default_spill_fs(),
            spill_dirs: Vec::new(),
            max_allocation_bytes: default_max_allocation_bytes(),
            target_spill_chunk_bytes: default_target_spill_chunk_bytes(),
            output_batch_rows: default_output_batch_rows(),
            spill_compression: default_spill_compression(),
            sv2_alloc_retry_unit_ms: default_sv2_alloc_retry_unit_ms(),
        }
    }
}
