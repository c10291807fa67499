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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use arrow::array::{Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use tempfile::TempDir;

use xsort::common::types::UniqueId;
use xsort::exec::chunk::Chunk;
use xsort::{
    ExternalSortFactory, ExternalSortOperator, ExternalSortOptions, InputEvent, OperatorFactory,
    RuntimeState, SortError, SortInput, SortPoll, xsort_config, xsort_logging,
};

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
    /// Spill directory handed to operators under test
    pub spill_dir: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_xsort.toml");
        let spill_dir = temp_dir.path().join("spill");
        std::fs::create_dir_all(&spill_dir)?;

        let config_content = r#"
log_level = "debug"

[sort]
spill_batch_group_size = 40000
spill_threshold = 40000
spill_fs = "file:///"
output_batch_rows = 4096
spill_compression = "lz4"
sv2_alloc_retry_unit_ms = 1
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
            spill_dir,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        xsort_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static xsort_config::XsortConfig> {
        xsort_config::init_from_path(&self.config_path)
    }

    /// Options spilling into this config's temp directory.
    pub fn options(&self, order_by: Vec<xsort::SortExpression>) -> ExternalSortOptions {
        ExternalSortOptions::new(order_by)
            .with_spill_dirs(vec![self.spill_dir.clone()])
            .with_sv2_alloc_retry_unit(Duration::from_millis(1))
    }

    /// Number of files currently in the spill directory.
    pub fn spill_files(&self) -> usize {
        count_files(&self.spill_dir)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0)
}

/// Generate a test query ID.
pub fn test_query_id() -> UniqueId {
    UniqueId {
        hi: 1234567890,
        lo: 9876543210,
    }
}

/// Generate a unique fragment ID based on test name.
pub fn unique_fragment_id(test_name: &str) -> UniqueId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId {
        hi: hash as i64,
        lo: (hash >> 32) as i64,
    }
}

pub fn runtime_state(test_name: &str) -> RuntimeState {
    RuntimeState::new(test_query_id(), unique_fragment_id(test_name), -1)
}

/// Runtime state whose fragment tracker is limited to `limit` bytes.
pub fn limited_runtime_state(test_name: &str, limit: i64) -> RuntimeState {
    RuntimeState::new(test_query_id(), unique_fragment_id(test_name), limit)
}

/// Upstream that replays a fixed list of events and then reports end of data.
pub struct VecInput {
    events: VecDeque<InputEvent>,
    killed: Arc<AtomicBool>,
}

impl VecInput {
    pub fn new(events: Vec<InputEvent>) -> Self {
        Self {
            events: events.into(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn batches(batches: Vec<RecordBatch>) -> Self {
        Self::new(
            batches
                .into_iter()
                .map(|b| InputEvent::Batch(Chunk::new(b)))
                .collect(),
        )
    }

    /// Flag set once the operator stops this input.
    pub fn killed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }
}

impl SortInput for VecInput {
    fn next(&mut self) -> xsort::common::error::Result<InputEvent> {
        Ok(self.events.pop_front().unwrap_or(InputEvent::End))
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::Release);
    }
}

/// Upstream fed by another thread; a closed channel is end of data.
pub struct ChannelInput {
    rx: Receiver<RecordBatch>,
    killed: Arc<AtomicBool>,
}

impl ChannelInput {
    pub fn new(rx: Receiver<RecordBatch>) -> Self {
        Self {
            rx,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn killed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }
}

impl SortInput for ChannelInput {
    fn next(&mut self) -> xsort::common::error::Result<InputEvent> {
        Ok(match self.rx.recv() {
            Ok(batch) => InputEvent::Batch(Chunk::new(batch)),
            Err(_) => InputEvent::End,
        })
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::Release);
    }
}

/// `(id INT, name VARCHAR)` schema used by most tests.
pub fn id_name_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, true),
        Field::new("name", DataType::Utf8, true),
    ]))
}

pub fn id_name_batch(ids: Vec<Option<i32>>, names: Vec<Option<&str>>) -> RecordBatch {
    RecordBatch::try_new(
        id_name_schema(),
        vec![
            Arc::new(Int32Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .expect("record batch")
}

/// Single `v BIGINT` column with the given values.
pub fn int64_batch(values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("record batch")
}

/// Deterministic pseudo-random values (xorshift) split into batches.
pub fn scrambled_int64_batches(total: usize, per_batch: usize, seed: u64) -> Vec<RecordBatch> {
    let mut state = seed.max(1);
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        values.push((state % 100_000) as i64);
    }
    values
        .chunks(per_batch.max(1))
        .map(|c| int64_batch(c.to_vec()))
        .collect()
}

pub fn create_operator(
    state: &RuntimeState,
    options: ExternalSortOptions,
    input: impl SortInput + 'static,
) -> ExternalSortOperator {
    ExternalSortFactory::new(1, options)
        .create(Box::new(input), state)
        .expect("create external sort")
}

/// Outcome of draining an operator.
#[derive(Debug)]
pub struct Drained {
    pub batches: Vec<RecordBatch>,
    pub saw_new_schema_first: bool,
    pub terminal: Terminal,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Stopped,
}

impl Drained {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn int32_column(&self, idx: usize) -> Vec<Option<i32>> {
        self.batches
            .iter()
            .flat_map(|b| {
                let col = b
                    .column(idx)
                    .as_any()
                    .downcast_ref::<Int32Array>()
                    .expect("int32 column");
                (0..col.len())
                    .map(|i| col.is_valid(i).then(|| col.value(i)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn utf8_column(&self, idx: usize) -> Vec<Option<String>> {
        self.batches
            .iter()
            .flat_map(|b| {
                let col = b
                    .column(idx)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .expect("utf8 column");
                (0..col.len())
                    .map(|i| col.is_valid(i).then(|| col.value(i).to_string()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn int64_column(&self, idx: usize) -> Vec<i64> {
        self.batches
            .iter()
            .flat_map(|b| {
                b.column(idx)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int64 column")
                    .values()
                    .to_vec()
            })
            .collect()
    }
}

/// Pull until `Done` or `Stopped`, materializing every output.
pub fn drain(op: &mut ExternalSortOperator) -> Result<Drained, SortError> {
    let mut batches = Vec::new();
    let mut saw_new_schema_first = false;
    let mut first = true;
    loop {
        match op.next()? {
            SortPoll::NewSchema(out) => {
                saw_new_schema_first = first;
                first = false;
                batches.push(out.into_record_batch()?);
            }
            SortPoll::Batch(out) => {
                first = false;
                batches.push(out.into_record_batch()?);
            }
            SortPoll::Done => {
                return Ok(Drained {
                    batches,
                    saw_new_schema_first,
                    terminal: Terminal::Done,
                });
            }
            SortPoll::Stopped => {
                return Ok(Drained {
                    batches,
                    saw_new_schema_first,
                    terminal: Terminal::Stopped,
                });
            }
        }
    }
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
