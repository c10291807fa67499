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
//! External sort operator for ORDER BY execution under a memory budget.
//!
//! Responsibilities:
//! - Pulls upstream batches, sorts each through an SV2 and stages it as a batch group.
//! - Applies the spill policy after every staged group, merging half of the
//!   resident groups to disk when memory runs short.
//! - Serves output from an in-memory SV4 merge, or streams a k-way merge over
//!   spilled and resident groups.
//!
//! Key exported interfaces:
//! - Types: `ExternalSortFactory`, `ExternalSortOperator`, `ExternalSortOptions`,
//!   `SortPoll`, `SortedOutput`, `CancelHandle`.
//!
//! Current limitations:
//! - The output schema is fixed by the first upstream batch; later schema changes are fatal.
//! - Upstream `NotYet` is a protocol violation because the operator cannot yield mid-ingest.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;

use crate::common::config;
use crate::common::error::{Result, SortError};
use crate::exec::chunk::Chunk;
use crate::exec::operators::sort::batch_group::{BatchGroup, SortedRun};
use crate::exec::operators::sort::comparator::{
    ColumnComparatorGenerator, ComparatorGenerator, RowComparator, SortExpression,
};
use crate::exec::operators::sort::final_merge::{
    InMemoryBuild, InMemoryMerge, IndirectBatch, MAX_SORT_BYTES, build_in_memory,
};
use crate::exec::operators::sort::memory_monitor::{MemoryMonitor, MemorySnapshot, SpillReason};
use crate::exec::operators::sort::merger::KWayMerger;
use crate::exec::operators::sort::single_batch_sorter::sort_batch;
use crate::exec::operators::sort::spill_merger::{
    SpillContext, merge_and_spill, merge_chunk_rows, select_spill_candidates,
};
use crate::exec::pipeline::operator::{InputEvent, Operator, SortInput};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::selection::{MAX_SV2_ROWS, SelectionVector2};
use crate::exec::spill::{SpillCodec, SpillProfile, Spiller, validate_spill_fs};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{
    CounterRef, CounterUnit, RuntimeProfile, ScopedTimer, attach_mem_tracker_tree,
};
use crate::runtime::runtime_state::{RuntimeErrorState, RuntimeState};
use crate::xsort_logging::{debug, error, info, warn};

/// SV2 allocation retries double the wait from one unit and give up here.
const SV2_MAX_WAIT_UNITS: u32 = 32;

/// Plan-time options of one external sort.
#[derive(Clone, Debug)]
pub struct ExternalSortOptions {
    pub order_by: Vec<SortExpression>,
    pub spill_batch_group_size: usize,
    pub spill_threshold: usize,
    pub spill_dirs: Vec<PathBuf>,
    pub spill_codec: SpillCodec,
    pub max_allocation_bytes: i64,
    pub target_spill_chunk_bytes: usize,
    pub output_batch_rows: usize,
    pub sv2_alloc_retry_unit: Duration,
    pub max_in_memory_sort_bytes: usize,
}

impl ExternalSortOptions {
    /// Options with built-in defaults, spilling under the system temp directory.
    pub fn new(order_by: Vec<SortExpression>) -> Self {
        Self {
            order_by,
            spill_batch_group_size: 40_000,
            spill_threshold: 40_000,
            spill_dirs: vec![default_spill_dir()],
            spill_codec: SpillCodec::Lz4,
            max_allocation_bytes: 10_000_000_000,
            target_spill_chunk_bytes: 256 * 1024,
            output_batch_rows: 4096,
            sv2_alloc_retry_unit: Duration::from_secs(1),
            max_in_memory_sort_bytes: MAX_SORT_BYTES,
        }
    }

    /// Options from the `[sort]` table of the process configuration.
    pub fn from_app_config(order_by: Vec<SortExpression>) -> Result<Self> {
        validate_spill_fs(&config::sort_spill_fs())?;
        let spill_codec = config::sort_spill_compression().parse::<SpillCodec>()?;
        let mut spill_dirs = config::sort_spill_dirs()
            .into_iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        if spill_dirs.is_empty() {
            spill_dirs.push(default_spill_dir());
        }
        let options = Self {
            order_by,
            spill_batch_group_size: config::sort_spill_batch_group_size(),
            spill_threshold: config::sort_spill_threshold(),
            spill_dirs,
            spill_codec,
            max_allocation_bytes: config::sort_max_allocation_bytes(),
            target_spill_chunk_bytes: config::sort_target_spill_chunk_bytes(),
            output_batch_rows: config::sort_output_batch_rows(),
            sv2_alloc_retry_unit: Duration::from_millis(config::sort_sv2_alloc_retry_unit_ms()),
            max_in_memory_sort_bytes: MAX_SORT_BYTES,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_spill_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.spill_dirs = dirs;
        self
    }

    pub fn with_spill_codec(mut self, codec: SpillCodec) -> Self {
        self.spill_codec = codec;
        self
    }

    /// Group-count spill rule: more than `threshold` resident groups and at
    /// least `group_size` staged since the last spill.
    pub fn with_spill_threshold(mut self, threshold: usize, group_size: usize) -> Self {
        self.spill_threshold = threshold;
        self.spill_batch_group_size = group_size;
        self
    }

    pub fn with_max_allocation_bytes(mut self, bytes: i64) -> Self {
        self.max_allocation_bytes = bytes;
        self
    }

    pub fn with_output_batch_rows(mut self, rows: usize) -> Self {
        self.output_batch_rows = rows;
        self
    }

    pub fn with_target_spill_chunk_bytes(mut self, bytes: usize) -> Self {
        self.target_spill_chunk_bytes = bytes;
        self
    }

    pub fn with_sv2_alloc_retry_unit(mut self, unit: Duration) -> Self {
        self.sv2_alloc_retry_unit = unit;
        self
    }

    pub fn with_max_in_memory_sort_bytes(mut self, bytes: usize) -> Self {
        self.max_in_memory_sort_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.order_by.is_empty() {
            return Err(SortError::Config(
                "external sort requires at least one order-by key".to_string(),
            ));
        }
        if self.spill_dirs.is_empty() {
            return Err(SortError::Config("sort.spill_dirs is empty".to_string()));
        }
        if self.max_allocation_bytes <= 0 {
            return Err(SortError::Config(format!(
                "sort.max_allocation_bytes must be positive, got {}",
                self.max_allocation_bytes
            )));
        }
        if self.output_batch_rows == 0 {
            return Err(SortError::Config(
                "sort.output_batch_rows must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_spill_dir() -> PathBuf {
    std::env::temp_dir().join("xsort-spill")
}

/// Cancels an operator from any thread. Cancellation is observed on the
/// next pull and between spill chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// Sorted rows handed to the consumer.
#[derive(Clone, Debug)]
pub enum SortedOutput {
    /// A contiguous batch produced by a streamed merge.
    Batch(RecordBatch),
    /// A window of the in-memory SV4 over the shared hyper-batch.
    Indirect(IndirectBatch),
}

impl SortedOutput {
    pub fn num_rows(&self) -> usize {
        match self {
            SortedOutput::Batch(batch) => batch.num_rows(),
            SortedOutput::Indirect(indirect) => indirect.num_rows(),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        match self {
            SortedOutput::Batch(batch) => batch.schema(),
            SortedOutput::Indirect(indirect) => indirect.schema().clone(),
        }
    }

    pub fn into_record_batch(self) -> Result<RecordBatch> {
        match self {
            SortedOutput::Batch(batch) => Ok(batch),
            SortedOutput::Indirect(indirect) => indirect.to_record_batch(),
        }
    }
}

/// One consumer pull outcome. Fatal failures are the `Err` arm of the pull.
#[derive(Debug)]
pub enum SortPoll {
    /// First output; fixes the output schema.
    NewSchema(SortedOutput),
    Batch(SortedOutput),
    /// All rows were returned.
    Done,
    /// Upstream stopped or the operator was cancelled.
    Stopped,
}

impl SortPoll {
    pub fn output(&self) -> Option<&SortedOutput> {
        match self {
            SortPoll::NewSchema(out) | SortPoll::Batch(out) => Some(out),
            SortPoll::Done | SortPoll::Stopped => None,
        }
    }

    pub fn into_output(self) -> Option<SortedOutput> {
        match self {
            SortPoll::NewSchema(out) | SortPoll::Batch(out) => Some(out),
            SortPoll::Done | SortPoll::Stopped => None,
        }
    }
}

/// Factory for external sort operators.
pub struct ExternalSortFactory {
    name: String,
    options: ExternalSortOptions,
    generator: Arc<dyn ComparatorGenerator>,
}

impl ExternalSortFactory {
    pub fn new(node_id: i32, options: ExternalSortOptions) -> Self {
        let name = if node_id >= 0 {
            format!("EXTERNAL_SORT (id={node_id})")
        } else {
            "EXTERNAL_SORT".to_string()
        };
        Self {
            name,
            options,
            generator: Arc::new(ColumnComparatorGenerator),
        }
    }

    pub fn with_comparator_generator(mut self, generator: Arc<dyn ComparatorGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn options(&self) -> &ExternalSortOptions {
        &self.options
    }
}

impl OperatorFactory for ExternalSortFactory {
    type Operator = ExternalSortOperator;

    fn name(&self) -> &str {
        &self.name
    }

    fn create(
        &self,
        input: Box<dyn SortInput>,
        state: &RuntimeState,
    ) -> Result<ExternalSortOperator> {
        self.options.validate()?;
        let spiller = Spiller::new(self.options.spill_dirs.clone(), self.options.spill_codec)?;
        let tracker = MemTracker::new_child_with_limit(
            self.name.clone(),
            self.options.max_allocation_bytes,
            state.mem_tracker(),
        );
        let profile_node = state.profile().child(self.name.clone());
        profile_node.add_info_string("SortKeys", format!("{}", self.options.order_by.len()));
        profile_node.add_info_string("SpillCodec", self.options.spill_codec.to_string());
        let profile = SortProfile::new(&profile_node);
        let monitor = MemoryMonitor::new(
            self.options.max_allocation_bytes,
            self.options.spill_threshold,
            self.options.spill_batch_group_size,
        );
        Ok(ExternalSortOperator {
            name: self.name.clone(),
            options: self.options.clone(),
            generator: Arc::clone(&self.generator),
            input,
            tracker,
            error_state: Arc::clone(state.error_state()),
            profile_node,
            profile,
            spiller,
            state: SortState::Uninitialized,
            pending_event: None,
            schema: None,
            comparator: None,
            resident: VecDeque::new(),
            spilled: Vec::new(),
            monitor,
            schema_emitted: false,
            rows_returned: 0,
            cancel: CancelHandle::default(),
            released: false,
            failure: None,
        })
    }
}

struct SortProfile {
    sort_rows: CounterRef,
    sort_time: CounterRef,
    merge_time: CounterRef,
    peak_resident_bytes: CounterRef,
    spill: SpillProfile,
}

impl SortProfile {
    fn new(profile: &RuntimeProfile) -> Self {
        Self {
            sort_rows: profile.add_counter("SortRows", CounterUnit::Unit),
            sort_time: profile.add_timer("SortTime"),
            merge_time: profile.add_timer("MergeTime"),
            peak_resident_bytes: profile.add_counter("PeakResidentBytes", CounterUnit::Bytes),
            spill: SpillProfile::new(profile),
        }
    }
}

enum SortState {
    Uninitialized,
    Ingesting,
    FinalMemory(InMemoryMerge),
    FinalMerge {
        merger: KWayMerger,
        chunk_rows: usize,
    },
    Done,
    Failed,
}

impl SortState {
    fn label(&self) -> &'static str {
        match self {
            SortState::Uninitialized => "uninitialized",
            SortState::Ingesting => "ingesting",
            SortState::FinalMemory(_) => "final_memory",
            SortState::FinalMerge { .. } => "final_merge",
            SortState::Done => "done",
            SortState::Failed => "failed",
        }
    }
}

enum Ingested {
    End,
    Stop,
}

/// Pull-driven external sort over one upstream input.
pub struct ExternalSortOperator {
    name: String,
    options: ExternalSortOptions,
    generator: Arc<dyn ComparatorGenerator>,
    input: Box<dyn SortInput>,
    tracker: Arc<MemTracker>,
    error_state: Arc<RuntimeErrorState>,
    profile_node: RuntimeProfile,
    profile: SortProfile,
    spiller: Spiller,
    state: SortState,
    /// Upstream event pulled ahead by `build_schema`.
    pending_event: Option<InputEvent>,
    schema: Option<SchemaRef>,
    comparator: Option<Arc<RowComparator>>,
    /// Resident groups, oldest first.
    resident: VecDeque<BatchGroup>,
    spilled: Vec<BatchGroup>,
    monitor: MemoryMonitor,
    schema_emitted: bool,
    rows_returned: u64,
    cancel: CancelHandle,
    released: bool,
    failure: Option<SortError>,
}

impl Operator for ExternalSortOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        attach_mem_tracker_tree(&self.profile_node, &self.tracker);
        self.release_groups();
        if !matches!(self.state, SortState::Failed) {
            self.state = SortState::Done;
        }
        Ok(())
    }

    fn cancel(&mut self) {
        self.kill();
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, SortState::Done | SortState::Failed)
    }
}

impl ExternalSortOperator {
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile_node
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn rows_processed(&self) -> u64 {
        self.monitor.total_rows()
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    pub fn spill_count(&self) -> u64 {
        self.monitor.spill_count()
    }

    pub fn resident_groups(&self) -> usize {
        self.resident.len()
    }

    pub fn state_label(&self) -> &'static str {
        self.state.label()
    }

    /// Pull the first upstream batch and fix the output schema without
    /// sorting anything. The batch is kept for ingestion. Returns `None` when
    /// upstream ends or stops before producing a batch.
    pub fn build_schema(&mut self) -> Result<Option<SchemaRef>> {
        if let Some(err) = self.failure.as_ref() {
            return Err(err.replay());
        }
        if self.schema.is_some() || self.pending_event.is_some() {
            return Ok(self.schema.clone());
        }
        match self.prime_schema() {
            Ok(schema) => Ok(schema),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Pull the next sorted output.
    pub fn next(&mut self) -> Result<SortPoll> {
        if let Some(err) = self.failure.as_ref() {
            return Err(err.replay());
        }
        if self.cancel.is_cancelled() {
            self.release_on_cancel();
            return Ok(SortPoll::Stopped);
        }
        match self.step() {
            Ok(poll) => Ok(poll),
            Err(err) if err.is_cancelled() => {
                self.release_on_cancel();
                Ok(SortPoll::Stopped)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Cancel: release every batch group and spill file and stop upstream.
    pub fn kill(&mut self) {
        self.cancel.cancel();
        self.release_on_cancel();
    }

    fn step(&mut self) -> Result<SortPoll> {
        if matches!(self.state, SortState::Uninitialized | SortState::Ingesting) {
            self.state = SortState::Ingesting;
            match self.ingest()? {
                Ingested::Stop => {
                    self.release_groups();
                    self.state = SortState::Done;
                    return Ok(SortPoll::Stopped);
                }
                Ingested::End => self.finalize()?,
            }
        }
        let output_rows = self.options.output_batch_rows;
        let state_label = self.state.label();
        let output = match &mut self.state {
            SortState::FinalMemory(merge) => merge.next_window(output_rows).map(SortedOutput::Indirect),
            SortState::FinalMerge { merger, chunk_rows } => merger
                .next_chunk(*chunk_rows)?
                .map(|chunk| SortedOutput::Batch(chunk.into_batch())),
            SortState::Done => None,
            SortState::Uninitialized | SortState::Ingesting | SortState::Failed => {
                return Err(SortError::Unsupported(format!(
                    "external sort pulled in state {state_label}"
                )));
            }
        };
        match output {
            Some(output) => Ok(self.emit(output)),
            None => {
                if !matches!(self.state, SortState::Done) {
                    debug!(
                        "{} finished: rows_returned={} spills={}",
                        self.name,
                        self.rows_returned,
                        self.monitor.spill_count()
                    );
                }
                self.state = SortState::Done;
                Ok(SortPoll::Done)
            }
        }
    }

    fn emit(&mut self, output: SortedOutput) -> SortPoll {
        self.rows_returned += output.num_rows() as u64;
        if self.schema_emitted {
            SortPoll::Batch(output)
        } else {
            self.schema_emitted = true;
            SortPoll::NewSchema(output)
        }
    }

    fn prime_schema(&mut self) -> Result<Option<SchemaRef>> {
        let event = self.input.next()?;
        match event {
            InputEvent::NotYet => Err(not_yet_error()),
            InputEvent::Batch(chunk) => {
                self.ensure_comparator(&chunk.schema())?;
                self.pending_event = Some(InputEvent::Batch(chunk));
                Ok(self.schema.clone())
            }
            other => {
                self.pending_event = Some(other);
                Ok(None)
            }
        }
    }

    fn ingest(&mut self) -> Result<Ingested> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            let event = match self.pending_event.take() {
                Some(event) => event,
                None => self.input.next()?,
            };
            if self.input.take_memory_pressure() {
                self.on_out_of_memory()?;
            }
            match event {
                InputEvent::Batch(chunk) => self.add_batch(chunk)?,
                InputEvent::End => return Ok(Ingested::End),
                InputEvent::Stop => return Ok(Ingested::Stop),
                InputEvent::NotYet => return Err(not_yet_error()),
            }
        }
    }

    fn ensure_comparator(&mut self, schema: &SchemaRef) -> Result<Arc<RowComparator>> {
        if let (Some(existing), Some(comparator)) = (self.schema.as_ref(), self.comparator.as_ref())
        {
            if existing.fields() != schema.fields() {
                return Err(SortError::SchemaChange(format!(
                    "external sort does not support schema changes: {existing} -> {schema}"
                )));
            }
            return Ok(Arc::clone(comparator));
        }
        let comparator = Arc::new(self.generator.generate(schema, &self.options.order_by)?);
        debug!(
            "{} schema established: columns={} sort_keys={} row_width={}",
            self.name,
            schema.fields().len(),
            comparator.num_keys(),
            comparator.estimated_row_width()
        );
        self.schema = Some(schema.clone());
        self.comparator = Some(Arc::clone(&comparator));
        Ok(comparator)
    }

    fn add_batch(&mut self, mut chunk: Chunk) -> Result<()> {
        let comparator = self.ensure_comparator(&chunk.schema())?;
        if chunk.is_empty() {
            return Ok(());
        }
        chunk.transfer_to(&self.tracker);
        let mut offset = 0;
        while offset < chunk.len() {
            let len = (chunk.len() - offset).min(MAX_SV2_ROWS);
            self.stage(chunk.slice(offset, len), &comparator)?;
            offset += len;
        }
        Ok(())
    }

    fn stage(&mut self, chunk: Chunk, comparator: &Arc<RowComparator>) -> Result<()> {
        let mut sv2 = self.allocate_sv2(chunk.len())?;
        let run = {
            let _timer = ScopedTimer::new(Arc::clone(&self.profile.sort_time));
            let keys = sort_batch(comparator, &chunk.batch, &mut sv2)?;
            SortedRun::with_selection(chunk, sv2, keys, &self.tracker)
        };
        let rows = run.len() as u64;
        let bytes = run.memory_bytes();
        self.resident.push_back(BatchGroup::resident(run));
        self.monitor.on_staged(rows, bytes);
        self.profile.sort_rows.add(rows as i64);
        self.profile
            .peak_resident_bytes
            .set_max(self.monitor.resident_bytes());

        if let Some(reason) = self.monitor.should_spill(self.snapshot()) {
            self.spill(reason)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            allocator_current: self.tracker.current(),
            fragment_limit: self.tracker.nearest_ancestor_limit(),
            resident_groups: self.resident.len(),
        }
    }

    /// Allocate an SV2, spilling once and then backing off 1, 2, 4, ... units
    /// while the allocator stays full.
    fn allocate_sv2(&mut self, rows: usize) -> Result<SelectionVector2> {
        let err = match SelectionVector2::allocate(rows, &self.tracker) {
            Ok(sv2) => return Ok(sv2),
            Err(err) => err,
        };
        warn!(
            "{} sv2 allocation failed, spilling before retry: rows={} error={}",
            self.name, rows, err
        );
        self.spill(SpillReason::OutOfMemory)?;
        let mut wait_units = 1u32;
        loop {
            std::thread::sleep(self.options.sv2_alloc_retry_unit * wait_units);
            wait_units *= 2;
            match SelectionVector2::allocate(rows, &self.tracker) {
                Ok(sv2) => return Ok(sv2),
                Err(err) if wait_units >= SV2_MAX_WAIT_UNITS => {
                    return Err(SortError::OutOfMemory(format!(
                        "unable to allocate sv2 for {rows} rows after repeated attempts: {err}"
                    )));
                }
                Err(err) => {
                    warn!(
                        "{} sv2 allocation retry failed: rows={} next_wait_units={} error={}",
                        self.name, rows, wait_units, err
                    );
                }
            }
        }
    }

    fn on_out_of_memory(&mut self) -> Result<()> {
        let spill_now = self.monitor.on_out_of_memory();
        warn!(
            "{} upstream reported out of memory: resident_bytes={} spill_now={}",
            self.name,
            self.monitor.resident_bytes(),
            spill_now
        );
        if spill_now {
            self.spill(SpillReason::OutOfMemory)?;
        }
        Ok(())
    }

    fn spill(&mut self, reason: SpillReason) -> Result<()> {
        let Some(comparator) = self.comparator.clone() else {
            return Ok(());
        };
        let selected = select_spill_candidates(&mut self.resident);
        if selected.is_empty() {
            debug!(
                "{} spill skipped: reason={} resident_groups={}",
                self.name,
                reason,
                self.resident.len()
            );
            self.monitor.on_spill_skipped();
            return Ok(());
        }
        debug!(
            "{} spill triggered: reason={} merging={} resident_groups={} resident_bytes={} tracker_bytes={}",
            self.name,
            reason,
            selected.len(),
            self.resident.len() + selected.len(),
            self.monitor.resident_bytes(),
            self.tracker.current()
        );
        let chunk_rows = self.chunk_rows(&comparator);
        let outcome = merge_and_spill(
            selected,
            SpillContext {
                comparator: &comparator,
                tracker: &self.tracker,
                spiller: &mut self.spiller,
                profile: Some(&self.profile.spill),
                chunk_rows,
                cancelled: self.cancel.flag(),
            },
        )?;
        match outcome {
            Some(outcome) => {
                self.monitor
                    .on_spilled(outcome.released_bytes, outcome.retained_bytes);
                self.spilled.push(outcome.group);
            }
            None => self.monitor.on_spill_skipped(),
        }
        Ok(())
    }

    fn chunk_rows(&self, comparator: &RowComparator) -> usize {
        merge_chunk_rows(
            comparator.estimated_row_width(),
            self.options.target_spill_chunk_bytes,
            self.options.output_batch_rows,
        )
    }

    fn finalize(&mut self) -> Result<()> {
        if self.monitor.total_rows() == 0 {
            self.state = SortState::Done;
            return Ok(());
        }
        let (Some(schema), Some(comparator)) = (self.schema.clone(), self.comparator.clone())
        else {
            return Err(SortError::Unsupported(
                "rows were staged without an established schema".to_string(),
            ));
        };
        let _timer = ScopedTimer::new(Arc::clone(&self.profile.merge_time));
        if self.spilled.is_empty() {
            let groups = self.resident.drain(..).collect::<Vec<_>>();
            match build_in_memory(
                schema,
                groups,
                &self.tracker,
                self.options.max_in_memory_sort_bytes,
            )? {
                InMemoryBuild::Sorted(merge) => {
                    debug!(
                        "{} in-memory merge: rows={} batches={}",
                        self.name,
                        merge.total_rows(),
                        merge.num_batches()
                    );
                    self.state = SortState::FinalMemory(merge);
                    return Ok(());
                }
                InMemoryBuild::Refused { groups, reason } => {
                    info!(
                        "{} in-memory merge refused, streaming instead: {}",
                        self.name, reason
                    );
                    self.resident.extend(groups);
                }
            }
        }

        let mut groups = std::mem::take(&mut self.spilled);
        groups.extend(self.resident.drain(..));
        info!(
            "{} starting to merge: batch_groups={} spills={} allocated_bytes={}",
            self.name,
            groups.len(),
            self.monitor.spill_count(),
            self.tracker.current()
        );
        let chunk_rows = self.chunk_rows(&comparator);
        let merger = KWayMerger::try_new(
            comparator,
            Arc::clone(&self.tracker),
            Some(self.profile.spill.clone()),
            groups,
        )?;
        self.state = SortState::FinalMerge { merger, chunk_rows };
        Ok(())
    }

    fn fail(&mut self, err: SortError) -> SortError {
        let err = err.with_operator(&self.name, self.monitor.total_rows());
        error!(
            "{} failed in state {}: {}",
            self.name,
            self.state.label(),
            err
        );
        self.error_state.set_error(err.to_string());
        self.release_groups();
        self.state = SortState::Failed;
        self.failure = Some(err.replay());
        err
    }

    fn release_on_cancel(&mut self) {
        if self.released {
            return;
        }
        debug!(
            "{} cancelled in state {}: releasing {} resident and {} spilled groups",
            self.name,
            self.state.label(),
            self.resident.len(),
            self.spilled.len()
        );
        self.release_groups();
        self.state = SortState::Done;
        self.input.kill();
        self.released = true;
    }

    fn release_groups(&mut self) {
        self.pending_event = None;
        self.resident.clear();
        self.spilled.clear();
        if matches!(
            self.state,
            SortState::FinalMemory(_) | SortState::FinalMerge { .. }
        ) {
            self.state = SortState::Done;
        }
    }
}

fn not_yet_error() -> SortError {
    SortError::Unsupported("upstream returned NOT_YET; external sort cannot wait for input".to_string())
}
