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
//! Integration tests for the external sort operator.

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;

use crate::common::{
    ChannelInput, TestConfig, Terminal, VecInput, create_operator, drain, id_name_batch,
    id_name_schema, int64_batch, limited_runtime_state, runtime_state, scrambled_int64_batches,
};
use xsort::exec::chunk::Chunk;
use xsort::exec::spill::SpillCodec;
use xsort::{
    ExternalSortOptions, InputEvent, Operator, SortError, SortExpression, SortPoll, SortedOutput,
    xsort_logging,
};

mod common;

fn assert_non_decreasing(values: &[i64]) {
    for pair in values.windows(2) {
        assert!(pair[0] <= pair[1], "out of order: {} > {}", pair[0], pair[1]);
    }
}

fn sorted_copy(batches: &[RecordBatch]) -> Vec<i64> {
    let mut values = batches
        .iter()
        .flat_map(|b| {
            b.column(0)
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .expect("int64")
                .values()
                .to_vec()
        })
        .collect::<Vec<_>>();
    values.sort_unstable();
    values
}

/// Options that spill every other staged batch.
fn spilling_options(config: &TestConfig) -> ExternalSortOptions {
    config
        .options(vec![SortExpression::asc("v")])
        .with_spill_threshold(1, 1)
        .with_output_batch_rows(700)
        .with_target_spill_chunk_bytes(800)
}

#[test]
fn test_sort_two_batches_by_id() {
    let config = TestConfig::new().expect("test config");
    config.init_logging();
    let state = runtime_state("test_sort_two_batches_by_id");
    let input = VecInput::batches(vec![
        id_name_batch(vec![Some(3), Some(1)], vec![Some("c"), Some("a")]),
        id_name_batch(vec![Some(2)], vec![Some("b")]),
    ]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("id")]), input);

    let drained = drain(&mut op).expect("drain");
    assert!(drained.saw_new_schema_first);
    assert_eq!(drained.terminal, Terminal::Done);
    assert_eq!(drained.int32_column(0), vec![Some(1), Some(2), Some(3)]);
    assert_eq!(
        drained.utf8_column(1),
        vec![Some("a".to_string()), Some("b".to_string()), Some("c".to_string())]
    );
    assert_eq!(op.spill_count(), 0);
    assert_eq!(op.rows_processed(), 3);
    assert_eq!(op.rows_returned(), 3);
    assert!(op.is_finished());

    // Terminal state is sticky.
    assert!(matches!(op.next().expect("pull after done"), SortPoll::Done));
}

#[test]
fn test_single_batch_is_served_from_memory() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_single_batch_is_served_from_memory");
    let input = VecInput::batches(vec![id_name_batch(
        vec![Some(5), Some(4), Some(9)],
        vec![Some("e"), Some("d"), Some("i")],
    )]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("id")]), input);

    match op.next().expect("first pull") {
        SortPoll::NewSchema(SortedOutput::Indirect(indirect)) => {
            assert_eq!(indirect.num_rows(), 3);
            assert_eq!(indirect.schema(), &id_name_schema());
        }
        other => panic!("expected an in-memory window first, got {other:?}"),
    }
    assert!(matches!(op.next().expect("second pull"), SortPoll::Done));
    assert_eq!(op.spill_count(), 0);
    assert_eq!(config.spill_files(), 0);
}

#[test]
fn test_empty_input_finishes_without_output() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_empty_input_finishes_without_output");
    let mut op = create_operator(
        &state,
        config.options(vec![SortExpression::asc("id")]),
        VecInput::new(Vec::new()),
    );
    assert!(matches!(op.next().expect("pull"), SortPoll::Done));
    assert!(op.schema().is_none());
}

#[test]
fn test_zero_row_batches_fix_schema_but_emit_nothing() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_zero_row_batches_fix_schema_but_emit_nothing");
    let input = VecInput::batches(vec![
        id_name_batch(Vec::new(), Vec::new()),
        id_name_batch(Vec::new(), Vec::new()),
    ]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("id")]), input);
    assert!(matches!(op.next().expect("pull"), SortPoll::Done));
    assert_eq!(op.schema(), Some(&id_name_schema()));
    assert_eq!(op.rows_processed(), 0);
}

#[test]
fn test_build_schema_before_sorting() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_build_schema_before_sorting");
    let input = VecInput::batches(vec![id_name_batch(vec![Some(2), Some(1)], vec![None, None])]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("id")]), input);

    let schema = op.build_schema().expect("build schema");
    assert_eq!(schema, Some(id_name_schema()));
    assert_eq!(op.rows_processed(), 0);

    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.int32_column(0), vec![Some(1), Some(2)]);
}

#[test]
fn test_descending_with_nulls_first() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_descending_with_nulls_first");
    let input = VecInput::batches(vec![
        id_name_batch(vec![Some(1), None, Some(7)], vec![Some("x"), Some("n"), Some("y")]),
        id_name_batch(vec![Some(4), None], vec![Some("z"), Some("m")]),
    ]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::desc("id")]), input);

    let drained = drain(&mut op).expect("drain");
    assert_eq!(
        drained.int32_column(0),
        vec![None, None, Some(7), Some(4), Some(1)]
    );
}

#[test]
fn test_ascending_nulls_last_then_secondary_key() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_ascending_nulls_last_then_secondary_key");
    let input = VecInput::batches(vec![
        id_name_batch(
            vec![Some(2), None, Some(1), Some(2)],
            vec![Some("a"), Some("q"), Some("b"), Some("c")],
        ),
        id_name_batch(vec![Some(1)], vec![Some("a")]),
    ]);
    let order_by = vec![SortExpression::asc("id"), SortExpression::desc("name")];
    let mut op = create_operator(&state, config.options(order_by), input);

    let drained = drain(&mut op).expect("drain");
    assert_eq!(
        drained.int32_column(0),
        vec![Some(1), Some(1), Some(2), Some(2), None]
    );
    assert_eq!(
        drained.utf8_column(1),
        vec![
            Some("b".to_string()),
            Some("a".to_string()),
            Some("c".to_string()),
            Some("a".to_string()),
            Some("q".to_string()),
        ]
    );
}

#[test]
fn test_forced_spill_produces_sorted_output() {
    let config = TestConfig::new().expect("test config");
    config.init_logging();
    let state = runtime_state("test_forced_spill_produces_sorted_output");
    let batches = scrambled_int64_batches(20_000, 500, 17);
    let expected = sorted_copy(&batches);
    let mut op = create_operator(&state, spilling_options(&config), VecInput::batches(batches));

    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.terminal, Terminal::Done);
    assert!(op.spill_count() > 0, "expected at least one spill");
    assert!(drained.batches.iter().all(|b| b.num_rows() <= 700));
    let values = drained.int64_column(0);
    assert_non_decreasing(&values);
    assert_eq!(values, expected);

    assert_eq!(op.mem_tracker().current(), 0);
    assert_eq!(config.spill_files(), 0);
    op.close().expect("close");
}

#[test]
fn test_spilling_does_not_change_the_result() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_spilling_does_not_change_the_result");
    let batches = scrambled_int64_batches(6_000, 250, 99);

    let mut in_memory = create_operator(
        &state,
        config.options(vec![SortExpression::desc("v")]),
        VecInput::batches(batches.clone()),
    );
    let mut options = spilling_options(&config)
        .with_spill_threshold(2, 1)
        .with_spill_codec(SpillCodec::Zstd);
    options.order_by = vec![SortExpression::desc("v")];
    let mut spilling = create_operator(&state, options, VecInput::batches(batches));

    let expected = drain(&mut in_memory).expect("drain in memory").int64_column(0);
    let actual = drain(&mut spilling).expect("drain spilling").int64_column(0);
    assert_eq!(in_memory.spill_count(), 0);
    assert!(spilling.spill_count() > 0);
    assert_eq!(actual, expected);
}

#[test]
fn test_sorting_sorted_output_is_stable() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_sorting_sorted_output_is_stable");
    let batches = scrambled_int64_batches(3_000, 400, 5);

    let mut first = create_operator(
        &state,
        spilling_options(&config),
        VecInput::batches(batches),
    );
    let once = drain(&mut first).expect("first sort");

    let mut second = create_operator(
        &state,
        config.options(vec![SortExpression::asc("v")]),
        VecInput::batches(once.batches.clone()),
    );
    let twice = drain(&mut second).expect("second sort");
    assert_eq!(once.int64_column(0), twice.int64_column(0));
}

#[test]
fn test_batch_larger_than_sv2_limit() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_batch_larger_than_sv2_limit");
    let rows = 70_000i64;
    let values = (0..rows).map(|i| (i * 7919) % rows).collect::<Vec<_>>();
    let mut op = create_operator(
        &state,
        config.options(vec![SortExpression::asc("v")]),
        VecInput::batches(vec![int64_batch(values)]),
    );

    let drained = drain(&mut op).expect("drain");
    let sorted = drained.int64_column(0);
    assert_eq!(sorted.len(), rows as usize);
    assert_eq!(sorted, (0..rows).collect::<Vec<_>>());
}

#[test]
fn test_cancel_mid_merge_releases_memory_and_files() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_cancel_mid_merge_releases_memory_and_files");
    let input = VecInput::batches(scrambled_int64_batches(10_000, 500, 3));
    let killed = input.killed_flag();
    let mut op = create_operator(&state, spilling_options(&config), input);

    let first = op.next().expect("first pull");
    assert!(matches!(first, SortPoll::NewSchema(_)));
    drop(first);
    assert!(op.spill_count() > 0);
    assert!(config.spill_files() > 0);

    op.cancel_handle().cancel();
    assert!(matches!(op.next().expect("cancelled pull"), SortPoll::Stopped));
    assert!(matches!(op.next().expect("pull after cancel"), SortPoll::Stopped));
    assert!(killed.load(Ordering::Acquire));
    assert_eq!(op.mem_tracker().current(), 0);
    assert_eq!(config.spill_files(), 0);
}

#[test]
fn test_cancel_from_another_thread_during_ingestion() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_cancel_from_another_thread_during_ingestion");
    let (tx, rx) = mpsc::channel();
    let input = ChannelInput::new(rx);
    let killed = input.killed_flag();
    let mut op = create_operator(&state, spilling_options(&config), input);
    let cancel = op.cancel_handle();

    let worker = std::thread::spawn(move || {
        let poll = op.next();
        (op, poll)
    });
    for batch in scrambled_int64_batches(5_000, 500, 21) {
        tx.send(batch).expect("send");
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while config.spill_files() == 0 {
        assert!(Instant::now() < deadline, "ingestion never spilled");
        std::thread::sleep(Duration::from_millis(5));
    }

    cancel.cancel();
    // Wakes the operator if it is blocked on upstream.
    tx.send(int64_batch(vec![1, 2, 3])).expect("send");
    let (mut op, poll) = worker.join().expect("sort thread");
    assert!(matches!(poll.expect("cancelled pull"), SortPoll::Stopped));
    assert!(matches!(op.next().expect("pull after cancel"), SortPoll::Stopped));
    assert!(op.spill_count() > 0);
    assert!(killed.load(Ordering::Acquire));
    assert_eq!(op.mem_tracker().current(), 0);
    assert_eq!(config.spill_files(), 0);
}

#[test]
fn test_kill_before_first_pull() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_kill_before_first_pull");
    let input = VecInput::batches(vec![int64_batch(vec![3, 2, 1])]);
    let killed = input.killed_flag();
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("v")]), input);

    op.kill();
    op.kill();
    assert!(killed.load(Ordering::Acquire));
    assert!(matches!(op.next().expect("pull"), SortPoll::Stopped));
    assert_eq!(op.mem_tracker().current(), 0);
}

#[test]
fn test_upstream_stop_is_forwarded() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_upstream_stop_is_forwarded");
    let input = VecInput::new(vec![
        InputEvent::Batch(Chunk::new(int64_batch(vec![9, 8]))),
        InputEvent::Stop,
    ]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("v")]), input);

    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.terminal, Terminal::Stopped);
    assert_eq!(drained.num_rows(), 0);
    assert_eq!(op.mem_tracker().current(), 0);
}

#[test]
fn test_not_yet_is_fatal() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_not_yet_is_fatal");
    let input = VecInput::new(vec![
        InputEvent::Batch(Chunk::new(int64_batch(vec![1]))),
        InputEvent::NotYet,
    ]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("v")]), input);

    let err = op.next().expect_err("not yet must fail");
    assert!(
        matches!(&err, SortError::Failed { source, .. } if matches!(**source, SortError::Unsupported(_))),
        "{err}"
    );
    assert!(state.error_state().error().is_some());
    let replayed = op.next().expect_err("failure is sticky");
    assert_eq!(replayed.to_string(), err.to_string());
    assert_eq!(op.mem_tracker().current(), 0);
}

#[test]
fn test_schema_change_is_fatal() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_schema_change_is_fatal");
    let widened = RecordBatch::try_new(
        std::sync::Arc::new(arrow::datatypes::Schema::new(vec![
            arrow::datatypes::Field::new("v", arrow::datatypes::DataType::Int32, false),
        ])),
        vec![std::sync::Arc::new(arrow::array::Int32Array::from(vec![1]))],
    )
    .expect("record batch");
    let input = VecInput::batches(vec![int64_batch(vec![2, 1]), widened]);
    let mut op = create_operator(&state, config.options(vec![SortExpression::asc("v")]), input);

    let err = op.next().expect_err("schema change must fail");
    assert!(
        matches!(&err, SortError::Failed { source, .. } if matches!(**source, SortError::SchemaChange(_))),
        "{err}"
    );
}

#[test]
fn test_unknown_sort_key_is_rejected() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_unknown_sort_key_is_rejected");
    let input = VecInput::batches(vec![int64_batch(vec![1])]);
    let mut op = create_operator(
        &state,
        config.options(vec![SortExpression::asc("missing")]),
        input,
    );
    let err = op.build_schema().expect_err("unknown key");
    assert!(
        matches!(&err, SortError::Failed { source, .. } if matches!(**source, SortError::SchemaChange(_))),
        "{err}"
    );
}

#[test]
fn test_options_from_config_file() {
    let config = TestConfig::new().expect("test config");
    let loaded = config.load_config().expect("load config");
    assert_eq!(loaded.sort.sv2_alloc_retry_unit_ms, 1);
    xsort_logging::init_from_config();

    let options =
        ExternalSortOptions::from_app_config(vec![SortExpression::asc("v")]).expect("options");
    assert_eq!(options.sv2_alloc_retry_unit, Duration::from_millis(1));
    assert_eq!(options.output_batch_rows, 4096);
    assert_eq!(options.spill_dirs.len(), 1);

    let state = runtime_state("test_options_from_config_file");
    let options = options.with_spill_dirs(vec![config.spill_dir.clone()]);
    let mut op = create_operator(
        &state,
        options,
        VecInput::batches(vec![int64_batch(vec![3, 1, 2])]),
    );
    let drained = drain(&mut op).expect("drain");
    let merged = concat_batches(&drained.batches[0].schema(), &drained.batches).expect("concat");
    assert_eq!(merged.num_rows(), 3);
    assert_eq!(drained.int64_column(0), vec![1, 2, 3]);
}

#[test]
fn test_split_batch_counts_each_row_once() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_split_batch_counts_each_row_once");
    let batches = scrambled_int64_batches(200_000, 200_000, 11);
    let expected = sorted_copy(&batches);
    let mut op = create_operator(
        &state,
        config.options(vec![SortExpression::asc("v")]),
        VecInput::batches(batches),
    );

    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.int64_column(0), expected);
    let peak_resident = op
        .profile()
        .get_counter("PeakResidentBytes")
        .expect("peak resident counter")
        .value();
    let tracker_peak = op.mem_tracker().peak();
    assert!(peak_resident > 0);
    assert!(
        peak_resident <= tracker_peak,
        "resident={peak_resident} tracker={tracker_peak}"
    );
}

#[test]
fn test_allocation_limit_alone_triggers_spills() {
    let config = TestConfig::new().expect("test config");
    let state = runtime_state("test_allocation_limit_alone_triggers_spills");
    let batches = scrambled_int64_batches(20_000, 1_000, 5);
    let expected = sorted_copy(&batches);

    let mut unlimited = create_operator(
        &state,
        config.options(vec![SortExpression::asc("v")]),
        VecInput::batches(batches.clone()),
    );
    assert_eq!(drain(&mut unlimited).expect("drain").int64_column(0), expected);
    assert_eq!(unlimited.spill_count(), 0);

    let options = config
        .options(vec![SortExpression::asc("v")])
        .with_max_allocation_bytes(190_000)
        .with_target_spill_chunk_bytes(80);
    let mut op = create_operator(&state, options, VecInput::batches(batches));
    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.int64_column(0), expected);
    assert!(op.spill_count() > 0);
    assert_eq!(op.mem_tracker().current(), 0);
    assert_eq!(config.spill_files(), 0);
}

#[test]
fn test_fragment_limit_triggers_spills() {
    let config = TestConfig::new().expect("test config");
    let state = limited_runtime_state("test_fragment_limit_triggers_spills", 190_000);
    let batches = scrambled_int64_batches(20_000, 1_000, 8);
    let expected = sorted_copy(&batches);
    let options = config
        .options(vec![SortExpression::asc("v")])
        .with_target_spill_chunk_bytes(80);
    let mut op = create_operator(&state, options, VecInput::batches(batches));

    let drained = drain(&mut op).expect("drain");
    assert_eq!(drained.int64_column(0), expected);
    assert!(op.spill_count() > 0);
    assert_eq!(state.mem_tracker().current(), 0);
    assert_eq!(config.spill_files(), 0);
}
