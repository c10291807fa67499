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
//! Row comparator and row-copy routine for external sort.
//!
//! Responsibilities:
//! - Resolves the sort keys against an established schema once.
//! - Encodes sort keys into byte-comparable rows so that every comparison,
//!   within one batch or across batches, is a plain byte comparison.
//! - Copies winning rows of a merge into an output batch column-wise.
//!
//! Key exported interfaces:
//! - Types: `SortExpression`, `SortKeyExpr`, `RowComparator`, `ComparatorGenerator`.
//!
//! Current limitations:
//! - Sort keys are column references; computed keys must be projected upstream.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::SortOptions;
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::row::{Row, RowConverter, Rows, SortField};

use crate::common::error::{Result, SortError};
use crate::exec::selection::SelectionVector2;
use crate::exec::selection::hyper_batch::interleave_batches;

/// Width assumed for variable-width columns when sizing merge chunks.
const VARIABLE_WIDTH_ESTIMATE: usize = 50;

/// Reference to the column a sort key reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortKeyExpr {
    Column(String),
    ColumnIndex(usize),
}

impl SortKeyExpr {
    pub fn resolve(&self, schema: &Schema) -> Result<usize> {
        match self {
            SortKeyExpr::Column(name) => schema.index_of(name).map_err(|_| {
                SortError::SchemaChange(format!("sort key column '{name}' not found in {schema}"))
            }),
            SortKeyExpr::ColumnIndex(idx) if *idx < schema.fields().len() => Ok(*idx),
            SortKeyExpr::ColumnIndex(idx) => Err(SortError::SchemaChange(format!(
                "sort key column #{idx} out of range for {} columns",
                schema.fields().len()
            ))),
        }
    }
}

impl fmt::Display for SortKeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKeyExpr::Column(name) => write!(f, "{name}"),
            SortKeyExpr::ColumnIndex(idx) => write!(f, "#{idx}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortExpression {
    pub key: SortKeyExpr,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortExpression {
    pub fn new(key: SortKeyExpr, asc: bool, nulls_first: bool) -> Self {
        Self {
            key,
            asc,
            nulls_first,
        }
    }

    /// Ascending, nulls last.
    pub fn asc(column: impl Into<String>) -> Self {
        Self::new(SortKeyExpr::Column(column.into()), true, false)
    }

    /// Descending, nulls first.
    pub fn desc(column: impl Into<String>) -> Self {
        Self::new(SortKeyExpr::Column(column.into()), false, true)
    }

    pub fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }

    fn sort_options(&self) -> SortOptions {
        SortOptions {
            descending: !self.asc,
            nulls_first: self.nulls_first,
        }
    }
}

/// Builds the comparator for a newly established schema.
pub trait ComparatorGenerator: Send + Sync + fmt::Debug {
    fn generate(&self, schema: &SchemaRef, order_by: &[SortExpression]) -> Result<RowComparator>;
}

/// Default generator: one arrow `SortField` per key column.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnComparatorGenerator;

impl ComparatorGenerator for ColumnComparatorGenerator {
    fn generate(&self, schema: &SchemaRef, order_by: &[SortExpression]) -> Result<RowComparator> {
        RowComparator::try_new(schema.clone(), order_by)
    }
}

/// Comparator plus copy routine for one fixed schema.
///
/// Keys of a batch are encoded once with [`RowComparator::encode_keys`]; the
/// resulting `Rows` compare with the sort keys' semantics:
/// keys left to right, direction per key, nulls placed per key.
#[derive(Debug)]
pub struct RowComparator {
    schema: SchemaRef,
    key_columns: Vec<usize>,
    converter: RowConverter,
    row_width: usize,
}

impl RowComparator {
    pub fn try_new(schema: SchemaRef, order_by: &[SortExpression]) -> Result<Self> {
        if order_by.is_empty() {
            return Err(SortError::Config(
                "external sort requires at least one order-by key".to_string(),
            ));
        }
        let mut key_columns = Vec::with_capacity(order_by.len());
        let mut fields = Vec::with_capacity(order_by.len());
        for expr in order_by {
            let idx = expr.key.resolve(schema.as_ref())?;
            let data_type = schema.field(idx).data_type().clone();
            key_columns.push(idx);
            fields.push(SortField::new_with_options(data_type, expr.sort_options()));
        }
        if !RowConverter::supports_fields(&fields) {
            let types = key_columns
                .iter()
                .map(|&idx| schema.field(idx).data_type().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SortError::SchemaChange(format!(
                "sort keys of type [{types}] are not comparable"
            )));
        }
        let converter = RowConverter::new(fields)
            .map_err(|e| SortError::SchemaChange(format!("build sort key comparator: {e}")))?;
        let row_width = estimate_row_width(schema.as_ref());
        Ok(Self {
            schema,
            key_columns,
            converter,
            row_width,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_keys(&self) -> usize {
        self.key_columns.len()
    }

    /// Estimated bytes per output row, used to size merge chunks.
    pub fn estimated_row_width(&self) -> usize {
        self.row_width
    }

    /// Encode the sort keys of `batch` into byte-comparable rows.
    pub fn encode_keys(&self, batch: &RecordBatch) -> Result<Rows> {
        if batch.schema().fields() != self.schema.fields() {
            return Err(SortError::SchemaChange(format!(
                "batch schema {} does not match established schema {}",
                batch.schema(),
                self.schema
            )));
        }
        let columns = self
            .key_columns
            .iter()
            .map(|&idx| Arc::clone(batch.column(idx)))
            .collect::<Vec<ArrayRef>>();
        Ok(self.converter.convert_columns(&columns)?)
    }

    /// Compare logical positions `left` and `right` of one batch ordered by `sv2`.
    pub fn compare_in_batch(
        &self,
        keys: &Rows,
        sv2: &SelectionVector2,
        left: usize,
        right: usize,
    ) -> Ordering {
        keys.row(sv2.get(left)).cmp(&keys.row(sv2.get(right)))
    }

    /// Compare rows located in two different batches.
    pub fn compare_across(&self, left: Row<'_>, right: Row<'_>) -> Ordering {
        left.cmp(&right)
    }

    /// Append the rows named by `(batch, row)` pairs, in order, into one batch.
    pub fn copy_rows(
        &self,
        batches: &[&RecordBatch],
        indices: &[(usize, usize)],
    ) -> Result<RecordBatch> {
        Ok(interleave_batches(
            &self.schema,
            batches.iter().copied(),
            indices,
        )?)
    }
}

fn estimate_row_width(schema: &Schema) -> usize {
    schema
        .fields()
        .iter()
        .map(|field| match field.data_type() {
            DataType::Null => 0,
            DataType::Boolean => 1,
            other => other.primitive_width().unwrap_or(VARIABLE_WIDTH_ESTIMATE),
        })
        .sum::<usize>()
        .max(1)
}
