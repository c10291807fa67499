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
use arrow::array::{Array, RecordBatch};
use arrow::compute::interleave;
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;

use crate::exec::chunk::Chunk;
use crate::exec::selection::{MAX_SV4_BATCHES, SelectionVector4};

/// Logical view over many same-schema batches, addressed by batch ordinal.
///
/// Holds the chunks (and therefore their memory charges) alive for as long as
/// any SV4 window over it is outstanding.
#[derive(Debug)]
pub struct HyperBatch {
    schema: SchemaRef,
    chunks: Vec<Chunk>,
}

impl HyperBatch {
    pub fn try_new(schema: SchemaRef, chunks: Vec<Chunk>) -> Result<Self, ArrowError> {
        if chunks.len() > MAX_SV4_BATCHES {
            return Err(ArrowError::InvalidArgumentError(format!(
                "hyper-batch holds {} batches, at most {} are addressable",
                chunks.len(),
                MAX_SV4_BATCHES
            )));
        }
        for (idx, chunk) in chunks.iter().enumerate() {
            if chunk.schema().fields() != schema.fields() {
                return Err(ArrowError::SchemaError(format!(
                    "hyper-batch member {idx} has schema {:?}, expected {:?}",
                    chunk.schema(),
                    schema
                )));
            }
        }
        Ok(Self { schema, chunks })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_batches(&self) -> usize {
        self.chunks.len()
    }

    pub fn batch(&self, ordinal: usize) -> &RecordBatch {
        &self.chunks[ordinal].batch
    }

    pub fn total_rows(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Copy the rows named by packed SV4 entries, in order, into one batch.
    pub fn gather(&self, entries: &[u32]) -> Result<RecordBatch, ArrowError> {
        let indices = entries
            .iter()
            .map(|&e| (SelectionVector4::batch_of(e), SelectionVector4::row_of(e)))
            .collect::<Vec<_>>();
        interleave_batches(&self.schema, self.chunks.iter().map(|c| &c.batch), &indices)
    }
}

/// Build a batch by picking `(batch, row)` pairs out of `batches`.
pub(crate) fn interleave_batches<'a>(
    schema: &SchemaRef,
    batches: impl Iterator<Item = &'a RecordBatch> + Clone,
    indices: &[(usize, usize)],
) -> Result<RecordBatch, ArrowError> {
    let columns = (0..schema.fields().len())
        .map(|column_idx| {
            let arrays: Vec<&dyn Array> = batches
                .clone()
                .map(|batch| batch.column(column_idx).as_ref())
                .collect();
            interleave(&arrays, indices)
        })
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema.clone(), columns)
}
