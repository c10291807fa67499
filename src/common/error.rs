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
//! Error vocabulary of the external sort operator.

use arrow::error::ArrowError;
use thiserror::Error;

use crate::runtime::mem_tracker::MemLimitExceeded;

/// Failure kinds surfaced by the sort operator and its collaborators.
///
/// `Cancelled` is internal plumbing: a spill write that observes the cancel
/// flag unwinds with it and the driver turns it into `SortPoll::Stopped`.
/// It never reaches a consumer as an error.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("schema change: {0}")]
    SchemaChange(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("spill io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("spill file corrupted: {0}")]
    Corrupted(String),

    #[error("operator cancelled")]
    Cancelled,

    #[error("{operator} failed after {rows_processed} rows: {source}")]
    Failed {
        operator: String,
        rows_processed: u64,
        #[source]
        source: Box<SortError>,
    },
}

pub type Result<T> = std::result::Result<T, SortError>;

impl SortError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SortError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        match self {
            SortError::OutOfMemory(_) => true,
            SortError::Failed { source, .. } => source.is_out_of_memory(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SortError::Cancelled)
    }

    /// Attach operator identity, unless already attached.
    pub fn with_operator(self, operator: &str, rows_processed: u64) -> Self {
        match self {
            SortError::Failed { .. } => self,
            other => SortError::Failed {
                operator: operator.to_string(),
                rows_processed,
                source: Box::new(other),
            },
        }
    }

    /// A detached copy used to replay a terminal failure on later pulls.
    ///
    /// Sources that are not `Clone` (io, arrow) are flattened to their message.
    pub fn replay(&self) -> Self {
        match self {
            SortError::SchemaChange(msg) => SortError::SchemaChange(msg.clone()),
            SortError::OutOfMemory(msg) => SortError::OutOfMemory(msg.clone()),
            SortError::Io { context, source } => SortError::Io {
                context: context.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            SortError::Unsupported(msg) => SortError::Unsupported(msg.clone()),
            SortError::Arrow(err) => SortError::Arrow(ArrowError::ExternalError(
                err.to_string().into(),
            )),
            SortError::Config(msg) => SortError::Config(msg.clone()),
            SortError::Corrupted(msg) => SortError::Corrupted(msg.clone()),
            SortError::Cancelled => SortError::Cancelled,
            SortError::Failed {
                operator,
                rows_processed,
                source,
            } => SortError::Failed {
                operator: operator.clone(),
                rows_processed: *rows_processed,
                source: Box::new(source.replay()),
            },
        }
    }
}

impl From<MemLimitExceeded> for SortError {
    fn from(err: MemLimitExceeded) -> Self {
        SortError::OutOfMemory(err.to_string())
    }
}
