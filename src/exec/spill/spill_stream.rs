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
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{Result, SortError};
use crate::exec::spill::block_format::{FileHeader, IndexEntry, read_header, read_index};
use crate::exec::spill::ipc_serde::{IpcSerde, schema_hash};

/// Sequential reader over the batches of one finished spill file.
#[derive(Debug)]
pub struct SpillStream {
    file: File,
    path: PathBuf,
    schema: SchemaRef,
    index: Vec<IndexEntry>,
    position: usize,
    ipc: IpcSerde,
}

impl SpillStream {
    pub fn open(path: impl AsRef<Path>, schema: SchemaRef) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| SortError::io(format!("open spill file {}", path.display()), e))?;
        let header = read_header(&mut file)?;
        validate_schema_hash(&header, &schema, &path)?;
        let index = read_index(&mut file, &header)?;
        let ipc = IpcSerde::new(header.codec)?;
        Ok(Self {
            file,
            path,
            schema,
            index,
            position: 0,
            ipc,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.index.len()
    }

    pub fn remaining_rows(&self) -> u64 {
        self.index[self.position.min(self.index.len())..]
            .iter()
            .map(|e| u64::from(e.num_rows))
            .sum()
    }

    pub fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let Some(entry) = self.index.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        let length = usize::try_from(entry.length).map_err(|_| {
            SortError::Corrupted(format!("spill message length {} overflows", entry.length))
        })?;
        let mut buf = vec![0u8; length];
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|e| SortError::io(format!("read spill file {}", self.path.display()), e))?;
        let batch = self.ipc.decode(buf)?;
        if batch.schema().fields() != self.schema.fields() {
            return Err(SortError::Corrupted(format!(
                "spill file {} yielded a batch with a different schema",
                self.path.display()
            )));
        }
        if batch.num_rows() != entry.num_rows as usize {
            return Err(SortError::Corrupted(format!(
                "spill file {} message {} holds {} rows, index says {}",
                self.path.display(),
                self.position - 1,
                batch.num_rows(),
                entry.num_rows
            )));
        }
        Ok(Some(batch))
    }
}

fn validate_schema_hash(header: &FileHeader, schema: &SchemaRef, path: &Path) -> Result<()> {
    let expected = schema_hash(schema.as_ref());
    if header.schema_hash != expected {
        return Err(SortError::SchemaChange(format!(
            "spill file {} was written with a different schema",
            path.display()
        )));
    }
    Ok(())
}
