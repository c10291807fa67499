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
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::common::error::{Result, SortError};
use crate::common::logging::{debug, warn};
use crate::exec::spill::block_format::{
    FILE_HEADER_LEN, FileHeader, INDEX_ENTRY_LEN, IndexEntry, write_header, write_index,
};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{IpcSerde, SpillCodec, schema_hash};
use crate::exec::spill::spill_stream::SpillStream;

/// Process-wide sequence making spill file names unique per operator instance.
static NEXT_INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Creates the spill files of one operator instance.
///
/// Files are named `spill_<pid>_<instance>_<spill index>.arrow` and placed
/// round-robin over the configured directories.
#[derive(Debug)]
pub struct Spiller {
    dir_manager: DirManager,
    ipc: IpcSerde,
    pid: u32,
    instance_seq: u64,
    next_spill_index: u64,
}

impl Spiller {
    pub fn new(dirs: Vec<PathBuf>, codec: SpillCodec) -> Result<Self> {
        Ok(Self {
            dir_manager: DirManager::new(dirs)?,
            ipc: IpcSerde::new(codec)?,
            pid: std::process::id(),
            instance_seq: NEXT_INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed),
            next_spill_index: 0,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.ipc.codec()
    }

    pub fn spill_count(&self) -> u64 {
        self.next_spill_index
    }

    /// Create the file for the next spill event and write its header placeholder.
    pub fn create_writer(&mut self, schema: &SchemaRef) -> Result<SpillWriter> {
        let spill_index = self.next_spill_index;
        self.next_spill_index += 1;
        let path = self.dir_manager.next_dir().join(format!(
            "spill_{}_{}_{}.arrow",
            self.pid, self.instance_seq, spill_index
        ));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| SortError::io(format!("create spill file {}", path.display()), e))?;
        let mut writer = SpillWriter {
            path: Some(path),
            file: BufWriter::new(file),
            schema: schema.clone(),
            header: FileHeader::new(self.ipc.codec(), schema_hash(schema.as_ref())),
            index: Vec::new(),
            ipc: self.ipc.clone(),
            offset: FILE_HEADER_LEN as u64,
            rows: 0,
        };
        write_header(&mut writer.file, &writer.header)?;
        Ok(writer)
    }
}

/// Append-only writer of one spill file.
///
/// Dropping a writer that was not finished deletes the partial file.
#[derive(Debug)]
pub struct SpillWriter {
    path: Option<PathBuf>,
    file: BufWriter<File>,
    schema: SchemaRef,
    header: FileHeader,
    index: Vec<IndexEntry>,
    ipc: IpcSerde,
    offset: u64,
    rows: u64,
}

impl SpillWriter {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, batch: &RecordBatch) -> Result<()> {
        let encoded = self.ipc.encode(batch)?;
        let num_rows = u32::try_from(batch.num_rows()).map_err(|_| {
            SortError::Unsupported(format!("spill batch of {} rows", batch.num_rows()))
        })?;
        self.file
            .write_all(&encoded)
            .map_err(|e| SortError::io(format!("write spill file {}", self.display_path()), e))?;
        let length = encoded.len() as u64;
        self.index.push(IndexEntry {
            offset: self.offset,
            length,
            num_rows,
        });
        self.offset += length;
        self.rows += u64::from(num_rows);
        Ok(())
    }

    /// Write the index, rewrite the header and hand the file over to a guard.
    pub fn finish(mut self) -> Result<SpillFile> {
        self.header.num_messages = self.index.len() as u32;
        self.header.index_offset = self.offset;
        self.header.index_length = (self.index.len() * INDEX_ENTRY_LEN) as u64;
        write_index(&mut self.file, &self.index)?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SortError::io(format!("seek spill file {}", self.display_path()), e))?;
        write_header(&mut self.file, &self.header)?;
        self.file
            .flush()
            .map_err(|e| SortError::io(format!("flush spill file {}", self.display_path()), e))?;

        let bytes = self.offset + self.header.index_length;
        let path = self
            .path
            .take()
            .ok_or_else(|| SortError::Unsupported("spill writer finished twice".to_string()))?;
        debug!(
            "spill file finished: path={} batches={} rows={} bytes={}",
            path.display(),
            self.index.len(),
            self.rows,
            bytes
        );
        Ok(SpillFile {
            path,
            schema: self.schema.clone(),
            num_batches: self.index.len(),
            num_rows: self.rows,
            num_bytes: bytes,
        })
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            remove_spill_file(&path);
        }
    }
}

/// A finished spill file. The file is deleted when the handle drops.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    schema: SchemaRef,
    num_batches: usize,
    num_rows: u64,
    num_bytes: u64,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    pub fn open_stream(&self) -> Result<SpillStream> {
        SpillStream::open(&self.path, self.schema.clone())
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        remove_spill_file(&self.path);
    }
}

fn remove_spill_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(
            "Sort spill remove file failed: path={} error={}",
            path.display(),
            err
        );
    }
}
