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
//! On-disk layout of one spill file:
//!
//! ```text
//! [header: 40 bytes][ipc message 0][ipc message 1]...[index: 32 bytes per message]
//! ```
//!
//! The header is written as a placeholder when the file is created and
//! rewritten with the message count and index location on finish, so a file
//! can be appended to one chunk at a time. All integers are little-endian.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::common::error::{Result, SortError};
use crate::exec::spill::ipc_serde::SpillCodec;

const FILE_MAGIC: [u8; 4] = *b"XSRT";
const FILE_VERSION: u16 = 1;
pub const FILE_HEADER_LEN: usize = 40;
pub const INDEX_ENTRY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub codec: SpillCodec,
    pub num_messages: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub schema_hash: u64,
}

impl FileHeader {
    pub fn new(codec: SpillCodec, schema_hash: u64) -> Self {
        Self {
            codec,
            num_messages: 0,
            index_offset: 0,
            index_length: 0,
            schema_hash,
        }
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&FILE_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(FILE_HEADER_LEN as u16).to_le_bytes());
        buf[8] = self.codec.as_u8();
        buf[12..16].copy_from_slice(&self.num_messages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_length.to_le_bytes());
        buf[32..40].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if buf[..4] != FILE_MAGIC {
            return Err(SortError::Corrupted("spill file magic mismatch".to_string()));
        }
        let version = le_u16(buf, 4);
        if version != FILE_VERSION {
            return Err(SortError::Corrupted(format!(
                "unsupported spill file version: {version}"
            )));
        }
        let header_len = le_u16(buf, 6) as usize;
        if header_len != FILE_HEADER_LEN {
            return Err(SortError::Corrupted(format!(
                "unsupported spill file header length: {header_len}"
            )));
        }
        Ok(Self {
            codec: SpillCodec::try_from(buf[8])?,
            num_messages: le_u32(buf, 12),
            index_offset: le_u64(buf, 16),
            index_length: le_u64(buf, 24),
            schema_hash: le_u64(buf, 32),
        })
    }
}

/// Location of one encoded batch inside the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub length: u64,
    pub num_rows: u32,
}

impl IndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_LEN] {
        let mut buf = [0u8; INDEX_ENTRY_LEN];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.num_rows.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; INDEX_ENTRY_LEN]) -> Self {
        Self {
            offset: le_u64(buf, 0),
            length: le_u64(buf, 8),
            num_rows: le_u32(buf, 16),
        }
    }
}

pub fn write_header<W: Write>(writer: &mut W, header: &FileHeader) -> Result<()> {
    writer
        .write_all(&header.to_bytes())
        .map_err(|e| SortError::io("write spill file header", e))
}

pub fn read_header<R: Read>(reader: &mut R) -> Result<FileHeader> {
    let mut buf = [0u8; FILE_HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SortError::io("read spill file header", e))?;
    FileHeader::from_bytes(&buf)
}

pub fn write_index<W: Write>(writer: &mut W, entries: &[IndexEntry]) -> Result<()> {
    for entry in entries {
        writer
            .write_all(&entry.to_bytes())
            .map_err(|e| SortError::io("write spill file index", e))?;
    }
    Ok(())
}

pub fn read_index<R: Read + Seek>(reader: &mut R, header: &FileHeader) -> Result<Vec<IndexEntry>> {
    if header.index_length == 0 {
        return Ok(Vec::new());
    }
    if header.index_length % INDEX_ENTRY_LEN as u64 != 0
        || header.index_length / INDEX_ENTRY_LEN as u64 != u64::from(header.num_messages)
    {
        return Err(SortError::Corrupted(format!(
            "spill file index length {} does not match {} messages",
            header.index_length, header.num_messages
        )));
    }
    reader
        .seek(SeekFrom::Start(header.index_offset))
        .map_err(|e| SortError::io("seek to spill file index", e))?;
    let mut entries = Vec::with_capacity(header.num_messages as usize);
    let mut buf = [0u8; INDEX_ENTRY_LEN];
    for _ in 0..header.num_messages {
        reader
            .read_exact(&mut buf)
            .map_err(|e| SortError::io("read spill file index entry", e))?;
        entries.push(IndexEntry::from_bytes(&buf));
    }
    Ok(entries)
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}
