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
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::{CompressionType, MetadataVersion};

use crate::common::error::{Result, SortError};

const IPC_ALIGNMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
    Zstd,
}

impl SpillCodec {
    pub fn as_u8(self) -> u8 {
        match self {
            SpillCodec::None => 0,
            SpillCodec::Lz4 => 1,
            SpillCodec::Zstd => 2,
        }
    }
}

impl FromStr for SpillCodec {
    type Err = SortError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            _ => Err(SortError::Config(format!(
                "unsupported sort.spill_compression: {value}"
            ))),
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = SortError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            2 => Ok(SpillCodec::Zstd),
            _ => Err(SortError::Corrupted(format!(
                "unknown spill codec value: {value}"
            ))),
        }
    }
}

impl fmt::Display for SpillCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillCodec::None => write!(f, "none"),
            SpillCodec::Lz4 => write!(f, "lz4"),
            SpillCodec::Zstd => write!(f, "zstd"),
        }
    }
}

/// Encodes each batch as a self-contained Arrow IPC stream message.
#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> Result<Self> {
        let options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)?;
        let write_options = match codec {
            SpillCodec::None => options,
            SpillCodec::Lz4 => options.try_with_compression(Some(CompressionType::LZ4_FRAME))?,
            SpillCodec::Zstd => options.try_with_compression(Some(CompressionType::ZSTD))?,
        };
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode(&self, batch: &RecordBatch) -> Result<Vec<u8>> {
        let mut writer = StreamWriter::try_new_with_options(
            Vec::new(),
            batch.schema().as_ref(),
            self.write_options.clone(),
        )?;
        writer.write(batch)?;
        writer.finish()?;
        Ok(writer.into_inner()?)
    }

    pub fn decode(&self, message: Vec<u8>) -> Result<RecordBatch> {
        let mut reader = StreamReader::try_new(Cursor::new(message), None)?;
        let batch = reader.next().transpose()?.ok_or_else(|| {
            SortError::Corrupted("spill message did not contain a record batch".to_string())
        })?;
        if reader.next().is_some() {
            return Err(SortError::Corrupted(
                "spill message contained more than one record batch".to_string(),
            ));
        }
        Ok(batch)
    }
}

/// FNV-1a over the schema's display form; written into every spill file header.
pub fn schema_hash(schema: &Schema) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    schema
        .to_string()
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}
