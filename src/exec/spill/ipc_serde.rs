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
//! Arrow IPC encoding of spill messages, one record batch per message.

use std::fmt;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;
use arrow::datatypes::{DataType, Schema};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileDecoder;
use arrow::ipc::writer::{
    CompressionContext, DictionaryTracker, EncodedData, IpcDataGenerator, IpcWriteOptions,
    write_message,
};
use arrow::ipc::{Block, CompressionType, MetadataVersion};

use crate::exec::error::{SortError, SortResult};

const IPC_ALIGNMENT: usize = 64;
const CONTINUATION_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

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

    pub fn parse(value: &str) -> SortResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SpillCodec::None),
            "lz4" => Ok(SpillCodec::Lz4),
            "zstd" => Ok(SpillCodec::Zstd),
            _ => Err(SortError::internal(format!(
                "unsupported spill ipc compression: {value}"
            ))),
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = SortError;

    fn try_from(value: u8) -> SortResult<Self> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            2 => Ok(SpillCodec::Zstd),
            _ => Err(SortError::corrupt(format!(
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

#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub num_rows: u32,
}

#[derive(Debug, Clone)]
pub struct IpcSerde {
    codec: SpillCodec,
    write_options: IpcWriteOptions,
}

impl IpcSerde {
    pub fn new(codec: SpillCodec) -> SortResult<Self> {
        let write_options = build_ipc_write_options(codec)?;
        Ok(Self {
            codec,
            write_options,
        })
    }

    pub fn codec(&self) -> SpillCodec {
        self.codec
    }

    pub fn encode_record_batch(&self, batch: &RecordBatch) -> SortResult<EncodedMessage> {
        if has_dictionary(batch.schema().as_ref()) {
            return Err(SortError::internal(
                "dictionary-encoded columns are not supported in spill IPC",
            ));
        }

        let data_gen = IpcDataGenerator::default();
        let mut dictionary_tracker = DictionaryTracker::new(false);
        let mut compression_context = CompressionContext::default();
        let (encoded_dictionaries, encoded_message) = data_gen
            .encode(
                batch,
                &mut dictionary_tracker,
                &self.write_options,
                &mut compression_context,
            )
            .map_err(encode_err)?;

        if !encoded_dictionaries.is_empty() {
            return Err(SortError::internal(
                "dictionary batch messages are not supported in spill IPC",
            ));
        }

        let bytes = write_encoded_message(encoded_message, &self.write_options)?;
        let num_rows = u32::try_from(batch.num_rows())
            .map_err(|_| SortError::internal("record batch row count overflows u32"))?;
        Ok(EncodedMessage { bytes, num_rows })
    }

    pub fn decode_record_batch(
        &self,
        schema: SchemaRef,
        message: &[u8],
    ) -> SortResult<RecordBatch> {
        let metadata_len = ipc_metadata_len(message, IPC_ALIGNMENT)?;
        if metadata_len > message.len() {
            return Err(SortError::corrupt(
                "ipc message metadata length exceeds buffer size",
            ));
        }
        let body_len = message.len() - metadata_len;
        let block = Block::new(0, metadata_len as i32, body_len as i64);
        let buffer = Buffer::from(message.to_vec());
        let decoder = FileDecoder::new(schema, MetadataVersion::V5);
        decoder
            .read_record_batch(&block, &buffer)
            .map_err(decode_err)?
            .ok_or_else(|| SortError::corrupt("ipc message did not contain a record batch"))
    }
}

pub fn schema_hash(schema: &Schema) -> u64 {
    fn fnv1a(bytes: &[u8]) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    fnv1a(schema.to_string().as_bytes())
}

fn build_ipc_write_options(codec: SpillCodec) -> SortResult<IpcWriteOptions> {
    let options =
        IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5).map_err(encode_err)?;
    match codec {
        SpillCodec::None => Ok(options),
        SpillCodec::Lz4 => options
            .try_with_compression(Some(CompressionType::LZ4_FRAME))
            .map_err(encode_err),
        SpillCodec::Zstd => options
            .try_with_compression(Some(CompressionType::ZSTD))
            .map_err(encode_err),
    }
}

fn write_encoded_message(encoded: EncodedData, options: &IpcWriteOptions) -> SortResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let (meta, body) = write_message(&mut buffer, encoded, options).map_err(encode_err)?;
    let total = meta + body;
    if buffer.len() != total {
        return Err(SortError::internal(format!(
            "ipc encoded message length mismatch: expected {total} bytes, got {}",
            buffer.len()
        )));
    }
    Ok(buffer)
}

fn ipc_metadata_len(message: &[u8], alignment: usize) -> SortResult<usize> {
    if message.len() < 4 {
        return Err(SortError::corrupt(
            "ipc message is too small to contain a header",
        ));
    }
    let (prefix_size, meta_len) = if message.len() >= 8 && message[..4] == CONTINUATION_MARKER {
        (8usize, i32::from_le_bytes(message[4..8].try_into().unwrap()))
    } else {
        (4usize, i32::from_le_bytes(message[..4].try_into().unwrap()))
    };
    if meta_len < 0 {
        return Err(SortError::corrupt(
            "ipc message has negative metadata length",
        ));
    }
    let raw = prefix_size
        .checked_add(meta_len as usize)
        .ok_or_else(|| SortError::corrupt("ipc metadata length overflow"))?;
    Ok(align_up(raw, alignment))
}

fn align_up(value: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (value + mask) & !mask
}

fn has_dictionary(schema: &Schema) -> bool {
    schema
        .fields()
        .iter()
        .any(|field| data_type_has_dictionary(field.data_type()))
}

fn data_type_has_dictionary(data_type: &DataType) -> bool {
    match data_type {
        DataType::Dictionary(_, _) => true,
        DataType::List(field) | DataType::LargeList(field) | DataType::FixedSizeList(field, _) => {
            data_type_has_dictionary(field.data_type())
        }
        DataType::Struct(fields) => fields
            .iter()
            .any(|field| data_type_has_dictionary(field.data_type())),
        DataType::Map(field, _) => data_type_has_dictionary(field.data_type()),
        DataType::Union(fields, _) => fields
            .iter()
            .any(|(_, field)| data_type_has_dictionary(field.data_type())),
        DataType::RunEndEncoded(_, values) => data_type_has_dictionary(values.data_type()),
        _ => false,
    }
}

fn encode_err(err: ArrowError) -> SortError {
    SortError::internal(format!("arrow ipc encode error: {err}"))
}

fn decode_err(err: ArrowError) -> SortError {
    SortError::corrupt(format!("arrow ipc decode error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::Field;
    use std::sync::Arc;

    #[test]
    fn message_roundtrip() {
        let schema = SchemaRef::new(Schema::new(vec![Field::new("c1", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int32Array::from(vec![Some(3), None, Some(1)]))],
        )
        .unwrap();
        let serde = IpcSerde::new(SpillCodec::None).unwrap();
        let encoded = serde.encode_record_batch(&batch).unwrap();
        assert_eq!(encoded.num_rows, 3);
        let decoded = serde.decode_record_batch(schema, &encoded.bytes).unwrap();
        assert_eq!(decoded.num_rows(), 3);
        assert_eq!(decoded.column(0).as_ref(), batch.column(0).as_ref());
    }

    #[test]
    fn truncated_message_is_corrupt() {
        let err = IpcSerde::new(SpillCodec::None)
            .unwrap()
            .decode_record_batch(
                SchemaRef::new(Schema::new(vec![Field::new("c1", DataType::Int32, true)])),
                &[0u8, 1],
            )
            .unwrap_err();
        assert!(matches!(err, SortError::CorruptChunk(_)));
    }

    #[test]
    fn codec_parse_accepts_known_names() {
        assert_eq!(SpillCodec::parse("LZ4").unwrap(), SpillCodec::Lz4);
        assert_eq!(SpillCodec::parse(" zstd ").unwrap(), SpillCodec::Zstd);
        assert!(SpillCodec::parse("snappy").is_err());
    }
}
