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
use std::path::Path;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::exec::error::{SortError, SortResult};
use crate::exec::spill::block_manager::{
    MessageIndexEntry, RunHeader, read_run_header, read_run_index,
};
use crate::exec::spill::ipc_serde::{IpcSerde, schema_hash};

/// Sequential reader over one spill file, decoding one chunk per call.
#[derive(Debug)]
pub struct SpillStream {
    file: File,
    schema: SchemaRef,
    index: Vec<MessageIndexEntry>,
    position: usize,
    ipc: IpcSerde,
}

impl SpillStream {
    pub fn open(path: impl AsRef<Path>, schema: SchemaRef) -> SortResult<Self> {
        let mut file = File::open(path.as_ref()).map_err(|e| {
            SortError::io(
                format!("open spill file {} failed", path.as_ref().display()),
                e,
            )
        })?;
        let header = read_run_header(&mut file)?;
        let index = read_run_index(&mut file, &header)?;
        validate_schema_hash(&header, schema.as_ref())?;
        let ipc = IpcSerde::new(header.codec)?;
        Ok(Self {
            file,
            schema,
            index,
            position: 0,
            ipc,
        })
    }

    pub fn next_batch(&mut self) -> SortResult<Option<RecordBatch>> {
        if self.position >= self.index.len() {
            return Ok(None);
        }
        let entry = &self.index[self.position];
        self.position += 1;
        let mut buf = vec![0u8; entry.length as usize];
        self.file
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| SortError::io("seek spill message failed", e))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|e| SortError::io("read spill message failed", e))?;
        let batch = self.ipc.decode_record_batch(self.schema.clone(), &buf)?;
        if batch.num_rows() != entry.num_rows as usize {
            return Err(SortError::corrupt(format!(
                "spill message row count mismatch: index={} decoded={}",
                entry.num_rows,
                batch.num_rows()
            )));
        }
        Ok(Some(batch))
    }
}

fn validate_schema_hash(header: &RunHeader, schema: &arrow::datatypes::Schema) -> SortResult<()> {
    if header.schema_hash != schema_hash(schema) {
        return Err(SortError::corrupt("spill schema hash mismatch"));
    }
    Ok(())
}
