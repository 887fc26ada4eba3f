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
//! Writes sorted runs to spill files and opens them for merge-phase reads.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::{SortError, SortResult};
use crate::exec::spill::block_manager::{
    BlockManager, MessageIndexEntry, RUN_HEADER_LEN, RunHeader, RunMeta, write_run_header,
    write_run_index,
};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::{EncodedMessage, IpcSerde, SpillCodec, schema_hash};
use crate::runtime::cancel::CancelFlag;
use crate::runtime::mem_tracker::MemTracker;
use crate::spillsort_logging::warn;

/// One spilled sorted run on temporary storage.
///
/// The file is deleted and the disk tracker released when the value drops,
/// so every lifecycle path (normal drain, close, cancellation, error unwind)
/// cleans up without explicit bookkeeping.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    meta: RunMeta,
    bytes: i64,
    disk_tracker: Arc<MemTracker>,
}

impl SpillFile {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                "remove spill file failed: path={} error={}",
                self.path.display(),
                err
            );
        }
        self.disk_tracker.release(self.bytes);
    }
}

/// Serializes sorted runs into the private spill block format.
#[derive(Debug)]
pub struct Spiller {
    block_manager: Arc<BlockManager>,
    ipc: IpcSerde,
    disk_tracker: Arc<MemTracker>,
    max_message_rows: usize,
}

impl Spiller {
    pub fn try_new(
        dir_manager: DirManager,
        disk_tracker: Arc<MemTracker>,
        codec: SpillCodec,
        max_message_rows: usize,
    ) -> SortResult<Self> {
        if max_message_rows == 0 {
            return Err(SortError::internal("max_chunk_rows must be positive"));
        }
        Ok(Self {
            block_manager: BlockManager::new(dir_manager),
            ipc: IpcSerde::new(codec)?,
            disk_tracker,
            max_message_rows,
        })
    }

    /// Write one sorted run to a fresh spill file. The run is sliced into
    /// messages of at most `max_message_rows` rows, which bounds the decode
    /// granularity of the merge phase.
    ///
    /// Cancellation is observed between messages; a cancelled write deletes
    /// its partial file before returning.
    pub fn spill_run(
        &self,
        schema: SchemaRef,
        run: &Chunk,
        cancel: &CancelFlag,
    ) -> SortResult<SpillFile> {
        let (path, mut file) = self.block_manager.create_run_file()?;
        match self.write_run(&mut file, schema, run, cancel) {
            Ok((meta, bytes)) => {
                self.disk_tracker.consume(bytes);
                Ok(SpillFile {
                    path,
                    meta,
                    bytes,
                    disk_tracker: Arc::clone(&self.disk_tracker),
                })
            }
            Err(err) => {
                drop(file);
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    warn!(
                        "remove partial spill file failed: path={} error={}",
                        path.display(),
                        remove_err
                    );
                }
                Err(err)
            }
        }
    }

    fn write_run(
        &self,
        file: &mut File,
        schema: SchemaRef,
        run: &Chunk,
        cancel: &CancelFlag,
    ) -> SortResult<(RunMeta, i64)> {
        let mut header = RunHeader::new(self.ipc.codec(), schema_hash(schema.as_ref()));
        write_run_header(file, &header)?;

        let mut index = Vec::new();
        let total_rows = run.len();
        let mut offset_rows = 0usize;
        while offset_rows < total_rows {
            if cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            let length = self.max_message_rows.min(total_rows - offset_rows);
            let message = run.slice(offset_rows, length);
            let encoded = self.ipc.encode_record_batch(&message.batch)?;
            index.push(append_message(file, &encoded)?);
            offset_rows += length;
        }

        let index_offset = file
            .stream_position()
            .map_err(|e| SortError::io("seek spill index offset failed", e))?;
        write_run_index(file, &index)?;
        header.num_messages = index.len() as u32;
        header.index_offset = index_offset;
        header.index_length =
            (index.len() * super::block_manager::MESSAGE_INDEX_ENTRY_LEN) as u64;

        file.seek(SeekFrom::Start(0))
            .map_err(|e| SortError::io("seek spill header failed", e))?;
        write_run_header(file, &header)?;
        file.flush()
            .map_err(|e| SortError::io("flush spill file failed", e))?;

        let total_bytes = header
            .index_offset
            .checked_add(header.index_length)
            .unwrap_or(u64::MAX);
        let total_bytes = i64::try_from(total_bytes.max(RUN_HEADER_LEN as u64)).unwrap_or(i64::MAX);
        Ok((RunMeta { header, index }, total_bytes))
    }
}

fn append_message(file: &mut File, encoded: &EncodedMessage) -> SortResult<MessageIndexEntry> {
    let offset = file
        .stream_position()
        .map_err(|e| SortError::io("seek spill message offset failed", e))?;
    file.write_all(&encoded.bytes)
        .map_err(|e| SortError::io("write spill message failed", e))?;
    Ok(MessageIndexEntry {
        offset,
        length: encoded.bytes.len() as u64,
        num_rows: encoded.num_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use tempfile::tempdir;

    use crate::exec::spill::spill_stream::SpillStream;

    fn int_chunk(schema: &SchemaRef, values: Vec<i32>) -> Chunk {
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(values))])
                .unwrap();
        Chunk::new(batch)
    }

    fn test_spiller(dir: std::path::PathBuf, tracker: &Arc<MemTracker>) -> Spiller {
        Spiller::try_new(
            DirManager::new(dir).unwrap(),
            Arc::clone(tracker),
            SpillCodec::None,
            2,
        )
        .unwrap()
    }

    #[test]
    fn spill_roundtrip_and_disk_accounting() {
        let temp = tempdir().unwrap();
        let disk = MemTracker::new_root("disk");
        let spiller = test_spiller(temp.path().to_path_buf(), &disk);
        let schema = SchemaRef::new(Schema::new(vec![Field::new("c1", DataType::Int32, false)]));
        let run = int_chunk(&schema, vec![1, 2, 3, 4, 5]);

        let file = spiller
            .spill_run(schema.clone(), &run, &CancelFlag::new())
            .unwrap();
        assert!(disk.current() > 0);
        // 5 rows, 2 per message.
        assert_eq!(file.meta().header.num_messages, 3);

        let mut stream = SpillStream::open(file.path(), schema).unwrap();
        let mut restored = Vec::new();
        while let Some(batch) = stream.next_batch().unwrap() {
            restored.push(batch.num_rows());
        }
        assert_eq!(restored, vec![2, 2, 1]);

        let path = file.path().clone();
        assert!(path.exists());
        drop(stream);
        drop(file);
        assert!(!path.exists());
        assert_eq!(disk.current(), 0);
        assert!(disk.peak() > 0);
    }

    #[test]
    fn cancelled_spill_deletes_partial_file() {
        let temp = tempdir().unwrap();
        let disk = MemTracker::new_root("disk");
        let spiller = test_spiller(temp.path().to_path_buf(), &disk);
        let schema = SchemaRef::new(Schema::new(vec![Field::new("c1", DataType::Int32, false)]));
        let run = int_chunk(&schema, vec![1, 2, 3]);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = spiller.spill_run(schema, &run, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(disk.current(), 0);
        let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "partial file left behind");
    }
}
