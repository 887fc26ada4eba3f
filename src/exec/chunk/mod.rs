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
//! Chunk: a fixed-schema batch of rows backed by an Arrow `RecordBatch`.
//!
//! The chunk is the unit of memory accounting and of spill I/O. Accounting
//! follows a "current holder" model: a chunk may carry an attachment binding
//! its estimated bytes to one tracker; `transfer_to` moves the attribution
//! and dropping the chunk releases it. Containers rely on this to leave their
//! trackers at exactly zero after close.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::SchemaRef;

use crate::runtime::mem_tracker::MemTracker;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    accounting: Option<Arc<ChunkAccounting>>,
}

impl Chunk {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            accounting: None,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    /// Estimated resident bytes of the backing buffers.
    pub fn estimated_bytes(&self) -> usize {
        record_batch_bytes(&self.batch)
    }

    /// Zero-copy slice. The slice carries no accounting of its own; the
    /// parent chunk remains the accounted holder of the shared buffers.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
            accounting: None,
        }
    }

    /// Attribute this chunk's estimated bytes to `tracker`, moving the
    /// attribution away from any previous holder.
    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return;
        }
        let bytes = i64::try_from(self.estimated_bytes()).unwrap_or(i64::MAX);
        if bytes <= 0 {
            return;
        }
        self.accounting = Some(Arc::new(ChunkAccounting::new(bytes, tracker)));
    }
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
///
/// Buffers are de-duplicated only within a single batch; buffers shared
/// across batches (slices, dictionaries) are counted once per batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    let mut total = 0usize;
    for column in batch.columns() {
        total = total.saturating_add(array_data_bytes(&column.to_data(), &mut seen));
    }
    total
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn new(bytes: i64, tracker: &Arc<MemTracker>) -> Self {
        tracker.consume(bytes);
        Self {
            bytes,
            tracker: Mutex::new(Arc::clone(tracker)),
        }
    }

    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.release(self.bytes);
        tracker.consume(self.bytes);
        *guard = Arc::clone(tracker);
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        let guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        guard.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn test_chunk(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch");
        Chunk::new(batch)
    }

    #[test]
    fn accounting_releases_on_drop() {
        let tracker = MemTracker::new_root("test");
        {
            let mut chunk = test_chunk(vec![1, 2, 3]);
            chunk.transfer_to(&tracker);
            assert!(tracker.current() > 0);
        }
        assert_eq!(tracker.current(), 0);
        assert!(tracker.peak() > 0);
    }

    #[test]
    fn transfer_moves_attribution() {
        let from = MemTracker::new_root("from");
        let to = MemTracker::new_root("to");
        let mut chunk = test_chunk(vec![1, 2, 3]);
        chunk.transfer_to(&from);
        let bytes = from.current();
        assert!(bytes > 0);
        chunk.transfer_to(&to);
        assert_eq!(from.current(), 0);
        assert_eq!(to.current(), bytes);
    }

    #[test]
    fn slices_are_unaccounted() {
        let tracker = MemTracker::new_root("test");
        let mut chunk = test_chunk(vec![1, 2, 3, 4]);
        chunk.transfer_to(&tracker);
        let before = tracker.current();
        let slice = chunk.slice(1, 2);
        assert_eq!(slice.len(), 2);
        assert_eq!(tracker.current(), before);
    }
}
