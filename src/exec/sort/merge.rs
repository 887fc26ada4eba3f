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
//! K-way merge of sorted runs into one globally sorted chunk stream.
//!
//! Each run contributes at most one chunk of lookahead at a time, so the
//! merge phase holds O(k * chunk) memory no matter how large the spilled
//! data is. Memory-resident and spilled runs merge through the same heap;
//! the reader cannot tell them apart from the output.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::compute::interleave;
use arrow::datatypes::SchemaRef;
use arrow::row::{OwnedRow, Rows};

use crate::exec::chunk::Chunk;
use crate::exec::error::{SortError, SortResult};
use crate::exec::sort::comparator::SortKeyComparator;
use crate::exec::spill::SpillFile;
use crate::exec::spill::spill_stream::SpillStream;
use crate::runtime::cancel::CancelFlag;
use crate::runtime::mem_tracker::MemTracker;

/// One merge input: either a memory-resident run or a spilled run streamed
/// back one chunk at a time.
enum SourceCursor {
    Memory {
        chunk: Chunk,
        keys: Rows,
        pos: usize,
    },
    Spilled {
        // Held so the backing file outlives the stream; dropping it deletes
        // the file and releases the disk tracker.
        _file: SpillFile,
        stream: SpillStream,
        chunk: Chunk,
        keys: Rows,
        pos: usize,
    },
    Exhausted,
}

impl SourceCursor {
    fn current(&self) -> Option<(&Chunk, &Rows, usize)> {
        match self {
            SourceCursor::Memory { chunk, keys, pos } => Some((chunk, keys, *pos)),
            SourceCursor::Spilled {
                chunk, keys, pos, ..
            } => Some((chunk, keys, *pos)),
            SourceCursor::Exhausted => None,
        }
    }
}

/// Heap entry ordered by encoded sort key, with the source index as an
/// arbitrary but deterministic tie-break for equal keys.
struct HeapEntry {
    key: OwnedRow,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .row()
            .cmp(&other.key.row())
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Single-pass reader over the merged output of all sorted runs.
///
/// Restored spill chunks are attributed to the memory tracker while they sit
/// in the lookahead window, so merge-phase memory shows up in the same
/// accounting as the build phase.
pub struct MergeReader {
    schema: SchemaRef,
    comparator: Arc<SortKeyComparator>,
    sources: Vec<SourceCursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    batch_rows: usize,
    mem_tracker: Arc<MemTracker>,
    cancel: CancelFlag,
}

impl fmt::Debug for MergeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeReader")
            .field("schema", &self.schema)
            .field("sources", &self.sources.len())
            .field("batch_rows", &self.batch_rows)
            .finish_non_exhaustive()
    }
}

impl MergeReader {
    pub(crate) fn try_new(
        schema: SchemaRef,
        comparator: Arc<SortKeyComparator>,
        resident_run: Option<Chunk>,
        spilled_runs: Vec<SpillFile>,
        batch_rows: usize,
        mem_tracker: Arc<MemTracker>,
        cancel: CancelFlag,
    ) -> SortResult<Self> {
        if batch_rows == 0 {
            return Err(SortError::internal("merge batch_rows must be positive"));
        }
        let mut sources = Vec::new();
        if let Some(chunk) = resident_run {
            if !chunk.is_empty() {
                let keys = comparator.key_rows(&chunk.batch)?;
                sources.push(SourceCursor::Memory {
                    chunk,
                    keys,
                    pos: 0,
                });
            }
        }
        for file in spilled_runs {
            let mut stream = SpillStream::open(file.path(), schema.clone())?;
            match next_restored_chunk(&mut stream, &mem_tracker)? {
                Some(chunk) => {
                    let keys = comparator.key_rows(&chunk.batch)?;
                    sources.push(SourceCursor::Spilled {
                        _file: file,
                        stream,
                        chunk,
                        keys,
                        pos: 0,
                    });
                }
                // An empty run never spills, but tolerate the file.
                None => drop(file),
            }
        }

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, cursor) in sources.iter().enumerate() {
            if let Some((_, keys, pos)) = cursor.current() {
                heap.push(Reverse(HeapEntry {
                    key: keys.row(pos).owned(),
                    source,
                }));
            }
        }

        Ok(Self {
            schema,
            comparator,
            sources,
            heap,
            batch_rows,
            mem_tracker,
            cancel,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }

    /// Produce the next merged chunk of at most `batch_rows` rows, or `None`
    /// once every run is drained.
    pub fn next_chunk(&mut self) -> SortResult<Option<Chunk>> {
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        if self.heap.is_empty() {
            return Ok(None);
        }

        // Batches referenced by this output chunk, pinned for interleave.
        let mut pinned: Vec<RecordBatch> = Vec::new();
        let mut pin_of_source: Vec<Option<usize>> = vec![None; self.sources.len()];
        let mut indices: Vec<(usize, usize)> = Vec::with_capacity(self.batch_rows);

        while indices.len() < self.batch_rows {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let source = entry.source;
            let (chunk, _, pos) = self.sources[source]
                .current()
                .ok_or_else(|| SortError::internal("heap entry for exhausted merge source"))?;
            let pin = match pin_of_source[source] {
                Some(pin) => pin,
                None => {
                    pinned.push(chunk.batch.clone());
                    let pin = pinned.len() - 1;
                    pin_of_source[source] = Some(pin);
                    pin
                }
            };
            indices.push((pin, pos));
            self.advance(source, &mut pin_of_source)?;
        }

        let chunk = build_output(&self.schema, &pinned, &indices)?;
        Ok(Some(chunk))
    }

    /// Step `source` past its current row, refilling the lookahead chunk from
    /// disk when a spilled run crosses a chunk boundary, then push its new
    /// head key onto the heap.
    fn advance(&mut self, source: usize, pin_of_source: &mut [Option<usize>]) -> SortResult<()> {
        let exhausted = match &mut self.sources[source] {
            SourceCursor::Memory { chunk, pos, .. } => {
                *pos += 1;
                *pos >= chunk.len()
            }
            SourceCursor::Spilled {
                stream, chunk, keys, pos, ..
            } => {
                *pos += 1;
                if *pos >= chunk.len() {
                    match next_restored_chunk(stream, &self.mem_tracker)? {
                        Some(next) => {
                            *keys = self.comparator.key_rows(&next.batch)?;
                            *chunk = next;
                            *pos = 0;
                            // Force re-pinning of the fresh batch.
                            pin_of_source[source] = None;
                            false
                        }
                        None => true,
                    }
                } else {
                    false
                }
            }
            SourceCursor::Exhausted => {
                return Err(SortError::internal("advance on exhausted merge source"));
            }
        };
        if exhausted {
            // Dropping the cursor releases its chunk accounting and, for a
            // spilled source, the backing file.
            self.sources[source] = SourceCursor::Exhausted;
        }
        if let Some((_, keys, pos)) = self.sources[source].current() {
            self.heap.push(Reverse(HeapEntry {
                key: keys.row(pos).owned(),
                source,
            }));
        }
        Ok(())
    }
}

fn next_restored_chunk(
    stream: &mut SpillStream,
    mem_tracker: &Arc<MemTracker>,
) -> SortResult<Option<Chunk>> {
    loop {
        match stream.next_batch()? {
            Some(batch) if batch.num_rows() == 0 => continue,
            Some(batch) => {
                let mut chunk = Chunk::new(batch);
                chunk.transfer_to(mem_tracker);
                return Ok(Some(chunk));
            }
            None => return Ok(None),
        }
    }
}

fn build_output(
    schema: &SchemaRef,
    pinned: &[RecordBatch],
    indices: &[(usize, usize)],
) -> SortResult<Chunk> {
    let num_columns = schema.fields().len();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(num_columns);
    for col in 0..num_columns {
        let arrays: Vec<&dyn arrow::array::Array> = pinned
            .iter()
            .map(|batch| batch.column(col).as_ref())
            .collect();
        let merged = interleave(&arrays, indices)
            .map_err(|e| SortError::internal(format!("interleave merged column failed: {e}")))?;
        columns.push(merged);
    }
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| SortError::internal(format!("build merged chunk failed: {e}")))?;
    Ok(Chunk::new(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    use crate::exec::sort::comparator::SortExpression;
    use crate::exec::spill::Spiller;
    use crate::exec::spill::dir_manager::DirManager;
    use crate::exec::spill::ipc_serde::SpillCodec;

    fn int_schema() -> SchemaRef {
        SchemaRef::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]))
    }

    fn int_chunk(schema: &SchemaRef, values: Vec<i32>) -> Chunk {
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(values))])
                .unwrap();
        Chunk::new(batch)
    }

    fn collect_values(reader: &mut MergeReader) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            let col = chunk
                .batch
                .column(0)
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap();
            out.extend(col.iter().map(|v| v.unwrap()));
        }
        out
    }

    fn comparator(schema: &SchemaRef) -> Arc<SortKeyComparator> {
        Arc::new(SortKeyComparator::try_new(schema, vec![SortExpression::asc(0)]).unwrap())
    }

    #[test]
    fn merges_memory_and_spilled_runs() {
        let temp = tempdir().unwrap();
        let schema = int_schema();
        let disk = MemTracker::new_root("disk");
        let mem = MemTracker::new_root("mem");
        let spiller = Spiller::try_new(
            DirManager::new(temp.path().to_path_buf()).unwrap(),
            Arc::clone(&disk),
            SpillCodec::None,
            2,
        )
        .unwrap();

        let spilled_a = spiller
            .spill_run(
                schema.clone(),
                &int_chunk(&schema, vec![1, 4, 7, 10]),
                &CancelFlag::new(),
            )
            .unwrap();
        let spilled_b = spiller
            .spill_run(
                schema.clone(),
                &int_chunk(&schema, vec![2, 5, 8]),
                &CancelFlag::new(),
            )
            .unwrap();
        let resident = int_chunk(&schema, vec![3, 6, 9]);

        let mut reader = MergeReader::try_new(
            schema.clone(),
            comparator(&schema),
            Some(resident),
            vec![spilled_a, spilled_b],
            4,
            Arc::clone(&mem),
            CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(
            collect_values(&mut reader),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
        assert!(reader.is_exhausted());
        assert!(mem.peak() > 0, "restored chunks must be accounted");
        drop(reader);
        assert_eq!(mem.current(), 0);
        assert_eq!(disk.current(), 0, "spill files released with the reader");
    }

    #[test]
    fn duplicate_keys_across_runs_all_survive() {
        let schema = int_schema();
        let mem = MemTracker::new_root("mem");
        let mut reader = MergeReader::try_new(
            schema.clone(),
            comparator(&schema),
            Some(int_chunk(&schema, vec![1, 1, 2])),
            Vec::new(),
            2,
            mem,
            CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(collect_values(&mut reader), vec![1, 1, 2]);
    }

    #[test]
    fn empty_input_yields_none() {
        let schema = int_schema();
        let mem = MemTracker::new_root("mem");
        let mut reader = MergeReader::try_new(
            schema.clone(),
            comparator(&schema),
            None,
            Vec::new(),
            4,
            mem,
            CancelFlag::new(),
        )
        .unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.is_exhausted());
    }

    #[test]
    fn cancellation_stops_iteration() {
        let schema = int_schema();
        let mem = MemTracker::new_root("mem");
        let cancel = CancelFlag::new();
        let mut reader = MergeReader::try_new(
            schema.clone(),
            comparator(&schema),
            Some(int_chunk(&schema, vec![1, 2, 3])),
            Vec::new(),
            2,
            mem,
            cancel.clone(),
        )
        .unwrap();
        assert!(reader.next_chunk().unwrap().is_some());
        cancel.cancel();
        assert!(reader.next_chunk().unwrap_err().is_cancelled());
    }
}
