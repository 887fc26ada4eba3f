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
//! The spillable sorted row container.
//!
//! Lifecycle: append chunks while open, seal once, iterate the merged output
//! once, close. Appended chunks accumulate in the current partition; when the
//! spill policy fires the partition is sorted into a run and written to
//! temporary storage in the background, freeing its memory. Sealing sorts
//! the tail partition and hands everything to the merge phase.

use std::sync::Arc;
use std::sync::mpsc;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;

use crate::common::config::OomAction;
use crate::common::util::format_bytes;
use crate::exec::chunk::Chunk;
use crate::exec::error::{SortError, SortResult};
use crate::exec::sort::comparator::{SortExpression, SortKeyComparator};
use crate::exec::sort::merge::MergeReader;
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;
use crate::exec::spill::{SpillFile, SpillIoExecutor, SpillPolicy, Spiller};
use crate::runtime::cancel::CancelFlag;
use crate::runtime::mem_tracker::MemTracker;
use crate::spillsort_logging::{debug, warn};

/// Knobs for one container instance. Engines derive these from session
/// configuration; tests construct them directly.
#[derive(Debug, Clone)]
pub struct SortContainerOptions {
    pub label: String,
    pub sort_exprs: Vec<SortExpression>,
    /// Hard memory quota in bytes. 0 means unlimited.
    pub memory_quota_bytes: u64,
    pub oom_action: OomAction,
    /// Row granularity of spill messages and merged output chunks.
    pub max_chunk_rows: usize,
    /// Largest final run kept memory-resident at seal. 0 derives the limit
    /// from the quota; with no quota the final run always stays resident.
    pub max_resident_bytes: u64,
    pub spill_dir: std::path::PathBuf,
    pub codec: SpillCodec,
}

enum RunState {
    /// Accepting appends.
    Open,
    /// Sorted runs are fixed; iteration not yet started.
    Sealed { resident_run: Option<Chunk> },
    /// The single merged iteration was handed out.
    Iterated,
    Closed,
}

/// Sorted row container with transparent disk spill.
///
/// Not internally synchronized: one thread drives the lifecycle. The
/// exception is [`cancel_flag`](Self::cancel_flag), whose clone may be
/// fired from any thread to abort in-flight work.
pub struct SpillableSortedRowContainer {
    schema: SchemaRef,
    options: SortContainerOptions,
    comparator: Arc<SortKeyComparator>,
    mem_tracker: Arc<MemTracker>,
    disk_tracker: Arc<MemTracker>,
    spiller: Arc<Spiller>,
    spill_policy: Arc<dyn SpillPolicy>,
    io_pool: Option<Arc<SpillIoExecutor>>,
    cancel: CancelFlag,
    state: RunState,
    partition: Vec<Chunk>,
    partition_rows: usize,
    total_rows: usize,
    spill_generation: u64,
    spilled_runs: Vec<SpillFile>,
    pending_spill: Option<mpsc::Receiver<SortResult<SpillFile>>>,
}

impl SpillableSortedRowContainer {
    pub fn try_new(
        schema: SchemaRef,
        options: SortContainerOptions,
        mem_tracker: Arc<MemTracker>,
        disk_tracker: Arc<MemTracker>,
        spill_policy: Arc<dyn SpillPolicy>,
        io_pool: Option<Arc<SpillIoExecutor>>,
    ) -> SortResult<Self> {
        let comparator = Arc::new(SortKeyComparator::try_new(
            &schema,
            options.sort_exprs.clone(),
        )?);
        let spiller = Arc::new(Spiller::try_new(
            DirManager::new(options.spill_dir.clone())?,
            Arc::clone(&disk_tracker),
            options.codec,
            options.max_chunk_rows,
        )?);
        Ok(Self {
            schema,
            options,
            comparator,
            mem_tracker,
            disk_tracker,
            spiller,
            spill_policy,
            io_pool,
            cancel: CancelFlag::new(),
            state: RunState::Open,
            partition: Vec::new(),
            partition_rows: 0,
            total_rows: 0,
            spill_generation: 0,
            spilled_runs: Vec::new(),
            pending_spill: None,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn disk_tracker(&self) -> &Arc<MemTracker> {
        &self.disk_tracker
    }

    pub fn num_rows(&self) -> usize {
        self.total_rows
    }

    /// Whether any run has gone to disk (including one still being written).
    pub fn has_spilled(&self) -> bool {
        !self.spilled_runs.is_empty() || self.pending_spill.is_some()
    }

    /// Number of spills triggered so far, counting one still in flight.
    pub fn spill_generation(&self) -> u64 {
        self.spill_generation
    }

    /// Bytes currently attributed to the memory tracker.
    pub fn memory_usage(&self) -> i64 {
        self.mem_tracker.current()
    }

    /// Bytes of live spill files attributed to the disk tracker.
    pub fn disk_usage(&self) -> i64 {
        self.disk_tracker.current()
    }

    /// Sticky cancellation flag. Clone it to cancel the container from
    /// another thread; every subsequent operation fails with `Cancelled`.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Append one chunk. May trigger a background spill of the accumulated
    /// partition on the way out.
    pub fn append(&mut self, mut chunk: Chunk) -> SortResult<()> {
        match self.state {
            RunState::Open => {}
            RunState::Closed => return Err(SortError::internal("container is closed")),
            _ => return Err(SortError::Sealed),
        }
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        if chunk.schema() != self.schema {
            return Err(SortError::internal(
                "appended chunk schema differs from container schema",
            ));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        chunk.transfer_to(&self.mem_tracker);
        self.partition_rows += chunk.len();
        self.total_rows += chunk.len();
        self.partition.push(chunk);

        if self
            .spill_policy
            .should_spill(self.partition_rows as i64, &self.mem_tracker)
        {
            self.spill_partition()?;
        }
        self.enforce_quota()
    }

    /// Freeze the run set. Appends are rejected afterwards; the merged output
    /// becomes available through [`sorted_iter`](Self::sorted_iter).
    pub fn seal(&mut self) -> SortResult<()> {
        match self.state {
            RunState::Open => {}
            RunState::Closed => return Err(SortError::internal("container is closed")),
            _ => return Err(SortError::Sealed),
        }
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        self.wait_pending_spill()?;

        let mut resident_run = None;
        if !self.partition.is_empty() {
            let run = self.sort_partition()?;
            if self.run_exceeds_resident_limit(&run) {
                self.spill_generation += 1;
                let file =
                    self.spiller
                        .spill_run(self.schema.clone(), &run, &self.cancel)?;
                self.spilled_runs.push(file);
            } else {
                resident_run = Some(run);
            }
        }
        debug!(
            "sealed sorted container: label={} rows={} spilled_runs={} mem={} disk={}",
            self.options.label,
            self.total_rows,
            self.spilled_runs.len(),
            format_bytes(self.mem_tracker.current()),
            format_bytes(self.disk_tracker.current()),
        );
        self.state = RunState::Sealed { resident_run };
        self.enforce_quota()
    }

    /// Hand out the single merged iteration over all sorted runs.
    pub fn sorted_iter(&mut self) -> SortResult<MergeReader> {
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }
        match std::mem::replace(&mut self.state, RunState::Iterated) {
            RunState::Sealed { resident_run } => MergeReader::try_new(
                self.schema.clone(),
                Arc::clone(&self.comparator),
                resident_run,
                std::mem::take(&mut self.spilled_runs),
                self.options.max_chunk_rows,
                Arc::clone(&self.mem_tracker),
                self.cancel.clone(),
            ),
            RunState::Open => {
                self.state = RunState::Open;
                Err(SortError::NotSealed)
            }
            RunState::Iterated => Err(SortError::internal(
                "sorted iteration was already consumed",
            )),
            RunState::Closed => {
                self.state = RunState::Closed;
                Err(SortError::internal("container is closed"))
            }
        }
    }

    /// Release everything: cancel in-flight spill work, drop buffered chunks
    /// and spill files. Idempotent; called from `Drop` as well.
    pub fn close(&mut self) {
        if matches!(self.state, RunState::Closed) {
            return;
        }
        self.cancel.cancel();
        if let Some(rx) = self.pending_spill.take() {
            // The worker observes the cancel flag; whatever it still
            // produced is dropped here, deleting the file.
            let _ = rx.recv();
        }
        self.partition.clear();
        self.partition_rows = 0;
        self.spilled_runs.clear();
        self.state = RunState::Closed;
    }

    /// Sort the accumulated partition into one run chunk. Partition chunks
    /// are released; the run becomes the tracker's accounted holder.
    fn sort_partition(&mut self) -> SortResult<Chunk> {
        let batches: Vec<_> = self.partition.iter().map(|c| c.batch.clone()).collect();
        let combined = concat_batches(&self.schema, &batches)
            .map_err(|e| SortError::internal(format!("concatenate partition failed: {e}")))?;
        self.partition.clear();
        self.partition_rows = 0;
        let sorted = self.comparator.sort_batch(&combined)?;
        let mut run = Chunk::new(sorted);
        run.transfer_to(&self.mem_tracker);
        Ok(run)
    }

    /// Sort the current partition and ship it to disk, preferring the I/O
    /// pool and degrading to an inline write when the pool is saturated.
    fn spill_partition(&mut self) -> SortResult<()> {
        // At most one background spill per container keeps run order and
        // accounting simple; a second trigger waits the first one out.
        self.wait_pending_spill()?;
        let run = self.sort_partition()?;
        self.spill_generation += 1;
        debug!(
            "spilling sorted run: label={} generation={} rows={} bytes={}",
            self.options.label,
            self.spill_generation,
            run.len(),
            format_bytes(run.estimated_bytes() as i64),
        );

        let Some(pool) = self.io_pool.as_ref() else {
            let file = self
                .spiller
                .spill_run(self.schema.clone(), &run, &self.cancel)?;
            self.spilled_runs.push(file);
            return Ok(());
        };

        let (tx, rx) = mpsc::channel();
        let spiller = Arc::clone(&self.spiller);
        let schema = self.schema.clone();
        let cancel = self.cancel.clone();
        let task = Box::new(move || {
            let result = spiller.spill_run(schema, &run, &cancel);
            // Run drops here, releasing its memory right after the write.
            let _ = tx.send(result);
        });
        match pool.try_submit(task) {
            Ok(()) => {
                self.pending_spill = Some(rx);
                Ok(())
            }
            Err(task) => {
                task();
                match rx.recv() {
                    Ok(Ok(file)) => {
                        self.spilled_runs.push(file);
                        Ok(())
                    }
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(SortError::internal("inline spill produced no result")),
                }
            }
        }
    }

    fn wait_pending_spill(&mut self) -> SortResult<()> {
        let Some(rx) = self.pending_spill.take() else {
            return Ok(());
        };
        match rx.recv() {
            Ok(Ok(file)) => {
                self.spilled_runs.push(file);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SortError::internal("spill worker dropped its result")),
        }
    }

    fn run_exceeds_resident_limit(&self, run: &Chunk) -> bool {
        let limit = if self.options.max_resident_bytes > 0 {
            self.options.max_resident_bytes
        } else if self.options.memory_quota_bytes > 0 {
            self.options.memory_quota_bytes
        } else {
            return false;
        };
        run.estimated_bytes() as u64 > limit
    }

    /// Applied after spilling had its chance to relieve pressure. A quota
    /// still exceeded at this point means a single partition or merge window
    /// does not fit.
    fn enforce_quota(&mut self) -> SortResult<()> {
        let quota = self.options.memory_quota_bytes;
        if quota == 0 {
            return Ok(());
        }
        let consumed = self.mem_tracker.current();
        if consumed <= quota as i64 {
            return Ok(());
        }
        match self.options.oom_action {
            OomAction::Log => {
                warn!(
                    "memory quota exceeded: label={} consumed={} quota={}",
                    self.options.label,
                    format_bytes(consumed),
                    format_bytes(quota as i64),
                );
                Ok(())
            }
            OomAction::Cancel => {
                self.cancel.cancel();
                Err(SortError::ResourceExhausted {
                    consumed,
                    quota: quota as i64,
                })
            }
        }
    }
}

impl Drop for SpillableSortedRowContainer {
    fn drop(&mut self) {
        self.close();
    }
}
