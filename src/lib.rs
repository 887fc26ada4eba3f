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
//! Spillable external sort for columnar query execution.
//!
//! The crate hosts the memory-bounded ORDER BY core of a query engine: a
//! sorted row container that accumulates Arrow chunks, spills sorted runs to
//! temporary storage when memory pressure demands it, and merges all runs
//! back into one globally sorted stream. The surrounding engine (planner,
//! operator scheduling, sessions) injects trackers, configuration, and the
//! spill I/O pool; nothing here owns process-global state.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::config as spillsort_config;
pub use common::logging as spillsort_logging;

pub use common::config::OomAction;
pub use common::util::format_bytes;
pub use exec::chunk::Chunk;
pub use exec::error::{SortError, SortResult};
pub use exec::sort::{
    MergeReader, SortContainerOptions, SortExpression, SortKeyComparator,
    SpillableSortedRowContainer,
};
pub use exec::spill::ipc_serde::SpillCodec;
pub use exec::spill::{ForceSpillPolicy, QuotaSpillPolicy, SpillIoExecutor, SpillPolicy};
pub use runtime::cancel::CancelFlag;
pub use runtime::mem_tracker::MemTracker;
