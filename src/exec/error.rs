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
//! Error taxonomy for the spillable sort subsystem.
//!
//! Callers need to tell protocol misuse, resource exhaustion, I/O failure,
//! spill-file corruption, and user-initiated cancellation apart, so the
//! conditions are explicit variants rather than opaque strings.

use std::io;

use thiserror::Error;

pub type SortResult<T> = Result<T, SortError>;

#[derive(Debug, Error)]
pub enum SortError {
    /// Append was called after the container was sealed. Programmer error,
    /// never retried.
    #[error("sorted row container is sealed: no further appends are accepted")]
    Sealed,

    /// Sorted iteration was requested before the container was sealed.
    #[error("sorted row container is not sealed: seal() must precede iteration")]
    NotSealed,

    /// Memory could not be bounded by spilling and the configured OOM action
    /// is CANCEL.
    #[error("memory quota exceeded: consumed {consumed} bytes, quota {quota} bytes")]
    ResourceExhausted { consumed: i64, quota: i64 },

    /// Spill write or read failure. Fatal to the query; spill files for the
    /// container are cleaned up before this surfaces.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A spill file violated an internal invariant (bad header, truncated
    /// message, schema mismatch). Fatal; no partial recovery is attempted.
    #[error("corrupt spill chunk: {0}")]
    CorruptChunk(String),

    /// Cooperative cancellation observed during append, spill, or merge.
    #[error("sort was cancelled")]
    Cancelled,

    /// Invariant violation inside this subsystem.
    #[error("internal sort error: {0}")]
    Internal(String),
}

impl SortError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SortError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SortError::Internal(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        SortError::CorruptChunk(message.into())
    }

    /// Whether the condition stems from user-initiated cancellation rather
    /// than a genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SortError::Cancelled)
    }
}
