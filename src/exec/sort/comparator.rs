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
//! Sort-key derivation and the single comparator shared by every phase.
//!
//! The comparator is built once per container from the ORDER BY
//! specification and reused for the in-memory sort, spill-file ordering,
//! and merge-phase comparisons, so all three phases agree on one total
//! order. Keys are projected through Arrow's row format, whose byte
//! encoding already folds in direction and NULL placement per column.

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{SortOptions, take};
use arrow::datatypes::SchemaRef;
use arrow::row::{RowConverter, Rows, SortField};

use crate::exec::error::{SortError, SortResult};

/// One ORDER BY key: column index, direction, and NULL placement.
///
/// Text keys compare by Arrow's binary UTF-8 order; locale collation is the
/// caller's concern (normalize upstream if needed).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortExpression {
    pub column: usize,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortExpression {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            asc: true,
            nulls_first: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            asc: false,
            nulls_first: true,
        }
    }

    pub fn with_nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }

    fn sort_options(&self) -> SortOptions {
        SortOptions {
            descending: !self.asc,
            nulls_first: self.nulls_first,
        }
    }
}

/// Key projection plus total-order comparator for one ordering spec.
///
/// Rows whose key columns are all equal have no defined relative order;
/// callers needing determinism must make the key specification an exhaustive
/// tie-break themselves.
#[derive(Debug)]
pub struct SortKeyComparator {
    exprs: Vec<SortExpression>,
    converter: RowConverter,
}

impl SortKeyComparator {
    pub fn try_new(schema: &SchemaRef, exprs: Vec<SortExpression>) -> SortResult<Self> {
        if exprs.is_empty() {
            return Err(SortError::internal("sort key specification is empty"));
        }
        let mut fields = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            let field = schema.fields().get(expr.column).ok_or_else(|| {
                SortError::internal(format!(
                    "sort key column {} out of range (schema has {} columns)",
                    expr.column,
                    schema.fields().len()
                ))
            })?;
            fields.push(SortField::new_with_options(
                field.data_type().clone(),
                expr.sort_options(),
            ));
        }
        let converter = RowConverter::new(fields)
            .map_err(|e| SortError::internal(format!("build sort key converter failed: {e}")))?;
        Ok(Self { exprs, converter })
    }

    pub fn exprs(&self) -> &[SortExpression] {
        &self.exprs
    }

    /// Project the key columns of `batch` into comparable rows.
    pub fn key_rows(&self, batch: &RecordBatch) -> SortResult<Rows> {
        let columns: Vec<ArrayRef> = self
            .exprs
            .iter()
            .map(|expr| Arc::clone(batch.column(expr.column)))
            .collect();
        self.converter
            .convert_columns(&columns)
            .map_err(|e| SortError::internal(format!("convert sort key columns failed: {e}")))
    }

    /// Indices that order `batch` non-decreasingly under this comparator.
    /// The sort is unstable.
    pub fn sorted_indices(&self, batch: &RecordBatch) -> SortResult<UInt32Array> {
        let rows = self.key_rows(batch)?;
        let mut indices: Vec<u32> = (0..batch.num_rows() as u32).collect();
        indices.sort_unstable_by(|&a, &b| rows.row(a as usize).cmp(&rows.row(b as usize)));
        Ok(UInt32Array::from(indices))
    }

    /// Materialize `batch` in sorted order.
    pub fn sort_batch(&self, batch: &RecordBatch) -> SortResult<RecordBatch> {
        if batch.num_rows() <= 1 {
            return Ok(batch.clone());
        }
        let indices = self.sorted_indices(batch)?;
        let columns = batch
            .columns()
            .iter()
            .map(|column| take(column.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SortError::internal(format!("reorder sorted batch failed: {e}")))?;
        RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| SortError::internal(format!("rebuild sorted batch failed: {e}")))
    }
}
