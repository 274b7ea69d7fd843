//! The `vector_agg` crate implements vectorised grouped aggregation over
//! decompressed columnar batches.
//!
//! Batches arrive from a scan as column views with validity bitmaps and an
//! optional qualification bitmap. The [`GroupingPolicyHash`] maps every
//! qualifying row to a dense key index through a [`HashingStrategy`] chosen
//! from the grouping columns, folds the aggregate arguments into per-key
//! state arrays and emits one row per group. [`VectorAggNode`] drives the
//! policy from a [`BatchSource`], spilling partial results when the hash
//! table grows too large.
//!
//! # Examples
//! ```
//! # use std::sync::Arc;
//! # use arrow::array::{ArrayRef, Int32Array, StringArray};
//! # use arrow::datatypes::DataType;
//! # use vector_agg::{AggregateDefinition, Datum, DecompressedBatch, GroupingColumn,
//! # VectorAggConfig, VectorAggNode};
//! # fn main() -> Result<(), vector_agg::VectorAggError> {
//! let keys: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "a"]));
//! let values: ArrayRef = Arc::new(Int32Array::from(vec![1, 2, 3]));
//! let batch = DecompressedBatch::from_arrays(&[keys, values])?;
//!
//! let mut node = VectorAggNode::init(
//!     vec![AggregateDefinition::new("sum", Some((1, &DataType::Int32)), 1)?],
//!     &[GroupingColumn::new(0, 0, DataType::Utf8)],
//!     Box::new(vec![batch].into_iter()),
//!     VectorAggConfig::default(),
//!     2,
//! )?;
//! let rows = node.collect_rows()?;
//! assert_eq!(rows[0].values(), &[Datum::from("a"), Datum::Int64(4)]);
//! assert_eq!(rows[1].values(), &[Datum::from("b"), Datum::Int64(2)]);
//! # Ok(())
//! # }
//! ```
/*
* Copyright 2022-2025 Crown Copyright
*
* Licensed under the Apache License, Version 2.0 (the "License");
* you may not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*     http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing, software
* distributed under the License is distributed on an "AS IS" BASIS,
* WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
* See the License for the specific language governing permissions and
* limitations under the License.
*/
pub mod arena;
pub mod bitmap;
pub mod column;
mod config;
mod datum;
mod error;
pub mod function;
mod grouping_policy;
pub mod hashing;
pub mod log;
mod node;
mod output;
#[cfg(test)]
mod test_utils;
pub mod tid;

pub use column::{BATCH_MAX, Batch, ColumnView, DecompressedBatch, DecompressionType};
pub use config::{
    DEFAULT_INITIAL_STATE_ROWS, DEFAULT_SPILL_SIZE_BYTES, VectorAggConfig, VectorAggConfigBuilder,
};
pub use datum::Datum;
pub use error::{KernelError, VectorAggError};
pub use function::{AggOp, AggregateDefinition, AggregateFunction};
pub use grouping_policy::{GroupingPolicyHash, PolicyStats};
pub use hashing::{GroupingColumn, HashingStrategy};
pub use node::{BatchSource, VectorAggNode};
pub use output::{OutputRow, rows_to_record_batch};
