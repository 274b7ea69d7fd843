//! Hash grouping policy: folds batches into per-group aggregate states and
//! emits one row per group.
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
use crate::{
    arena::Arena,
    bitmap::{WordSummary, combine_validity, filter_ranges, num_valid},
    column::{BATCH_MAX, Batch, ColumnView},
    config::VectorAggConfig,
    datum::Datum,
    error::VectorAggError,
    function::AggregateDefinition,
    hashing::{GroupingColumn, HashingStrategy, KeyIndexSpace, create_strategy},
    output::OutputRow,
};
use log::{debug, info, warn};
use num_format::{Locale, ToFormattedString};
use std::ops::Range;

/// Highest key index after which another batch could exhaust the index
/// space.
#[allow(clippy::cast_possible_truncation)]
const KEY_INDEX_SPILL_LIMIT: u32 = u32::MAX - BATCH_MAX as u32;

/// Counters accumulated over one generation. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStats {
    pub input_total_rows: usize,
    pub input_valid_rows: usize,
    pub bulk_filtered_rows: usize,
    pub consecutive_keys: usize,
}

#[derive(Debug, Clone, Copy)]
struct EmitCursor {
    next_key: u64,
    keys_end: u64,
}

/// Groups batch rows by key with a [`HashingStrategy`] and aggregates them
/// into dense per-key state arrays.
///
/// A generation lasts from construction or [`GroupingPolicyHash::reset`]
/// until the next reset. Emission walks key indices `1..=last_used` in order,
/// so groups come out in the order they were first seen.
#[derive(Debug)]
pub struct GroupingPolicyHash {
    agg_defs: Vec<AggregateDefinition>,
    strategy: Box<dyn HashingStrategy>,
    keys: KeyIndexSpace,
    num_agg_state_rows: usize,
    key_index_for_row: Vec<u32>,
    tmp_filter: Vec<u64>,
    agg_extra_arena: Arena,
    emit: Option<EmitCursor>,
    config: VectorAggConfig,
    stats: PolicyStats,
}

impl GroupingPolicyHash {
    /// Build a policy for the given aggregates and grouping columns.
    ///
    /// # Errors
    /// If no hashing strategy supports the grouping columns.
    pub fn new(
        mut agg_defs: Vec<AggregateDefinition>,
        grouping_cols: &[GroupingColumn],
        config: VectorAggConfig,
    ) -> Result<Self, VectorAggError> {
        let strategy = create_strategy(grouping_cols, &config)?;
        let num_agg_state_rows = config.initial_state_rows();
        for def in &mut agg_defs {
            def.states.release(num_agg_state_rows);
        }
        debug!(
            "Hash grouping with {} aggregates: {}",
            agg_defs.len(),
            agg_defs
                .iter()
                .map(AggregateDefinition::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self {
            agg_defs,
            strategy,
            keys: KeyIndexSpace::default(),
            num_agg_state_rows,
            key_index_for_row: Vec::new(),
            tmp_filter: Vec::new(),
            agg_extra_arena: Arena::new(),
            emit: None,
            config,
            stats: PolicyStats::default(),
        })
    }

    /// Drop every group and all generation storage. Afterwards the policy
    /// behaves like a newly constructed one.
    pub fn reset(&mut self) {
        self.strategy.reset();
        self.keys.reset();
        self.agg_extra_arena.reset();
        self.num_agg_state_rows = self.config.initial_state_rows();
        for def in &mut self.agg_defs {
            def.states.release(self.num_agg_state_rows);
        }
        self.key_index_for_row = Vec::new();
        self.tmp_filter = Vec::new();
        self.emit = None;
        self.stats = PolicyStats::default();
    }

    /// Merge the rows of `batch` that pass its qualification bitmap into the
    /// in-memory groups.
    ///
    /// # Errors
    /// If results are being emitted, the batch does not match the grouping
    /// columns or aggregates, the key index space is exhausted or a kernel
    /// fails.
    pub fn add_batch(&mut self, batch: &Batch<'_>) -> Result<(), VectorAggError> {
        if self.emit.is_some() {
            return Err(VectorAggError::EmitInProgress);
        }
        let rows = batch.total_rows();
        self.key_index_for_row.clear();
        self.key_index_for_row.resize(rows, 0);
        let qualification = batch.qualification();
        self.stats.input_total_rows += rows;
        self.stats.input_valid_rows += num_valid(qualification, rows);
        if rows == 0 {
            return Ok(());
        }

        // Dictionary hashing can assign keys before any range is processed
        let last_initialized = self.keys.last_used_key_index();
        self.strategy.prepare_for_batch(&mut self.keys, batch)?;
        self.initialize_new_states(last_initialized);

        let Some(words) = qualification else {
            return self.add_one_range(batch, None, 0..rows);
        };
        for (summary, range) in filter_ranges(words, rows) {
            match summary {
                WordSummary::NonePass => self.stats.bulk_filtered_rows += range.len(),
                WordSummary::AllPass => self.add_one_range(batch, None, range)?,
                WordSummary::SomePass => self.add_one_range(batch, Some(words), range)?,
            }
        }
        Ok(())
    }

    fn add_one_range(
        &mut self,
        batch: &Batch<'_>,
        filter: Option<&[u64]>,
        rows: Range<usize>,
    ) -> Result<(), VectorAggError> {
        let last_initialized = self.keys.last_used_key_index();
        self.strategy.fill_offsets(
            &mut self.keys,
            batch,
            filter,
            rows.clone(),
            &mut self.key_index_for_row,
        )?;
        self.initialize_new_states(last_initialized);
        self.stats.consecutive_keys += self.key_index_for_row[rows.clone()]
            .windows(2)
            .filter(|pair| pair[0] != 0 && pair[0] == pair[1])
            .count();

        let total_rows = batch.total_rows();
        for def in &mut self.agg_defs {
            let agg_filter = match def.filter_offset {
                Some(offset) => batch.agg_filter(offset)?,
                None => None,
            };
            let Some(input_offset) = def.input_offset else {
                // count(*) has no argument
                let combined =
                    combine_validity(&mut self.tmp_filter, total_rows, &[filter, agg_filter]);
                def.states.agg_scalar_range(
                    &self.key_index_for_row,
                    combined,
                    rows.clone(),
                    &Datum::Null,
                    true,
                    &mut self.agg_extra_arena,
                )?;
                continue;
            };
            let column = batch.column(input_offset)?;
            let combined = combine_validity(
                &mut self.tmp_filter,
                total_rows,
                &[filter, agg_filter, column.validity()],
            );
            match column {
                ColumnView::Scalar { value, is_null } => def.states.agg_scalar_range(
                    &self.key_index_for_row,
                    combined,
                    rows.clone(),
                    value,
                    *is_null,
                    &mut self.agg_extra_arena,
                )?,
                ColumnView::Unsupported(kind) => {
                    return Err(VectorAggError::shape(format!(
                        "{} argument column {input_offset} has decompression type {kind:?}",
                        def.name()
                    )));
                }
                _ => def.states.agg_vector(
                    &self.key_index_for_row,
                    combined,
                    rows.clone(),
                    column,
                    &mut self.agg_extra_arena,
                )?,
            }
        }
        Ok(())
    }

    /// Initialise the states of keys assigned after `last_initialized`,
    /// growing the state arrays first if needed.
    fn initialize_new_states(&mut self, last_initialized: u32) {
        let last_used = self.keys.last_used_key_index() as usize;
        let first_new = last_initialized as usize + 1;
        if last_used < first_new {
            return;
        }
        if last_used >= self.num_agg_state_rows {
            let mut capacity = self.num_agg_state_rows;
            while last_used >= capacity {
                capacity = capacity * 2 + 1;
            }
            for def in &mut self.agg_defs {
                def.states.grow(capacity);
            }
            self.num_agg_state_rows = capacity;
        }
        for def in &mut self.agg_defs {
            def.states.init(first_new, last_used + 1 - first_new);
        }
    }

    /// Whether the caller should emit and reset before adding more batches.
    #[must_use]
    pub fn should_emit(&self) -> bool {
        let last_used = self.keys.last_used_key_index();
        if last_used > KEY_INDEX_SPILL_LIMIT {
            warn!(
                "Key index {} is close to exhaustion, requesting spill",
                last_used.to_formatted_string(&Locale::en)
            );
            return true;
        }
        let size_bytes = self.strategy.size_bytes() + self.agg_extra_arena.used_bytes();
        if size_bytes > self.config.spill_size_bytes() {
            debug!(
                "Hash table holds {} bytes for {} keys, requesting spill",
                size_bytes.to_formatted_string(&Locale::en),
                last_used.to_formatted_string(&Locale::en)
            );
            return true;
        }
        false
    }

    /// Write the next group into `out`, entering emit mode on the first call.
    /// Returns `false` once every group has been emitted, which also leaves
    /// emit mode.
    ///
    /// # Errors
    /// If a kernel fails to finalise a group or an output slot is out of
    /// range.
    pub fn emit_next(&mut self, out: &mut OutputRow) -> Result<bool, VectorAggError> {
        let cursor = match self.emit {
            Some(cursor) => cursor,
            None => {
                self.log_emit_start();
                EmitCursor {
                    next_key: 1,
                    keys_end: u64::from(self.keys.last_used_key_index()) + 1,
                }
            }
        };
        if cursor.next_key >= cursor.keys_end {
            self.emit = None;
            return Ok(false);
        }
        // A group that fails to finalise is skipped, not retried
        self.emit = Some(EmitCursor {
            next_key: cursor.next_key + 1,
            ..cursor
        });
        // The cursor never passes last_used_key_index
        #[allow(clippy::cast_possible_truncation)]
        let key_index = cursor.next_key as u32;
        for def in &self.agg_defs {
            let value = def.states.finalize(key_index, &self.agg_extra_arena)?;
            out.set(def.output_offset, value)?;
        }
        self.strategy.emit_key(&self.keys, key_index, out)?;
        Ok(true)
    }

    fn log_emit_start(&self) {
        let groups = self.keys.last_used_key_index();
        #[allow(clippy::cast_precision_loss)]
        let rows_per_key = if groups == 0 {
            0.0
        } else {
            self.stats.input_valid_rows as f64 / f64::from(groups)
        };
        info!(
            "Emitting {} groups ({rows_per_key:.1} rows per key) with {} key from {} rows, {} qualifying, {} bulk filtered, {} consecutive keys",
            groups.to_formatted_string(&Locale::en),
            self.strategy.explain_name(),
            self.stats.input_total_rows.to_formatted_string(&Locale::en),
            self.stats.input_valid_rows.to_formatted_string(&Locale::en),
            self.stats.bulk_filtered_rows.to_formatted_string(&Locale::en),
            self.stats.consecutive_keys.to_formatted_string(&Locale::en)
        );
    }

    /// Name of the hashing strategy in use.
    #[must_use]
    pub fn explain(&self) -> &'static str {
        self.strategy.explain_name()
    }

    #[must_use]
    pub fn stats(&self) -> PolicyStats {
        self.stats
    }

    #[must_use]
    pub fn is_emitting(&self) -> bool {
        self.emit.is_some()
    }

    #[must_use]
    pub fn last_used_key_index(&self) -> u32 {
        self.keys.last_used_key_index()
    }

    /// Key index of every row of the last batch, 0 for rows that did not
    /// pass its filter.
    #[must_use]
    pub fn key_index_for_row(&self) -> &[u32] {
        &self.key_index_for_row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_error, column::DecompressedBatch, config::VectorAggConfigBuilder};
    use arrow::{
        array::{ArrayRef, BooleanArray, Int32Array, Int64Array, StringArray},
        datatypes::DataType,
    };
    use color_eyre::eyre::Result;
    use std::sync::Arc;
    use test_log::test;

    fn int_key_policy(
        agg_defs: Vec<AggregateDefinition>,
        config: VectorAggConfig,
    ) -> Result<GroupingPolicyHash> {
        Ok(GroupingPolicyHash::new(
            agg_defs,
            &[GroupingColumn::new(0, 0, DataType::Int32)],
            config,
        )?)
    }

    fn emit_all(policy: &mut GroupingPolicyHash, width: usize) -> Result<Vec<Vec<Datum>>> {
        let mut out = OutputRow::new(width);
        let mut rows = Vec::new();
        while policy.emit_next(&mut out)? {
            rows.push(out.values().to_vec());
        }
        Ok(rows)
    }

    fn ints(values: Vec<Option<i32>>) -> ArrayRef {
        Arc::new(Int32Array::from(values))
    }

    #[test]
    fn should_count_qualifying_rows_per_key() -> Result<()> {
        // Given
        let keys = ints(vec![Some(1), Some(2), Some(1), None, Some(2)]);
        let batch = DecompressedBatch::from_arrays(&[keys])?
            .with_qualification(&BooleanArray::from(vec![true, true, true, true, false]));
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("count", None, 1)?],
            VectorAggConfig::default(),
        )?;

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(policy.key_index_for_row(), &[1, 2, 1, 3, 0]);
        assert_eq!(
            emit_all(&mut policy, 2)?,
            vec![
                vec![Datum::Int32(1), Datum::Int64(2)],
                vec![Datum::Int32(2), Datum::Int64(1)],
                vec![Datum::Null, Datum::Int64(1)],
            ]
        );
        assert_eq!(
            policy.stats(),
            PolicyStats {
                input_total_rows: 5,
                input_valid_rows: 4,
                bulk_filtered_rows: 0,
                consecutive_keys: 0,
            }
        );
        Ok(())
    }

    #[test]
    fn should_combine_qualification_filter_and_argument_validity() -> Result<()> {
        // Given
        let batch = DecompressedBatch::from_arrays(&[
            ints(vec![Some(1), Some(1), Some(1), Some(1)]),
            ints(vec![Some(10), None, Some(30), Some(40)]),
        ])?
        .with_qualification(&BooleanArray::from(vec![true, true, true, false]))
        .with_agg_filter(Some(&BooleanArray::from(vec![true, true, false, true])));
        let mut policy = int_key_policy(
            vec![
                AggregateDefinition::new("sum", Some((1, &DataType::Int32)), 1)?.with_filter(0),
                AggregateDefinition::new("count", Some((1, &DataType::Int32)), 2)?,
                AggregateDefinition::new("count", None, 3)?.with_filter(0),
            ],
            VectorAggConfig::default(),
        )?;

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(
            emit_all(&mut policy, 4)?,
            vec![vec![
                Datum::Int32(1),
                Datum::Int64(10),
                Datum::Int64(2),
                Datum::Int64(2)
            ]]
        );
        Ok(())
    }

    #[test]
    fn should_fold_scalar_arguments() -> Result<()> {
        // Given
        let batch = DecompressedBatch::from_arrays(&[ints(vec![Some(1), Some(2), Some(1)])])?
            .with_scalar(5)
            .with_scalar(Datum::Null);
        let mut policy = int_key_policy(
            vec![
                AggregateDefinition::new("sum", Some((1, &DataType::Int32)), 1)?,
                AggregateDefinition::new("max", Some((2, &DataType::Int32)), 2)?,
                AggregateDefinition::new("count", Some((2, &DataType::Int32)), 3)?,
            ],
            VectorAggConfig::default(),
        )?;

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(
            emit_all(&mut policy, 4)?,
            vec![
                vec![Datum::Int32(1), Datum::Int64(10), Datum::Null, Datum::Int64(0)],
                vec![Datum::Int32(2), Datum::Int64(5), Datum::Null, Datum::Int64(0)],
            ]
        );
        Ok(())
    }

    #[test]
    fn should_skip_words_rejected_in_bulk() -> Result<()> {
        // Given 200 rows of which only the last 72 qualify
        let keys = ints((0..200).map(|row| Some(row % 2)).collect());
        let qualification = (0..200).map(|row| row >= 128).collect::<Vec<_>>();
        let batch = DecompressedBatch::from_arrays(&[keys])?
            .with_qualification(&BooleanArray::from(qualification));
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("count", None, 1)?],
            VectorAggConfig::default(),
        )?;

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(policy.stats().bulk_filtered_rows, 128);
        assert!(policy.key_index_for_row()[..128].iter().all(|&key| key == 0));
        assert_eq!(
            emit_all(&mut policy, 2)?,
            vec![
                vec![Datum::Int32(0), Datum::Int64(36)],
                vec![Datum::Int32(1), Datum::Int64(36)],
            ]
        );
        Ok(())
    }

    #[test]
    fn should_grow_states_geometrically() -> Result<()> {
        // Given
        let config = VectorAggConfigBuilder::new().initial_state_rows(1).build()?;
        let batch = DecompressedBatch::from_arrays(&[ints((0..10).map(Some).collect())])?;
        let mut policy = int_key_policy(vec![AggregateDefinition::new("count", None, 1)?], config)?;

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(policy.num_agg_state_rows, 15);
        assert_eq!(policy.last_used_key_index(), 10);
        assert_eq!(emit_all(&mut policy, 2)?.len(), 10);
        Ok(())
    }

    #[test]
    fn should_initialise_states_of_dictionary_keys() -> Result<()> {
        // Given
        let dict: arrow::array::DictionaryArray<arrow::datatypes::Int16Type> =
            vec![Some("x"), Some("y"), Some("x"), Some("x")].into_iter().collect();
        let batch = DecompressedBatch::from_arrays(&[Arc::new(dict)])?;
        let mut policy = GroupingPolicyHash::new(
            vec![AggregateDefinition::new("count", None, 1)?],
            &[GroupingColumn::new(0, 0, DataType::Utf8)],
            VectorAggConfigBuilder::new().initial_state_rows(1).build()?,
        )?;

        // When
        policy.add_batch(&batch.view()?)?;
        policy.add_batch(&batch.view()?)?;

        // Then
        assert_eq!(
            emit_all(&mut policy, 2)?,
            vec![
                vec![Datum::from("x"), Datum::Int64(6)],
                vec![Datum::from("y"), Datum::Int64(2)],
            ]
        );
        Ok(())
    }

    #[test]
    fn should_reject_batches_while_emitting() -> Result<()> {
        // Given
        let batch = DecompressedBatch::from_arrays(&[ints(vec![Some(1), Some(2)])])?;
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("count", None, 1)?],
            VectorAggConfig::default(),
        )?;
        policy.add_batch(&batch.view()?)?;

        // When
        assert!(policy.emit_next(&mut OutputRow::new(2))?);

        // Then
        assert!(policy.is_emitting());
        assert_error!(
            policy.add_batch(&batch.view()?),
            "cannot add a batch while results are being emitted"
        );
        Ok(())
    }

    #[test]
    fn should_move_past_group_that_fails_to_finalise() -> Result<()> {
        // Given
        let sums: ArrayRef = Arc::new(Int64Array::from(vec![i64::MAX, 1, 5]));
        let keys = ints(vec![Some(1), Some(1), Some(2)]);
        let batch = DecompressedBatch::from_arrays(&[keys, sums])?;
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("sum", Some((1, &DataType::Int64)), 1)?],
            VectorAggConfig::default(),
        )?;
        policy.add_batch(&batch.view()?)?;
        let mut out = OutputRow::new(2);

        // When
        let first = policy.emit_next(&mut out);

        // Then
        assert_error!(first, "sum out of range");
        assert!(policy.is_emitting());
        assert!(policy.emit_next(&mut out)?);
        assert_eq!(out.values(), &[Datum::Int32(2), Datum::Int64(5)]);
        assert!(!policy.emit_next(&mut out)?);
        Ok(())
    }

    #[test]
    fn should_behave_like_new_after_reset() -> Result<()> {
        // Given
        let first = DecompressedBatch::from_arrays(&[ints(vec![Some(5), Some(6), Some(5)])])?;
        let second = DecompressedBatch::from_arrays(&[ints(vec![Some(7), Some(5)])])?;
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("count", None, 1)?],
            VectorAggConfig::default(),
        )?;
        policy.add_batch(&first.view()?)?;
        emit_all(&mut policy, 2)?;

        // When
        policy.reset();
        policy.add_batch(&second.view()?)?;

        // Then
        assert_eq!(policy.stats().input_total_rows, 2);
        assert_eq!(
            emit_all(&mut policy, 2)?,
            vec![
                vec![Datum::Int32(7), Datum::Int64(1)],
                vec![Datum::Int32(5), Datum::Int64(1)],
            ]
        );
        Ok(())
    }

    #[test]
    fn should_request_spill_above_size_cap() -> Result<()> {
        // Given
        let config = VectorAggConfigBuilder::new().spill_size_bytes(64).build()?;
        let batch = DecompressedBatch::from_arrays(&[ints((0..100).map(Some).collect())])?;
        let mut policy = int_key_policy(vec![AggregateDefinition::new("count", None, 1)?], config)?;
        assert!(!policy.should_emit());

        // When
        policy.add_batch(&batch.view()?)?;

        // Then
        assert!(policy.should_emit());
        Ok(())
    }

    #[test]
    fn should_request_spill_near_key_index_exhaustion() -> Result<()> {
        // Given
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("count", None, 1)?],
            VectorAggConfig::default(),
        )?;

        // When
        policy.keys = KeyIndexSpace::starting_after(KEY_INDEX_SPILL_LIMIT);
        let at_limit = policy.should_emit();
        policy.keys = KeyIndexSpace::starting_after(KEY_INDEX_SPILL_LIMIT + 1);

        // Then
        assert!(!at_limit);
        assert!(policy.should_emit());
        Ok(())
    }

    #[test]
    fn should_emit_nothing_without_input() -> Result<()> {
        // Given
        let mut policy = GroupingPolicyHash::new(
            vec![AggregateDefinition::new("count", None, 0)?],
            &[],
            VectorAggConfig::default(),
        )?;
        policy.add_batch(&DecompressedBatch::new(0).view()?)?;

        // Then
        assert_eq!(policy.explain(), "serialized");
        assert!(!policy.emit_next(&mut OutputRow::new(1))?);
        assert!(!policy.is_emitting());
        Ok(())
    }

    #[test]
    fn should_reject_unsupported_argument_column() -> Result<()> {
        // Given
        let batch = DecompressedBatch::from_arrays(&[
            ints(vec![Some(1)]),
            Arc::new(StringArray::from(vec!["a"])) as ArrayRef,
        ])?
        .with_unsupported(crate::column::DecompressionType::Iterator);
        let mut policy = int_key_policy(
            vec![AggregateDefinition::new("min", Some((2, &DataType::Utf8)), 1)?],
            VectorAggConfig::default(),
        )?;

        // Then
        assert_error!(
            policy.add_batch(&batch.view()?),
            "shape violation: min argument column 2 has decompression type Iterator"
        );
        Ok(())
    }
}
