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
use super::{Fingerprint, Fingerprinter, GroupingColumn, HashingStrategy, KeyIndexSpace};
use crate::{
    arena::{Arena, ArenaSlice},
    bitmap::{self, RowValidity, with_validity, words_for_rows},
    column::{Batch, ColumnView, TextValues},
    datum::Datum,
    error::VectorAggError,
    output::OutputRow,
};
use bytes::Bytes;
use log::debug;
use nohash::BuildNoHashHasher;
use std::{
    collections::{HashMap, hash_map::Entry},
    ops::Range,
};

type FingerprintTable = HashMap<Fingerprint, u32, BuildNoHashHasher<Fingerprint>>;

/// Grouping by one text column. Keys are identified by their 128-bit
/// fingerprint and copied into the strategy's arena when first seen.
///
/// For dictionary-encoded batches whose dictionary is no larger than the
/// number of qualifying rows, each dictionary entry is hashed once in
/// `prepare_for_batch` and rows are translated through the resulting map.
#[derive(Debug)]
pub struct SingleTextStrategy {
    column: GroupingColumn,
    fingerprinter: Fingerprinter,
    table: FingerprintTable,
    key_arena: Arena,
    output_keys: Vec<ArenaSlice>,
    dictionary_hashing: bool,
    use_key_index_for_dict: bool,
    key_index_for_dict: Vec<u32>,
    dict_filter: Vec<u64>,
}

impl SingleTextStrategy {
    #[must_use]
    pub fn new(column: GroupingColumn, dictionary_hashing: bool) -> Self {
        Self {
            column,
            fingerprinter: Fingerprinter::default(),
            table: FingerprintTable::default(),
            key_arena: Arena::new(),
            output_keys: vec![ArenaSlice::default()],
            dictionary_hashing,
            use_key_index_for_dict: false,
            key_index_for_dict: Vec::new(),
            dict_filter: Vec::new(),
        }
    }

    fn lookup(&mut self, keys: &mut KeyIndexSpace, value: &[u8]) -> Result<u32, VectorAggError> {
        let fingerprint = self.fingerprinter.fingerprint(value);
        match self.table.entry(fingerprint) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let key_index = keys.next_key_index()?;
                entry.insert(key_index);
                let slot = key_index as usize;
                if self.output_keys.len() <= slot {
                    self.output_keys.resize(slot + 1, ArenaSlice::default());
                }
                self.output_keys[slot] = self.key_arena.alloc_copy(value);
                Ok(key_index)
            }
        }
    }

    #[inline(always)]
    fn fill_rows<'a, V: RowValidity, F: RowValidity>(
        &mut self,
        keys: &mut KeyIndexSpace,
        value_of: impl Fn(usize) -> &'a [u8],
        valid: V,
        filter: F,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) -> Result<(), VectorAggError> {
        for row in rows {
            if !filter.is_valid(row) {
                continue;
            }
            key_index_for_row[row] = if valid.is_valid(row) {
                self.lookup(keys, value_of(row))?
            } else {
                keys.null_key()?
            };
        }
        Ok(())
    }

    /// Hash the dictionary entries referenced by qualifying rows.
    fn prepare_dictionary(
        &mut self,
        keys: &mut KeyIndexSpace,
        indices: &[i16],
        dict: TextValues<'_>,
        validity: Option<&[u64]>,
        qualification: Option<&[u64]>,
        rows: usize,
    ) -> Result<(), VectorAggError> {
        self.dict_filter.clear();
        self.dict_filter.resize(words_for_rows(dict.len()), 0);
        let mut have_null_key = false;
        for row in 0..rows {
            if !bitmap::row_is_valid(qualification, row) {
                continue;
            }
            if bitmap::row_is_valid(validity, row) {
                #[allow(clippy::cast_sign_loss)]
                bitmap::set_bit(&mut self.dict_filter, indices[row] as usize);
            } else {
                have_null_key = true;
            }
        }

        let mut key_index_for_dict = std::mem::take(&mut self.key_index_for_dict);
        key_index_for_dict.clear();
        key_index_for_dict.resize(dict.len(), 0);
        let dict_filter = std::mem::take(&mut self.dict_filter);
        let result = self.fill_rows(
            keys,
            |entry| dict.value(entry),
            bitmap::AllRowsValid,
            bitmap::ValidityBits(&dict_filter),
            0..dict.len(),
            &mut key_index_for_dict,
        );
        self.key_index_for_dict = key_index_for_dict;
        self.dict_filter = dict_filter;
        result?;

        // The null key follows the dictionary's keys
        if have_null_key {
            keys.null_key()?;
        }
        Ok(())
    }

    fn translate_dictionary<F: RowValidity>(
        &self,
        keys: &KeyIndexSpace,
        indices: &[i16],
        validity: Option<&[u64]>,
        filter: F,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) {
        let null_key_index = keys.null_key_index();
        for row in rows {
            if !filter.is_valid(row) {
                continue;
            }
            #[allow(clippy::cast_sign_loss)]
            let key_index = if bitmap::row_is_valid(validity, row) {
                self.key_index_for_dict[indices[row] as usize]
            } else {
                null_key_index
            };
            key_index_for_row[row] = key_index;
        }
    }

    fn shape_error(&self, column: &ColumnView<'_>) -> VectorAggError {
        VectorAggError::shape(format!(
            "single text key column {} has decompression type {:?}",
            self.column.input_offset,
            column.decompression_type()
        ))
    }
}

impl HashingStrategy for SingleTextStrategy {
    fn explain_name(&self) -> &'static str {
        "single text"
    }

    fn reset(&mut self) {
        self.table = FingerprintTable::default();
        self.key_arena.reset();
        self.output_keys = vec![ArenaSlice::default()];
        self.use_key_index_for_dict = false;
        self.key_index_for_dict = Vec::new();
        self.dict_filter = Vec::new();
    }

    fn prepare_for_batch(
        &mut self,
        keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
    ) -> Result<(), VectorAggError> {
        self.use_key_index_for_dict = false;
        if !self.dictionary_hashing {
            return Ok(());
        }
        let ColumnView::TextDict {
            indices,
            dict,
            validity,
        } = *batch.column(self.column.input_offset)?
        else {
            return Ok(());
        };
        let rows = batch.total_rows();
        let qualification = batch.qualification();
        if dict.len() > bitmap::num_valid(qualification, rows) {
            return Ok(());
        }
        self.prepare_dictionary(keys, indices, dict, validity, qualification, rows)?;
        self.use_key_index_for_dict = true;
        debug!(
            "Hashing dictionary of {} entries instead of {rows} rows",
            dict.len()
        );
        Ok(())
    }

    fn fill_offsets(
        &mut self,
        keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
        filter: Option<&[u64]>,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) -> Result<(), VectorAggError> {
        if rows.is_empty() {
            return Ok(());
        }
        let column = *batch.column(self.column.input_offset)?;
        match column {
            ColumnView::TextDict {
                indices, validity, ..
            } if self.use_key_index_for_dict => {
                with_validity!(filter, |filter| self.translate_dictionary(
                    keys,
                    indices,
                    validity,
                    filter,
                    rows,
                    key_index_for_row
                ));
                Ok(())
            }
            ColumnView::TextDict {
                indices,
                dict,
                validity,
            } => {
                #[allow(clippy::cast_sign_loss)]
                let value_of = |row: usize| dict.value(indices[row] as usize);
                with_validity!(validity, |valid| with_validity!(filter, |filter| self
                    .fill_rows(keys, value_of, valid, filter, rows, key_index_for_row)))
            }
            ColumnView::Text { values, validity } => {
                let value_of = |row: usize| values.value(row);
                with_validity!(validity, |valid| with_validity!(filter, |filter| self
                    .fill_rows(keys, value_of, valid, filter, rows, key_index_for_row)))
            }
            ColumnView::Scalar { value, is_null } => {
                let key_index = if is_null {
                    keys.null_key()?
                } else {
                    let text = value.as_text().ok_or_else(|| self.shape_error(&column))?;
                    self.lookup(keys, text)?
                };
                for row in rows {
                    if bitmap::row_is_valid(filter, row) {
                        key_index_for_row[row] = key_index;
                    }
                }
                Ok(())
            }
            _ => Err(self.shape_error(&column)),
        }
    }

    fn size_bytes(&self) -> usize {
        self.table.capacity() * (size_of::<Fingerprint>() + size_of::<u32>())
            + self.output_keys.capacity() * size_of::<ArenaSlice>()
            + self.key_arena.allocated_bytes()
    }

    fn emit_key(
        &self,
        keys: &KeyIndexSpace,
        key_index: u32,
        out: &mut OutputRow,
    ) -> Result<(), VectorAggError> {
        if key_index == keys.null_key_index() {
            return out.set_null(self.column.output_offset);
        }
        let slice = self.output_keys.get(key_index as usize).ok_or_else(|| {
            VectorAggError::shape(format!("no single text key for index {key_index}"))
        })?;
        out.set(
            self.column.output_offset,
            Datum::Text(Bytes::copy_from_slice(self.key_arena.get(*slice))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_error, bitmap::from_bools, column::FixedValues};
    use arrow::datatypes::DataType;
    use color_eyre::eyre::Result;
    use test_log::test;

    fn strategy(dictionary_hashing: bool) -> SingleTextStrategy {
        SingleTextStrategy::new(
            GroupingColumn::new(0, 0, DataType::Utf8),
            dictionary_hashing,
        )
    }

    fn fill(
        strategy: &mut SingleTextStrategy,
        keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
    ) -> Result<Vec<u32>> {
        let mut key_index_for_row = vec![0; batch.total_rows()];
        strategy.prepare_for_batch(keys, batch)?;
        strategy.fill_offsets(
            keys,
            batch,
            batch.qualification(),
            0..batch.total_rows(),
            &mut key_index_for_row,
        )?;
        Ok(key_index_for_row)
    }

    /// Emitted key of every row, `None` for rows without a key index.
    fn row_keys(
        strategy: &SingleTextStrategy,
        keys: &KeyIndexSpace,
        key_index_for_row: &[u32],
    ) -> Result<Vec<Option<Datum>>> {
        let mut out = OutputRow::new(1);
        key_index_for_row
            .iter()
            .map(|&key_index| {
                if key_index == 0 {
                    return Ok(None);
                }
                strategy.emit_key(keys, key_index, &mut out)?;
                Ok(out.value(0).cloned())
            })
            .collect()
    }

    #[test]
    fn should_group_plain_text_with_nulls() -> Result<()> {
        // Given
        let offsets = [0, 1, 2, 3, 3];
        let validity = from_bools([true, true, true, false]);
        let batch = Batch::try_new(
            4,
            vec![ColumnView::Text {
                values: TextValues {
                    offsets: &offsets,
                    data: b"aba",
                },
                validity: Some(&validity),
            }],
            None,
            vec![],
        )?;
        let mut strategy = strategy(true);
        let mut keys = KeyIndexSpace::default();

        // When
        let key_index_for_row = fill(&mut strategy, &mut keys, &batch)?;

        // Then
        assert_eq!(key_index_for_row, vec![1, 2, 1, 3]);
        assert_eq!(
            row_keys(&strategy, &keys, &key_index_for_row)?,
            vec![
                Some(Datum::from("a")),
                Some(Datum::from("b")),
                Some(Datum::from("a")),
                Some(Datum::Null)
            ]
        );
        Ok(())
    }

    #[test]
    fn should_hash_dictionary_once_per_entry() -> Result<()> {
        // Given
        let offsets = [0, 1, 2];
        let indices = [0i16, 1, 0, 1, 0];
        let filter = from_bools([true, true, true, false, true]);
        let batch = Batch::try_new(
            5,
            vec![ColumnView::TextDict {
                indices: &indices,
                dict: TextValues {
                    offsets: &offsets,
                    data: b"xy",
                },
                validity: None,
            }],
            Some(&filter),
            vec![],
        )?;
        let mut strategy = strategy(true);
        let mut keys = KeyIndexSpace::default();

        // When
        let key_index_for_row = fill(&mut strategy, &mut keys, &batch)?;

        // Then
        assert!(strategy.use_key_index_for_dict);
        assert_eq!(strategy.key_index_for_dict, vec![1, 2]);
        assert_eq!(key_index_for_row, vec![1, 2, 1, 0, 1]);
        assert_eq!(keys.null_key_index(), 0);
        Ok(())
    }

    #[test]
    fn should_group_dictionary_the_same_with_fast_path_off() -> Result<()> {
        // Given a dictionary entry only referenced by a filtered-out row
        let offsets = [0, 1, 2, 3];
        let indices = [2i16, 0, 2, -1, 1, 0];
        let validity = from_bools([true, true, true, false, true, true]);
        let filter = from_bools([true, true, true, true, false, true]);
        let batch = Batch::try_new(
            6,
            vec![ColumnView::TextDict {
                indices: &indices,
                dict: TextValues {
                    offsets: &offsets,
                    data: b"xyz",
                },
                validity: Some(&validity),
            }],
            Some(&filter),
            vec![],
        )?;
        let mut with_dict = strategy(true);
        let mut dict_keys = KeyIndexSpace::default();
        let mut without_dict = strategy(false);
        let mut row_keys_space = KeyIndexSpace::default();

        // When
        let dict_rows = fill(&mut with_dict, &mut dict_keys, &batch)?;
        let plain_rows = fill(&mut without_dict, &mut row_keys_space, &batch)?;

        // Then
        assert!(with_dict.use_key_index_for_dict);
        assert!(!without_dict.use_key_index_for_dict);
        assert_eq!(dict_rows, vec![2, 1, 2, 3, 0, 1]);
        assert_eq!(dict_keys.last_used_key_index(), 3);
        assert_eq!(dict_keys.null_key_index(), 3);
        assert_eq!(
            row_keys(&with_dict, &dict_keys, &dict_rows)?,
            row_keys(&without_dict, &row_keys_space, &plain_rows)?
        );
        Ok(())
    }

    #[test]
    fn should_hash_rows_when_dictionary_is_larger_than_batch() -> Result<()> {
        // Given
        let offsets = [0, 1, 2, 3];
        let indices = [1i16, 1];
        let batch = Batch::try_new(
            2,
            vec![ColumnView::TextDict {
                indices: &indices,
                dict: TextValues {
                    offsets: &offsets,
                    data: b"xyz",
                },
                validity: None,
            }],
            None,
            vec![],
        )?;
        let mut strategy = strategy(true);
        let mut keys = KeyIndexSpace::default();

        // When
        let key_index_for_row = fill(&mut strategy, &mut keys, &batch)?;

        // Then
        assert!(!strategy.use_key_index_for_dict);
        assert_eq!(key_index_for_row, vec![1, 1]);
        assert_eq!(keys.last_used_key_index(), 1);
        Ok(())
    }

    #[test]
    fn should_accept_empty_dictionary_of_all_null_rows() -> Result<()> {
        // Given
        let offsets = [0];
        let indices = [0i16, 0];
        let validity = from_bools([false, false]);
        let batch = Batch::try_new(
            2,
            vec![ColumnView::TextDict {
                indices: &indices,
                dict: TextValues {
                    offsets: &offsets,
                    data: b"",
                },
                validity: Some(&validity),
            }],
            None,
            vec![],
        )?;
        let mut strategy = strategy(true);
        let mut keys = KeyIndexSpace::default();

        // When
        let key_index_for_row = fill(&mut strategy, &mut keys, &batch)?;

        // Then
        assert!(strategy.use_key_index_for_dict);
        assert_eq!(key_index_for_row, vec![1, 1]);
        assert_eq!(keys.null_key_index(), 1);
        Ok(())
    }

    #[test]
    fn should_keep_keys_across_batches_until_reset() -> Result<()> {
        // Given
        let value = Datum::from("same");
        let batch = Batch::try_new(3, vec![ColumnView::scalar(&value)], None, vec![])?;
        let mut strategy = strategy(true);
        let mut keys = KeyIndexSpace::default();

        // When
        let first = fill(&mut strategy, &mut keys, &batch)?;
        let second = fill(&mut strategy, &mut keys, &batch)?;

        // Then
        assert_eq!(first, vec![1, 1, 1]);
        assert_eq!(second, first);
        assert!(strategy.key_arena.used_bytes() > 0);
        strategy.reset();
        assert_eq!(strategy.key_arena.used_bytes(), 0);
        assert_eq!(strategy.output_keys.len(), 1);
        Ok(())
    }

    #[test]
    fn should_reject_numeric_column() -> Result<()> {
        let values = [1i32];
        let batch = Batch::try_new(
            1,
            vec![ColumnView::Fixed {
                values: FixedValues::Width4(&values),
                validity: None,
            }],
            None,
            vec![],
        )?;
        let mut keys = KeyIndexSpace::default();
        assert_error!(
            fill(&mut strategy(true), &mut keys, &batch),
            "shape violation: single text key column 0 has decompression type Width4"
        );
        Ok(())
    }
}
