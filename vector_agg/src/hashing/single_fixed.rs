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
use super::{GroupingColumn, HashingStrategy, KeyIndexSpace, hash64};
use crate::{
    bitmap::{RowValidity, with_validity},
    column::{Batch, ColumnView, FixedKey},
    datum::Datum,
    error::VectorAggError,
    output::OutputRow,
};
use nohash::BuildNoHashHasher;
use std::{
    collections::{HashMap, hash_map::Entry},
    hash::{Hash, Hasher},
    ops::Range,
};

/// A fixed-width key stored with its hash, so the table hasher is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HashedKey<K> {
    hash: u64,
    key: K,
}

impl<K: FixedKey> HashedKey<K> {
    fn new(key: K) -> Self {
        Self {
            hash: hash64(key.to_bits().cast_unsigned()),
            key,
        }
    }
}

impl<K> Hash for HashedKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl<K> nohash::IsEnabled for HashedKey<K> {}

type KeyTable<K> = HashMap<HashedKey<K>, u32, BuildNoHashHasher<HashedKey<K>>>;

/// Grouping by one 2, 4 or 8 byte by-value column. Keys compare on their
/// bit pattern, so float keys group bit-exactly.
#[derive(Debug)]
pub struct SingleFixedStrategy<K: FixedKey> {
    column: GroupingColumn,
    table: KeyTable<K>,
    /// Key value of every key index. Slot 0 and the null key's slot hold
    /// placeholders.
    output_keys: Vec<K>,
}

impl<K: FixedKey> SingleFixedStrategy<K> {
    #[must_use]
    pub fn new(column: GroupingColumn) -> Self {
        Self {
            column,
            table: KeyTable::default(),
            output_keys: vec![K::default()],
        }
    }

    fn lookup(&mut self, keys: &mut KeyIndexSpace, key: K) -> Result<u32, VectorAggError> {
        match self.table.entry(HashedKey::new(key)) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let key_index = keys.next_key_index()?;
                entry.insert(key_index);
                let slot = key_index as usize;
                if self.output_keys.len() <= slot {
                    self.output_keys.resize(slot + 1, K::default());
                }
                self.output_keys[slot] = key;
                Ok(key_index)
            }
        }
    }

    #[inline(always)]
    fn fill_column<V: RowValidity, F: RowValidity>(
        &mut self,
        keys: &mut KeyIndexSpace,
        values: &[K],
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
                self.lookup(keys, values[row])?
            } else {
                keys.null_key()?
            };
        }
        Ok(())
    }

    fn fill_scalar<F: RowValidity>(
        key_index: u32,
        filter: F,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) {
        for row in rows {
            if filter.is_valid(row) {
                key_index_for_row[row] = key_index;
            }
        }
    }

    fn shape_error(&self, column: &ColumnView<'_>) -> VectorAggError {
        VectorAggError::shape(format!(
            "{} key column {} has decompression type {:?}",
            self.explain_name(),
            self.column.input_offset,
            column.decompression_type()
        ))
    }
}

impl<K: FixedKey> HashingStrategy for SingleFixedStrategy<K> {
    fn explain_name(&self) -> &'static str {
        match K::WIDTH {
            2 => "single 2-byte",
            4 => "single 4-byte",
            _ => "single 8-byte",
        }
    }

    fn reset(&mut self) {
        self.table = KeyTable::default();
        self.output_keys = vec![K::default()];
    }

    fn prepare_for_batch(
        &mut self,
        _keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
    ) -> Result<(), VectorAggError> {
        self.output_keys.reserve(batch.total_rows());
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
        let column = batch.column(self.column.input_offset)?;
        match column {
            ColumnView::Scalar { value, is_null } => {
                // Every row has the same key, so probe once.
                if !value.fits(&self.column.data_type) {
                    return Err(self.shape_error(column));
                }
                let key_index = if *is_null {
                    keys.null_key()?
                } else {
                    let bits = value.fixed_bits().ok_or_else(|| self.shape_error(column))?;
                    self.lookup(keys, K::from_bits(bits))?
                };
                with_validity!(filter, |filter| Self::fill_scalar(
                    key_index,
                    filter,
                    rows,
                    key_index_for_row
                ));
                Ok(())
            }
            ColumnView::Fixed { values, validity } => {
                let values = K::slice(*values).ok_or_else(|| self.shape_error(column))?;
                with_validity!(*validity, |valid| with_validity!(filter, |filter| self
                    .fill_column(keys, values, valid, filter, rows, key_index_for_row)))
            }
            _ => Err(self.shape_error(column)),
        }
    }

    fn size_bytes(&self) -> usize {
        self.table.capacity() * (size_of::<HashedKey<K>>() + size_of::<u32>())
            + self.output_keys.capacity() * size_of::<K>()
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
        let value = self
            .output_keys
            .get(key_index as usize)
            .and_then(|key| Datum::from_fixed_bits(&self.column.data_type, key.to_bits()))
            .ok_or_else(|| {
                VectorAggError::shape(format!(
                    "no {} key for index {key_index}",
                    self.explain_name()
                ))
            })?;
        out.set(self.column.output_offset, value)
    }
}
