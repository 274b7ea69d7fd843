//! Hashing strategies map grouping-key values of batch rows to dense key
//! indices.
//!
//! The grouping policy picks one strategy from the grouping columns when it
//! is created: a fixed-width strategy for a single 2, 4 or 8 byte column, the
//! text strategy for a single text column and the serialized strategy for
//! everything else. Each strategy then selects a specialised row loop per
//! batch depending on the column shape, its nullability and the filter.
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
    column::Batch,
    config::VectorAggConfig,
    datum::{fixed_width, is_text},
    error::VectorAggError,
    output::OutputRow,
};
use ahash::RandomState;
use arrow::datatypes::DataType;
use log::debug;
use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    ops::Range,
};

mod serialized;
mod single_fixed;
mod single_text;

pub use serialized::SerializedStrategy;
pub use single_fixed::SingleFixedStrategy;
pub use single_text::SingleTextStrategy;

/// A column the query groups by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingColumn {
    pub input_offset: usize,
    pub output_offset: usize,
    pub data_type: DataType,
}

impl GroupingColumn {
    #[must_use]
    pub fn new(input_offset: usize, output_offset: usize, data_type: DataType) -> Self {
        Self {
            input_offset,
            output_offset,
            data_type,
        }
    }

    /// Byte width of by-value types, `None` for variable-length ones.
    #[must_use]
    pub fn value_bytes(&self) -> Option<usize> {
        fixed_width(&self.data_type)
    }
}

/// The dense key index space of one generation. Index 0 is never assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIndexSpace {
    last_used_key_index: u32,
    null_key_index: u32,
}

impl KeyIndexSpace {
    #[must_use]
    pub fn last_used_key_index(&self) -> u32 {
        self.last_used_key_index
    }

    /// The index of the null group, or 0 if no row has had a null key yet.
    #[must_use]
    pub fn null_key_index(&self) -> u32 {
        self.null_key_index
    }

    /// Assign the next key index.
    ///
    /// # Errors
    /// If the index space is exhausted.
    pub fn next_key_index(&mut self) -> Result<u32, VectorAggError> {
        self.last_used_key_index = self.last_used_key_index.checked_add(1).ok_or(
            VectorAggError::KeyIndexOverflow {
                last_used_key_index: self.last_used_key_index,
            },
        )?;
        Ok(self.last_used_key_index)
    }

    /// The null group's index, assigning it on first use.
    ///
    /// # Errors
    /// If the index space is exhausted.
    pub fn null_key(&mut self) -> Result<u32, VectorAggError> {
        if self.null_key_index == 0 {
            self.null_key_index = self.next_key_index()?;
        }
        Ok(self.null_key_index)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[cfg(test)]
    pub(crate) fn starting_after(last_used_key_index: u32) -> Self {
        Self {
            last_used_key_index,
            null_key_index: 0,
        }
    }
}

/// One grouping-key specialisation. Strategies own their hash table and the
/// output form of every key they have assigned.
pub trait HashingStrategy: Debug + Send {
    /// Human readable name shown by `explain`.
    fn explain_name(&self) -> &'static str;

    /// Drop every key of the generation.
    fn reset(&mut self);

    /// Per-batch setup. May assign key indices, for example for the entries
    /// of a dictionary.
    ///
    /// # Errors
    /// If the grouping columns have an unexpected shape or the key index
    /// space is exhausted.
    fn prepare_for_batch(
        &mut self,
        keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
    ) -> Result<(), VectorAggError>;

    /// Write the key index of every row of `rows` passing `filter` into
    /// `key_index_for_row`, assigning new indices for unseen keys. Rows not
    /// passing the filter are left untouched.
    ///
    /// # Errors
    /// If the grouping columns have an unexpected shape or the key index
    /// space is exhausted.
    fn fill_offsets(
        &mut self,
        keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
        filter: Option<&[u64]>,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) -> Result<(), VectorAggError>;

    /// Approximate memory held for the keys of this generation.
    fn size_bytes(&self) -> usize;

    /// Write the grouping column values of `key_index` into `out`.
    ///
    /// # Errors
    /// If the key index was never assigned or an output slot is out of range.
    fn emit_key(
        &self,
        keys: &KeyIndexSpace,
        key_index: u32,
        out: &mut OutputRow,
    ) -> Result<(), VectorAggError>;
}

/// 64-bit avalanche mix used for fixed-width keys.
#[must_use]
pub fn hash64(x: u64) -> u64 {
    let mut x = x;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

/// A 128-bit fingerprint of variable-length key bytes. `hash` places the key
/// in the table and the pair identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: u64,
    pub rest: u64,
}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl nohash::IsEnabled for Fingerprint {}

/// Fixed-seed fingerprint function, so fingerprints are stable between
/// strategy instances.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    hash: RandomState,
    rest: RandomState,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self {
            hash: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
            rest: RandomState::with_seeds(
                0x4528_21e6_38d0_1377,
                0xbe54_66cf_34e9_0c6c,
                0xc0ac_29b7_c97c_50dd,
                0x3f84_d5b5_b547_0917,
            ),
        }
    }
}

impl Fingerprinter {
    #[must_use]
    pub fn fingerprint(&self, bytes: &[u8]) -> Fingerprint {
        Fingerprint {
            hash: self.hash.hash_one(bytes),
            rest: self.rest.hash_one(bytes),
        }
    }

    /// The table half of [`Fingerprinter::fingerprint`].
    #[must_use]
    pub fn hash(&self, bytes: &[u8]) -> u64 {
        self.hash.hash_one(bytes)
    }
}

fn check_supported(column: &GroupingColumn) -> Result<(), VectorAggError> {
    if column.value_bytes().is_some() || is_text(&column.data_type) {
        Ok(())
    } else {
        Err(VectorAggError::UnsupportedGroupingType {
            data_type: column.data_type.clone(),
        })
    }
}

/// Choose the hashing strategy for a set of grouping columns.
///
/// # Errors
/// If a grouping column has a type no strategy supports.
pub fn create_strategy(
    columns: &[GroupingColumn],
    config: &VectorAggConfig,
) -> Result<Box<dyn HashingStrategy>, VectorAggError> {
    for column in columns {
        check_supported(column)?;
    }
    let strategy: Box<dyn HashingStrategy> = match columns {
        [column] => match column.value_bytes() {
            Some(2) => Box::new(SingleFixedStrategy::<i16>::new(column.clone())),
            Some(4) => Box::new(SingleFixedStrategy::<i32>::new(column.clone())),
            Some(8) => Box::new(SingleFixedStrategy::<i64>::new(column.clone())),
            _ => Box::new(SingleTextStrategy::new(
                column.clone(),
                config.dictionary_hashing(),
            )),
        },
        _ => Box::new(SerializedStrategy::new(columns.to_vec())),
    };
    debug!(
        "Grouping by {} columns with {} key",
        columns.len(),
        strategy.explain_name()
    );
    Ok(strategy)
}
