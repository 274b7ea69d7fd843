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
use super::{Fingerprinter, GroupingColumn, HashingStrategy, KeyIndexSpace};
use crate::{
    arena::{Arena, ArenaSlice},
    bitmap::{self, RowValidity, with_validity},
    column::{Batch, ColumnView},
    datum::{Datum, is_text},
    error::VectorAggError,
    output::OutputRow,
};
use bytes::Bytes;
use hashbrown::{HashTable, hash_table::Entry};
use std::ops::Range;

/// Grouping by any number of columns through a canonical byte form of the
/// whole key.
///
/// A serialized key starts with one validity bit per grouping column, packed
/// into `ceil(n / 8)` bytes with a set bit meaning the value is present.
/// Present values follow in column order: fixed-width values as their
/// little-endian bytes, text as a little-endian `u32` length and the bytes.
/// Null grouping values are part of the key, so there is no separate null
/// key.
#[derive(Debug)]
pub struct SerializedStrategy {
    columns: Vec<GroupingColumn>,
    fingerprinter: Fingerprinter,
    table: HashTable<u32>,
    /// Hash of every key index, used when the table grows.
    key_hashes: Vec<u64>,
    key_arena: Arena,
    output_keys: Vec<ArenaSlice>,
    scratch: Vec<u8>,
}

impl SerializedStrategy {
    #[must_use]
    pub fn new(columns: Vec<GroupingColumn>) -> Self {
        Self {
            columns,
            fingerprinter: Fingerprinter::default(),
            table: HashTable::new(),
            key_hashes: vec![0],
            key_arena: Arena::new(),
            output_keys: vec![ArenaSlice::default()],
            scratch: Vec::new(),
        }
    }

    fn prefix_bytes(&self) -> usize {
        self.columns.len().div_ceil(8)
    }

    fn check_view(column: &GroupingColumn, view: &ColumnView<'_>) -> Result<(), VectorAggError> {
        let matches = match view {
            ColumnView::Scalar { value, .. } => value.fits(&column.data_type),
            ColumnView::Fixed { values, .. } => column.value_bytes() == Some(values.width_bytes()),
            ColumnView::Text { .. } | ColumnView::TextDict { .. } => is_text(&column.data_type),
            ColumnView::Unsupported(_) => false,
        };
        if matches {
            Ok(())
        } else {
            Err(VectorAggError::shape(format!(
                "serialized key column {} of type {} has decompression type {:?}",
                column.input_offset,
                column.data_type,
                view.decompression_type()
            )))
        }
    }

    /// Write the canonical form of one row's key into `out`.
    fn serialize_row(
        views: &[ColumnView<'_>],
        prefix_bytes: usize,
        row: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), VectorAggError> {
        out.clear();
        out.resize(prefix_bytes, 0);
        for (position, view) in views.iter().enumerate() {
            let present = match view {
                ColumnView::Scalar { value, is_null } => {
                    if *is_null {
                        false
                    } else if let Some(text) = value.as_text() {
                        write_text(out, text)?;
                        true
                    } else if let Some(bits) = value.fixed_bits() {
                        let width = value_width(value);
                        out.extend_from_slice(&bits.to_le_bytes()[..width]);
                        true
                    } else {
                        false
                    }
                }
                ColumnView::Fixed { values, validity } => {
                    let present = bitmap::row_is_valid(*validity, row);
                    if present {
                        let bytes = values.bits(row).to_le_bytes();
                        out.extend_from_slice(&bytes[..values.width_bytes()]);
                    }
                    present
                }
                ColumnView::Text { validity, .. } | ColumnView::TextDict { validity, .. } => {
                    let present = bitmap::row_is_valid(*validity, row);
                    if present {
                        write_text(out, view.text(row).unwrap_or_default())?;
                    }
                    present
                }
                ColumnView::Unsupported(_) => false,
            };
            if present {
                out[position / 8] |= 1 << (position % 8);
            }
        }
        Ok(())
    }

    fn lookup(&mut self, keys: &mut KeyIndexSpace) -> Result<u32, VectorAggError> {
        let Self {
            fingerprinter,
            table,
            key_hashes,
            key_arena,
            output_keys,
            scratch,
            ..
        } = self;
        let hash = fingerprinter.hash(scratch);
        let entry = table.entry(
            hash,
            |&key_index| {
                key_hashes[key_index as usize] == hash
                    && key_arena.get(output_keys[key_index as usize]) == scratch.as_slice()
            },
            |&key_index| key_hashes[key_index as usize],
        );
        match entry {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let key_index = keys.next_key_index()?;
                entry.insert(key_index);
                let slot = key_index as usize;
                if output_keys.len() <= slot {
                    output_keys.resize(slot + 1, ArenaSlice::default());
                    key_hashes.resize(slot + 1, 0);
                }
                output_keys[slot] = key_arena.alloc_copy(scratch);
                key_hashes[slot] = hash;
                Ok(key_index)
            }
        }
    }

    #[inline(always)]
    fn fill_rows<F: RowValidity>(
        &mut self,
        keys: &mut KeyIndexSpace,
        views: &[ColumnView<'_>],
        filter: F,
        rows: Range<usize>,
        key_index_for_row: &mut [u32],
    ) -> Result<(), VectorAggError> {
        let prefix_bytes = self.prefix_bytes();
        for row in rows {
            if !filter.is_valid(row) {
                continue;
            }
            Self::serialize_row(views, prefix_bytes, row, &mut self.scratch)?;
            key_index_for_row[row] = self.lookup(keys)?;
        }
        Ok(())
    }
}

fn value_width(value: &Datum) -> usize {
    match value {
        Datum::Int16(_) => 2,
        Datum::Int32(_) | Datum::Float32(_) | Datum::Date32(_) => 4,
        _ => 8,
    }
}

fn write_text(out: &mut Vec<u8>, text: &[u8]) -> Result<(), VectorAggError> {
    let len = u32::try_from(text.len())
        .map_err(|_| VectorAggError::shape("text key longer than u32::MAX bytes"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(text);
    Ok(())
}

/// Reads values back out of a serialized key.
struct KeyReader<'a> {
    bytes: &'a [u8],
}

impl<'a> KeyReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], VectorAggError> {
        if self.bytes.len() < len {
            return Err(VectorAggError::shape("truncated serialized key"));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn read_fixed(&mut self, width: usize) -> Result<i64, VectorAggError> {
        let raw = self.take(width)?;
        let bits = match *raw {
            [a, b] => i64::from(i16::from_le_bytes([a, b])),
            [a, b, c, d] => i64::from(i32::from_le_bytes([a, b, c, d])),
            [a, b, c, d, e, f, g, h] => i64::from_le_bytes([a, b, c, d, e, f, g, h]),
            _ => return Err(VectorAggError::shape(format!("bad key width {width}"))),
        };
        Ok(bits)
    }

    fn read_text(&mut self) -> Result<&'a [u8], VectorAggError> {
        let raw = self.take(size_of::<u32>())?;
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        self.take(len as usize)
    }
}

impl HashingStrategy for SerializedStrategy {
    fn explain_name(&self) -> &'static str {
        "serialized"
    }

    fn reset(&mut self) {
        self.table = HashTable::new();
        self.key_hashes = vec![0];
        self.key_arena.reset();
        self.output_keys = vec![ArenaSlice::default()];
        self.scratch = Vec::new();
    }

    fn prepare_for_batch(
        &mut self,
        _keys: &mut KeyIndexSpace,
        batch: &Batch<'_>,
    ) -> Result<(), VectorAggError> {
        for column in &self.columns {
            Self::check_view(column, batch.column(column.input_offset)?)?;
        }
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
        let views = self
            .columns
            .iter()
            .map(|column| {
                let view = *batch.column(column.input_offset)?;
                Self::check_view(column, &view)?;
                Ok(view)
            })
            .collect::<Result<Vec<_>, VectorAggError>>()?;
        with_validity!(filter, |filter| self.fill_rows(
            keys,
            &views,
            filter,
            rows,
            key_index_for_row
        ))
    }

    fn size_bytes(&self) -> usize {
        self.table.capacity() * size_of::<u32>()
            + self.key_hashes.capacity() * size_of::<u64>()
            + self.output_keys.capacity() * size_of::<ArenaSlice>()
            + self.key_arena.allocated_bytes()
    }

    fn emit_key(
        &self,
        _keys: &KeyIndexSpace,
        key_index: u32,
        out: &mut OutputRow,
    ) -> Result<(), VectorAggError> {
        let slice = self.output_keys.get(key_index as usize).ok_or_else(|| {
            VectorAggError::shape(format!("no serialized key for index {key_index}"))
        })?;
        let mut reader = KeyReader {
            bytes: self.key_arena.get(*slice),
        };
        let prefix = reader.take(self.prefix_bytes())?;
        for (position, column) in self.columns.iter().enumerate() {
            if prefix[position / 8] & (1 << (position % 8)) == 0 {
                out.set_null(column.output_offset)?;
                continue;
            }
            let value = match column.value_bytes() {
                Some(width) => {
                    let bits = reader.read_fixed(width)?;
                    Datum::from_fixed_bits(&column.data_type, bits).ok_or_else(|| {
                        VectorAggError::UnsupportedGroupingType {
                            data_type: column.data_type.clone(),
                        }
                    })?
                }
                None => Datum::Text(Bytes::copy_from_slice(reader.read_text()?)),
            };
            out.set(column.output_offset, value)?;
        }
        Ok(())
    }
}
