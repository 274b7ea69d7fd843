//! Decompressed batches and the column views the engine reads them through.
//!
//! A [`Batch`] borrows its buffers for the duration of one `add_batch` call.
//! [`DecompressedBatch`] is an owned batch built from Arrow arrays that hands
//! out such views.
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
    bitmap::{self, words_for_rows},
    datum::Datum,
    error::VectorAggError,
};
use arrow::{
    array::{Array, ArrayData, ArrayRef, BooleanArray},
    compute::prep_null_mask_filter,
    datatypes::DataType,
};
use std::{fmt::Debug, hash::Hash};

/// Largest number of rows in one batch.
pub const BATCH_MAX: usize = 1000;

/// How a column of a batch was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressionType {
    Invalid,
    Scalar,
    Width2,
    Width4,
    Width8,
    ArrowText,
    ArrowTextDict,
    Iterator,
}

/// Fixed-width by-value data, reinterpreted as signed integers of the
/// column's width. Floats keep their bit patterns.
#[derive(Debug, Clone, Copy)]
pub enum FixedValues<'a> {
    Width2(&'a [i16]),
    Width4(&'a [i32]),
    Width8(&'a [i64]),
}

impl FixedValues<'_> {
    #[must_use]
    pub fn width_bytes(&self) -> usize {
        match self {
            Self::Width2(_) => 2,
            Self::Width4(_) => 4,
            Self::Width8(_) => 8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Width2(values) => values.len(),
            Self::Width4(values) => values.len(),
            Self::Width8(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bits of one row, sign extended.
    #[must_use]
    pub fn bits(&self, row: usize) -> i64 {
        match self {
            Self::Width2(values) => i64::from(values[row]),
            Self::Width4(values) => i64::from(values[row]),
            Self::Width8(values) => values[row],
        }
    }
}

/// Variable-length text in Arrow layout: value `i` is
/// `data[offsets[i]..offsets[i + 1]]`.
#[derive(Debug, Clone, Copy)]
pub struct TextValues<'a> {
    pub offsets: &'a [i32],
    pub data: &'a [u8],
}

impl<'a> TextValues<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn value(&self, row: usize) -> &'a [u8] {
        &self.data[self.offsets[row] as usize..self.offsets[row + 1] as usize]
    }

    fn validate(&self, rows: usize) -> Result<(), VectorAggError> {
        if self.offsets.len() < rows + 1 {
            return Err(VectorAggError::shape(format!(
                "text column has {} offsets for {rows} rows",
                self.offsets.len()
            )));
        }
        let offsets = &self.offsets[..=rows];
        if offsets.first().is_some_and(|start| *start < 0)
            || offsets.windows(2).any(|pair| pair[0] > pair[1])
        {
            return Err(VectorAggError::shape("text offsets are not monotonic"));
        }
        if offsets
            .last()
            .is_some_and(|end| usize::try_from(*end).map_or(true, |end| end > self.data.len()))
        {
            return Err(VectorAggError::shape("text offsets exceed the data buffer"));
        }
        Ok(())
    }
}

/// One decoded column of a batch.
#[derive(Debug, Clone, Copy)]
pub enum ColumnView<'a> {
    Scalar {
        value: &'a Datum,
        is_null: bool,
    },
    Fixed {
        values: FixedValues<'a>,
        validity: Option<&'a [u64]>,
    },
    Text {
        values: TextValues<'a>,
        validity: Option<&'a [u64]>,
    },
    TextDict {
        indices: &'a [i16],
        dict: TextValues<'a>,
        validity: Option<&'a [u64]>,
    },
    Unsupported(DecompressionType),
}

impl<'a> ColumnView<'a> {
    #[must_use]
    pub fn scalar(value: &'a Datum) -> Self {
        Self::Scalar {
            value,
            is_null: value.is_null(),
        }
    }

    #[must_use]
    pub fn decompression_type(&self) -> DecompressionType {
        match self {
            Self::Scalar { .. } => DecompressionType::Scalar,
            Self::Fixed {
                values: FixedValues::Width2(_),
                ..
            } => DecompressionType::Width2,
            Self::Fixed {
                values: FixedValues::Width4(_),
                ..
            } => DecompressionType::Width4,
            Self::Fixed {
                values: FixedValues::Width8(_),
                ..
            } => DecompressionType::Width8,
            Self::Text { .. } => DecompressionType::ArrowText,
            Self::TextDict { .. } => DecompressionType::ArrowTextDict,
            Self::Unsupported(kind) => *kind,
        }
    }

    /// Validity bitmap of an Arrow column. Scalars have none.
    #[must_use]
    pub fn validity(&self) -> Option<&'a [u64]> {
        match self {
            Self::Fixed { validity, .. }
            | Self::Text { validity, .. }
            | Self::TextDict { validity, .. } => *validity,
            Self::Scalar { .. } | Self::Unsupported(_) => None,
        }
    }

    /// Text of a valid row in a text or dictionary column.
    #[must_use]
    pub fn text(&self, row: usize) -> Option<&'a [u8]> {
        match self {
            Self::Text { values, .. } => Some(values.value(row)),
            #[allow(clippy::cast_sign_loss)]
            Self::TextDict { indices, dict, .. } => Some(dict.value(indices[row] as usize)),
            Self::Scalar { value, .. } => value.as_text(),
            _ => None,
        }
    }

    fn validate(&self, rows: usize) -> Result<(), VectorAggError> {
        let words = words_for_rows(rows);
        if self.validity().is_some_and(|validity| validity.len() < words) {
            return Err(VectorAggError::shape(format!(
                "validity bitmap shorter than {rows} rows"
            )));
        }
        match self {
            Self::Fixed { values, .. } if values.len() < rows => Err(VectorAggError::shape(
                format!("fixed-width column has {} values for {rows} rows", values.len()),
            )),
            Self::Text { values, .. } => values.validate(rows),
            Self::TextDict {
                indices,
                dict,
                validity,
            } => {
                if indices.len() < rows {
                    return Err(VectorAggError::shape(format!(
                        "dictionary column has {} indices for {rows} rows",
                        indices.len()
                    )));
                }
                dict.validate(dict.len())?;
                let dict_len = dict.len();
                let out_of_range = (0..rows).any(|row| {
                    bitmap::row_is_valid(*validity, row)
                        && usize::try_from(indices[row]).map_or(true, |index| index >= dict_len)
                });
                if out_of_range {
                    return Err(VectorAggError::shape(format!(
                        "dictionary index out of range for dictionary of {dict_len} entries"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Signed integer types used as fixed-width keys and raw value slices.
pub trait FixedKey: Copy + Eq + Hash + Default + Debug + Send + Sync + 'static {
    const WIDTH: usize;

    fn slice(values: FixedValues<'_>) -> Option<&'_ [Self]>;

    fn to_bits(self) -> i64;

    fn from_bits(bits: i64) -> Self;
}

macro_rules! fixed_key {
    ($native:ty, $width:literal, $variant:ident) => {
        impl FixedKey for $native {
            const WIDTH: usize = $width;

            fn slice(values: FixedValues<'_>) -> Option<&'_ [Self]> {
                match values {
                    FixedValues::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn to_bits(self) -> i64 {
                i64::from(self)
            }

            #[allow(clippy::cast_possible_truncation)]
            fn from_bits(bits: i64) -> Self {
                bits as $native
            }
        }
    };
}
fixed_key!(i16, 2, Width2);
fixed_key!(i32, 4, Width4);
fixed_key!(i64, 8, Width8);

/// A borrowed batch: row count, one view per input column, the
/// qualification bitmap produced by the scan's vectorised quals and the
/// per-aggregate `FILTER` bitmaps.
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    total_rows: usize,
    columns: Vec<ColumnView<'a>>,
    qualification: Option<&'a [u64]>,
    agg_filters: Vec<Option<&'a [u64]>>,
}

impl<'a> Batch<'a> {
    /// Create a batch after checking its shape.
    ///
    /// # Errors
    /// If the batch is larger than [`BATCH_MAX`], a buffer is too short for
    /// the row count, text offsets are malformed or a valid row has an
    /// out-of-range dictionary index.
    pub fn try_new(
        total_rows: usize,
        columns: Vec<ColumnView<'a>>,
        qualification: Option<&'a [u64]>,
        agg_filters: Vec<Option<&'a [u64]>>,
    ) -> Result<Self, VectorAggError> {
        if total_rows > BATCH_MAX {
            return Err(VectorAggError::shape(format!(
                "batch of {total_rows} rows exceeds the maximum of {BATCH_MAX}"
            )));
        }
        let words = words_for_rows(total_rows);
        if qualification.is_some_and(|q| q.len() < words)
            || agg_filters.iter().flatten().any(|f| f.len() < words)
        {
            return Err(VectorAggError::shape(format!(
                "filter bitmap shorter than {total_rows} rows"
            )));
        }
        for column in &columns {
            column.validate(total_rows)?;
        }
        Ok(Self {
            total_rows,
            columns,
            qualification,
            agg_filters,
        })
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    #[must_use]
    pub fn qualification(&self) -> Option<&'a [u64]> {
        self.qualification
    }

    /// # Errors
    /// If there is no column at `offset`.
    pub fn column(&self, offset: usize) -> Result<&ColumnView<'a>, VectorAggError> {
        self.columns.get(offset).ok_or_else(|| {
            VectorAggError::shape(format!(
                "input offset {offset} out of range for batch of {} columns",
                self.columns.len()
            ))
        })
    }

    /// `FILTER` bitmap stored at `offset`; `None` means every row passes.
    ///
    /// # Errors
    /// If there is no filter slot at `offset`.
    pub fn agg_filter(&self, offset: usize) -> Result<Option<&'a [u64]>, VectorAggError> {
        self.agg_filters.get(offset).copied().ok_or_else(|| {
            VectorAggError::shape(format!(
                "filter offset {offset} out of range for batch of {} filters",
                self.agg_filters.len()
            ))
        })
    }
}

#[derive(Debug, Clone)]
enum DecompressedColumn {
    Scalar(Datum),
    Arrow {
        data: ArrayData,
        validity: Option<Vec<u64>>,
    },
    Unsupported(DecompressionType),
}

/// An owned batch built from Arrow arrays and scalars.
#[derive(Debug, Clone, Default)]
pub struct DecompressedBatch {
    total_rows: usize,
    columns: Vec<DecompressedColumn>,
    qualification: Option<Vec<u64>>,
    agg_filters: Vec<Option<Vec<u64>>>,
}

fn filter_words(filter: &BooleanArray) -> Vec<u64> {
    if filter.null_count() > 0 {
        bitmap::from_boolean_buffer(prep_null_mask_filter(filter).values())
    } else {
        bitmap::from_boolean_buffer(filter.values())
    }
}

impl DecompressedBatch {
    #[must_use]
    pub fn new(total_rows: usize) -> Self {
        Self {
            total_rows,
            ..Self::default()
        }
    }

    /// Build a batch with one Arrow column per array. The row count is taken
    /// from the first array.
    ///
    /// # Errors
    /// If the arrays differ in length.
    pub fn from_arrays(arrays: &[ArrayRef]) -> Result<Self, VectorAggError> {
        let total_rows = arrays.first().map_or(0, |array| array.len());
        if arrays.iter().any(|array| array.len() != total_rows) {
            return Err(VectorAggError::shape("arrays in a batch differ in length"));
        }
        Ok(arrays
            .iter()
            .fold(Self::new(total_rows), |batch, array| batch.with_array(array)))
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Append an Arrow column.
    #[must_use]
    pub fn with_array(mut self, array: &ArrayRef) -> Self {
        let data = array.to_data();
        let validity = data
            .nulls()
            .filter(|nulls| nulls.null_count() > 0)
            .map(|nulls| bitmap::from_boolean_buffer(nulls.inner()));
        self.columns
            .push(DecompressedColumn::Arrow { data, validity });
        self
    }

    /// Append a column holding one value for every row.
    #[must_use]
    pub fn with_scalar(mut self, value: impl Into<Datum>) -> Self {
        self.columns.push(DecompressedColumn::Scalar(value.into()));
        self
    }

    /// Append a column the engine cannot read.
    #[must_use]
    pub fn with_unsupported(mut self, kind: DecompressionType) -> Self {
        self.columns.push(DecompressedColumn::Unsupported(kind));
        self
    }

    /// Set the qualification bitmap. Null filter entries reject the row.
    #[must_use]
    pub fn with_qualification(mut self, filter: &BooleanArray) -> Self {
        self.qualification = Some(filter_words(filter));
        self
    }

    /// Append an aggregate `FILTER` bitmap slot; `None` lets every row pass.
    #[must_use]
    pub fn with_agg_filter(mut self, filter: Option<&BooleanArray>) -> Self {
        self.agg_filters.push(filter.map(filter_words));
        self
    }

    /// Borrow this batch as the engine's input view.
    ///
    /// # Errors
    /// If the batch shape is invalid (see [`Batch::try_new`]) or a dictionary
    /// column's values contain nulls.
    pub fn view(&self) -> Result<Batch<'_>, VectorAggError> {
        let columns = self
            .columns
            .iter()
            .map(|column| match column {
                DecompressedColumn::Scalar(value) => Ok(ColumnView::scalar(value)),
                DecompressedColumn::Arrow { data, validity } => {
                    arrow_view(data, validity.as_deref())
                }
                DecompressedColumn::Unsupported(kind) => Ok(ColumnView::Unsupported(*kind)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Batch::try_new(
            self.total_rows,
            columns,
            self.qualification.as_deref(),
            self.agg_filters.iter().map(Option::as_deref).collect(),
        )
    }
}

fn text_values(data: &ArrayData) -> TextValues<'_> {
    let offsets = data.buffer::<i32>(0);
    TextValues {
        offsets: &offsets[..offsets.len().min(data.len() + 1)],
        data: data.buffers()[1].as_slice(),
    }
}

fn arrow_view<'a>(
    data: &'a ArrayData,
    validity: Option<&'a [u64]>,
) -> Result<ColumnView<'a>, VectorAggError> {
    let rows = data.len();
    let view = match data.data_type() {
        DataType::Int16 => ColumnView::Fixed {
            values: FixedValues::Width2(&data.buffer::<i16>(0)[..rows]),
            validity,
        },
        DataType::Int32 | DataType::Float32 | DataType::Date32 => ColumnView::Fixed {
            values: FixedValues::Width4(&data.buffer::<i32>(0)[..rows]),
            validity,
        },
        DataType::Int64 | DataType::Float64 => ColumnView::Fixed {
            values: FixedValues::Width8(&data.buffer::<i64>(0)[..rows]),
            validity,
        },
        DataType::Utf8 => ColumnView::Text {
            values: text_values(data),
            validity,
        },
        DataType::Dictionary(key, value)
            if **key == DataType::Int16 && **value == DataType::Utf8 =>
        {
            let dict = &data.child_data()[0];
            if dict.null_count() > 0 {
                return Err(VectorAggError::shape("dictionary values contain nulls"));
            }
            ColumnView::TextDict {
                indices: &data.buffer::<i16>(0)[..rows],
                dict: text_values(dict),
                validity,
            }
        }
        _ => ColumnView::Unsupported(DecompressionType::Invalid),
    };
    Ok(view)
}
