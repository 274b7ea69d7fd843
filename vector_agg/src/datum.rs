//! Typed single values.
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
use arrow::datatypes::DataType;
use bytes::Bytes;

/// One value of a supported column type. Used for scalar columns, for
/// grouping keys written to output rows and for finalised aggregates.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Datum {
    #[default]
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Date32(i32),
    Text(Bytes),
}

impl Datum {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Raw bit pattern of a fixed-width value, sign extended to 64 bits.
    /// Floats use their IEEE representation so equality on bits is exact.
    #[must_use]
    pub fn fixed_bits(&self) -> Option<i64> {
        match self {
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) | Self::Date32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::Float32(v) => Some(i64::from(v.to_bits().cast_signed())),
            Self::Float64(v) => Some(v.to_bits().cast_signed()),
            Self::Null | Self::Text(_) => None,
        }
    }

    /// Rebuild a value of the given type from [`Datum::fixed_bits`].
    #[must_use]
    pub fn from_fixed_bits(data_type: &DataType, bits: i64) -> Option<Self> {
        // Truncating casts undo the sign extension applied by fixed_bits
        #[allow(clippy::cast_possible_truncation)]
        let value = match data_type {
            DataType::Int16 => Self::Int16(bits as i16),
            DataType::Int32 => Self::Int32(bits as i32),
            DataType::Date32 => Self::Date32(bits as i32),
            DataType::Int64 => Self::Int64(bits),
            DataType::Float32 => Self::Float32(f32::from_bits((bits as i32).cast_unsigned())),
            DataType::Float64 => Self::Float64(f64::from_bits(bits.cast_unsigned())),
            _ => return None,
        };
        Some(value)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&[u8]> {
        match self {
            Self::Text(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether this value can be stored in a column of `data_type`. Null fits
    /// every type.
    #[must_use]
    pub fn fits(&self, data_type: &DataType) -> bool {
        matches!(
            (self, data_type),
            (Self::Null, _)
                | (Self::Int16(_), DataType::Int16)
                | (Self::Int32(_), DataType::Int32)
                | (Self::Int64(_), DataType::Int64)
                | (Self::Float32(_), DataType::Float32)
                | (Self::Float64(_), DataType::Float64)
                | (Self::Date32(_), DataType::Date32)
                | (Self::Text(_), DataType::Utf8)
        )
    }
}

/// Byte width of a fixed-width by-value type, `None` for variable-length and
/// unsupported types.
#[must_use]
pub fn fixed_width(data_type: &DataType) -> Option<usize> {
    match data_type {
        DataType::Int16 => Some(2),
        DataType::Int32 | DataType::Float32 | DataType::Date32 => Some(4),
        DataType::Int64 | DataType::Float64 => Some(8),
        _ => None,
    }
}

#[must_use]
pub fn is_text(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Utf8)
}

macro_rules! datum_from {
    ($($native:ty => $variant:ident),*) => {
        $(
            impl From<$native> for Datum {
                fn from(value: $native) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}
datum_from!(i16 => Int16, i32 => Int32, i64 => Int64, f32 => Float32, f64 => Float64);

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Self::Text(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
