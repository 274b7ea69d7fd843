//! Kernels over fixed-width numeric arguments.
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
use super::{AggregateFunction, for_each_row, type_name};
use crate::{
    arena::Arena,
    column::{ColumnView, FixedKey},
    datum::Datum,
    error::KernelError,
};
use arrow::datatypes::DataType;
use num_traits::AsPrimitive;
use std::{fmt::Debug, marker::PhantomData, ops::Range};

/// A numeric argument type together with the integer type its column data
/// is stored as.
pub trait NumericArg:
    Copy + Default + Debug + PartialOrd + Send + Sync + AsPrimitive<f64> + 'static
{
    type Bits: FixedKey;

    fn data_type() -> DataType;

    fn from_raw(bits: Self::Bits) -> Self;

    fn from_datum(datum: &Datum) -> Option<Self>;

    fn into_datum(self) -> Datum;

    /// Strict "less than" under a total order. Floats use IEEE total order.
    fn total_lt(self, other: Self) -> bool;
}

macro_rules! int_arg {
    ($native:ty, $variant:ident) => {
        impl NumericArg for $native {
            type Bits = $native;

            fn data_type() -> DataType {
                DataType::$variant
            }

            fn from_raw(bits: Self) -> Self {
                bits
            }

            fn from_datum(datum: &Datum) -> Option<Self> {
                match datum {
                    Datum::$variant(value) => Some(*value),
                    _ => None,
                }
            }

            fn into_datum(self) -> Datum {
                Datum::$variant(self)
            }

            fn total_lt(self, other: Self) -> bool {
                self < other
            }
        }
    };
}
int_arg!(i16, Int16);
int_arg!(i32, Int32);
int_arg!(i64, Int64);

macro_rules! float_arg {
    ($native:ty, $bits:ty, $variant:ident) => {
        impl NumericArg for $native {
            type Bits = $bits;

            fn data_type() -> DataType {
                DataType::$variant
            }

            fn from_raw(bits: $bits) -> Self {
                <$native>::from_bits(bits.cast_unsigned())
            }

            fn from_datum(datum: &Datum) -> Option<Self> {
                match datum {
                    Datum::$variant(value) => Some(*value),
                    _ => None,
                }
            }

            fn into_datum(self) -> Datum {
                Datum::$variant(self)
            }

            fn total_lt(self, other: Self) -> bool {
                self.total_cmp(&other).is_lt()
            }
        }
    };
}
float_arg!(f32, i32, Float32);
float_arg!(f64, i64, Float64);

fn mismatch<T: NumericArg>(function: &'static str) -> KernelError {
    KernelError::TypeMismatch {
        function,
        expected: type_name(&T::data_type()),
    }
}

fn scalar_arg<T: NumericArg>(
    function: &'static str,
    value: &Datum,
    is_null: bool,
) -> Result<Option<T>, KernelError> {
    if is_null {
        return Ok(None);
    }
    T::from_datum(value)
        .map(Some)
        .ok_or_else(|| mismatch::<T>(function))
}

/// Fold each selected row's value into its group's state with `fold`.
fn fold_vector<T: NumericArg, S>(
    function: &'static str,
    states: &mut [S],
    key_index_for_row: &[u32],
    filter: Option<&[u64]>,
    rows: Range<usize>,
    column: &ColumnView<'_>,
    mut fold: impl FnMut(&mut S, T),
) -> Result<(), KernelError> {
    let values = match column {
        ColumnView::Fixed { values, .. } => T::Bits::slice(*values),
        _ => None,
    }
    .ok_or_else(|| mismatch::<T>(function))?;
    for_each_row(key_index_for_row, filter, rows, |row, key| {
        fold(&mut states[key as usize], T::from_raw(values[row]));
        Ok(())
    })
}

/// Integer accumulator with overflow detection.
pub trait SumAccumulator: Copy + Default + Debug + Send + 'static {
    fn checked_add_weighted(self, value: i64, weight: u64) -> Option<Self>;

    fn to_i64(self) -> Option<i64>;
}

impl SumAccumulator for i64 {
    fn checked_add_weighted(self, value: i64, weight: u64) -> Option<Self> {
        self.checked_add(value.checked_mul(i64::try_from(weight).ok()?)?)
    }

    fn to_i64(self) -> Option<i64> {
        Some(self)
    }
}

impl SumAccumulator for i128 {
    fn checked_add_weighted(self, value: i64, weight: u64) -> Option<Self> {
        self.checked_add(i128::from(value).checked_mul(i128::from(weight))?)
    }

    fn to_i64(self) -> Option<i64> {
        i64::try_from(self).ok()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntSumState<A> {
    sum: A,
    seen: bool,
    overflowed: bool,
}

impl<A: SumAccumulator> IntSumState<A> {
    fn add(&mut self, value: i64, weight: u64) {
        self.seen = true;
        match self.sum.checked_add_weighted(value, weight) {
            Some(sum) => self.sum = sum,
            None => self.overflowed = true,
        }
    }
}

/// `sum` of an integer argument, accumulated in `A`. An overflow is recorded
/// on the group and reported when it is finalised.
#[derive(Debug, Default)]
pub struct IntSum<T, A>(PhantomData<(T, A)>);

impl<T, A> AggregateFunction for IntSum<T, A>
where
    T: NumericArg + Into<i64>,
    A: SumAccumulator,
{
    type State = IntSumState<A>;

    fn name(&self) -> &'static str {
        "sum"
    }

    fn result_type(&self) -> DataType {
        DataType::Int64
    }

    fn agg_scalar(
        &self,
        state: &mut Self::State,
        value: &Datum,
        is_null: bool,
        weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if let Some(value) = scalar_arg::<T>("sum", value, is_null)? {
            state.add(value.into(), weight);
        }
        Ok(())
    }

    fn agg_many_vector(
        &self,
        states: &mut [Self::State],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        fold_vector(
            "sum",
            states,
            key_index_for_row,
            filter,
            rows,
            column,
            |state, value: T| state.add(value.into(), 1),
        )
    }

    fn finalize(&self, state: &Self::State, _arena: &Arena) -> Result<Datum, KernelError> {
        if !state.seen {
            return Ok(Datum::Null);
        }
        if state.overflowed {
            return Err(KernelError::Overflow { function: "sum" });
        }
        state
            .sum
            .to_i64()
            .map(Datum::Int64)
            .ok_or(KernelError::Overflow { function: "sum" })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FloatSumState {
    sum: f64,
    seen: bool,
}

/// `sum` of a float argument, accumulated in `f64`.
#[derive(Debug, Default)]
pub struct FloatSum<T>(PhantomData<T>);

#[allow(clippy::cast_precision_loss)]
fn weight_f64(weight: u64) -> f64 {
    weight as f64
}

impl<T: NumericArg> AggregateFunction for FloatSum<T> {
    type State = FloatSumState;

    fn name(&self) -> &'static str {
        "sum"
    }

    fn result_type(&self) -> DataType {
        DataType::Float64
    }

    fn agg_scalar(
        &self,
        state: &mut FloatSumState,
        value: &Datum,
        is_null: bool,
        weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if let Some(value) = scalar_arg::<T>("sum", value, is_null)? {
            state.sum += value.as_() * weight_f64(weight);
            state.seen = true;
        }
        Ok(())
    }

    fn agg_many_vector(
        &self,
        states: &mut [FloatSumState],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        fold_vector(
            "sum",
            states,
            key_index_for_row,
            filter,
            rows,
            column,
            |state, value: T| {
                state.sum += value.as_();
                state.seen = true;
            },
        )
    }

    fn finalize(&self, state: &FloatSumState, _arena: &Arena) -> Result<Datum, KernelError> {
        Ok(if state.seen {
            Datum::Float64(state.sum)
        } else {
            Datum::Null
        })
    }
}

/// `min` (`MAX == false`) or `max` (`MAX == true`) of a numeric argument.
#[derive(Debug, Default)]
pub struct MinMax<T, const MAX: bool>(PhantomData<T>);

impl<T: NumericArg, const MAX: bool> MinMax<T, MAX> {
    fn update(state: &mut Option<T>, value: T) {
        let replace = match *state {
            None => true,
            Some(current) if MAX => current.total_lt(value),
            Some(current) => value.total_lt(current),
        };
        if replace {
            *state = Some(value);
        }
    }

    fn function() -> &'static str {
        if MAX { "max" } else { "min" }
    }
}

impl<T: NumericArg, const MAX: bool> AggregateFunction for MinMax<T, MAX> {
    type State = Option<T>;

    fn name(&self) -> &'static str {
        Self::function()
    }

    fn result_type(&self) -> DataType {
        T::data_type()
    }

    fn agg_scalar(
        &self,
        state: &mut Option<T>,
        value: &Datum,
        is_null: bool,
        _weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if let Some(value) = scalar_arg::<T>(Self::function(), value, is_null)? {
            Self::update(state, value);
        }
        Ok(())
    }

    fn agg_many_vector(
        &self,
        states: &mut [Option<T>],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        fold_vector(
            Self::function(),
            states,
            key_index_for_row,
            filter,
            rows,
            column,
            Self::update,
        )
    }

    fn finalize(&self, state: &Option<T>, _arena: &Arena) -> Result<Datum, KernelError> {
        Ok(state.map_or(Datum::Null, NumericArg::into_datum))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AvgState {
    sum: f64,
    count: u64,
}

/// `avg` of a numeric argument as `f64`.
#[derive(Debug, Default)]
pub struct Avg<T>(PhantomData<T>);

impl<T: NumericArg> AggregateFunction for Avg<T> {
    type State = AvgState;

    fn name(&self) -> &'static str {
        "avg"
    }

    fn result_type(&self) -> DataType {
        DataType::Float64
    }

    fn agg_scalar(
        &self,
        state: &mut AvgState,
        value: &Datum,
        is_null: bool,
        weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if let Some(value) = scalar_arg::<T>("avg", value, is_null)? {
            state.sum += value.as_() * weight_f64(weight);
            state.count = state.count.saturating_add(weight);
        }
        Ok(())
    }

    fn agg_many_vector(
        &self,
        states: &mut [AvgState],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        fold_vector(
            "avg",
            states,
            key_index_for_row,
            filter,
            rows,
            column,
            |state, value: T| {
                state.sum += value.as_();
                state.count += 1;
            },
        )
    }

    fn finalize(&self, state: &AvgState, _arena: &Arena) -> Result<Datum, KernelError> {
        Ok(if state.count == 0 {
            Datum::Null
        } else {
            Datum::Float64(state.sum / weight_f64(state.count))
        })
    }
}
