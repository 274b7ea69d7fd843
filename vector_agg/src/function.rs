//! Aggregate kernels and the type-erased state arrays the grouping policy
//! drives them through.
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
    bitmap::{RowValidity, with_validity},
    column::ColumnView,
    datum::Datum,
    error::{KernelError, VectorAggError},
};
use arrow::datatypes::DataType;
use std::{fmt::Debug, ops::Range};

mod count;
mod numeric;
mod text;

pub use count::{Count, CountStar};
pub use numeric::{Avg, FloatSum, IntSum, MinMax, NumericArg};
pub use text::TextMinMax;

/// One aggregate function: a per-group state layout plus the routines that
/// fold values into it and finalise it.
///
/// Every routine taking `key_index_for_row` skips rows whose key index is 0
/// or whose bit in `filter` is clear. The filter already includes the
/// argument's validity, so vector kernels never see null arguments.
pub trait AggregateFunction: Debug + Send + 'static {
    type State: Clone + Default + Debug + Send;

    fn name(&self) -> &'static str;

    fn result_type(&self) -> DataType;

    fn initial_state(&self) -> Self::State {
        Self::State::default()
    }

    /// Fold one value into one state `weight` times.
    ///
    /// # Errors
    /// If the value has the wrong type for this kernel.
    fn agg_scalar(
        &self,
        state: &mut Self::State,
        value: &Datum,
        is_null: bool,
        weight: u64,
        arena: &mut Arena,
    ) -> Result<(), KernelError>;

    /// Whether [`AggregateFunction::agg_many_scalar`] is better than calling
    /// [`AggregateFunction::agg_scalar`] row by row.
    fn supports_many_scalar(&self) -> bool {
        false
    }

    /// Fold a value broadcast to every row of `rows` into the rows' groups.
    ///
    /// # Errors
    /// If the value has the wrong type for this kernel.
    #[allow(clippy::too_many_arguments)]
    fn agg_many_scalar(
        &self,
        states: &mut [Self::State],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        value: &Datum,
        is_null: bool,
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        for_each_row(key_index_for_row, filter, rows, |_, key| {
            self.agg_scalar(&mut states[key as usize], value, is_null, 1, arena)
        })
    }

    /// Fold one column into the groups of its rows.
    ///
    /// # Errors
    /// If the column has the wrong type for this kernel.
    fn agg_many_vector(
        &self,
        states: &mut [Self::State],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        arena: &mut Arena,
    ) -> Result<(), KernelError>;

    /// Produce the aggregate result for one group.
    ///
    /// # Errors
    /// If the kernel recorded a failure on this state, such as an overflow.
    fn finalize(&self, state: &Self::State, arena: &Arena) -> Result<Datum, KernelError>;
}

/// Call `f(row, key_index)` for every row of `rows` with a non-zero key
/// index that passes `filter`. The loop is instantiated separately for the
/// filtered and unfiltered cases.
///
/// # Errors
/// The first error returned by `f`.
pub fn for_each_row<E>(
    key_index_for_row: &[u32],
    filter: Option<&[u64]>,
    rows: Range<usize>,
    mut f: impl FnMut(usize, u32) -> Result<(), E>,
) -> Result<(), E> {
    with_validity!(filter, |valid| for_each_row_impl(
        key_index_for_row,
        valid,
        rows,
        &mut f
    ))
}

#[inline(always)]
fn for_each_row_impl<V: RowValidity, E, F: FnMut(usize, u32) -> Result<(), E>>(
    key_index_for_row: &[u32],
    valid: V,
    rows: Range<usize>,
    f: &mut F,
) -> Result<(), E> {
    for row in rows {
        let key = key_index_for_row[row];
        if key != 0 && valid.is_valid(row) {
            f(row, key)?;
        }
    }
    Ok(())
}

/// The per-group state array of one aggregate, with its kernel's concrete
/// state type hidden. Index 0 is never used; index `k` holds the state of the
/// group with key index `k`.
pub trait AggregateStates: Debug + Send {
    fn name(&self) -> &'static str;

    fn result_type(&self) -> DataType;

    /// Size of one group's state.
    fn state_bytes(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Grow to at least `capacity` states. New states are not initialised.
    fn grow(&mut self, capacity: usize);

    /// Set `count` states starting at `first` to the kernel's initial state.
    fn init(&mut self, first: usize, count: usize);

    /// Fold an Arrow column.
    ///
    /// # Errors
    /// Forwarded from the kernel.
    fn agg_vector(
        &mut self,
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        arena: &mut Arena,
    ) -> Result<(), KernelError>;

    /// Fold a scalar argument, or nothing for `count(*)`, into every selected
    /// row's group.
    ///
    /// # Errors
    /// Forwarded from the kernel.
    fn agg_scalar_range(
        &mut self,
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        value: &Datum,
        is_null: bool,
        arena: &mut Arena,
    ) -> Result<(), KernelError>;

    /// # Errors
    /// Forwarded from the kernel.
    fn finalize(&self, key_index: u32, arena: &Arena) -> Result<Datum, KernelError>;

    /// Drop every state and start again with `capacity` uninitialised states.
    fn release(&mut self, capacity: usize);
}

/// State storage for a concrete kernel.
#[derive(Debug)]
pub struct StateArray<F: AggregateFunction> {
    function: F,
    states: Vec<F::State>,
}

impl<F: AggregateFunction> StateArray<F> {
    #[must_use]
    pub fn new(function: F, capacity: usize) -> Self {
        Self {
            function,
            states: vec![F::State::default(); capacity],
        }
    }
}

impl<F: AggregateFunction> AggregateStates for StateArray<F> {
    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn result_type(&self) -> DataType {
        self.function.result_type()
    }

    fn state_bytes(&self) -> usize {
        size_of::<F::State>()
    }

    fn capacity(&self) -> usize {
        self.states.len()
    }

    fn grow(&mut self, capacity: usize) {
        if capacity > self.states.len() {
            self.states.resize(capacity, F::State::default());
        }
    }

    fn init(&mut self, first: usize, count: usize) {
        self.states[first..first + count].fill(self.function.initial_state());
    }

    fn agg_vector(
        &mut self,
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        self.function.agg_many_vector(
            &mut self.states,
            key_index_for_row,
            filter,
            rows,
            column,
            arena,
        )
    }

    fn agg_scalar_range(
        &mut self,
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        value: &Datum,
        is_null: bool,
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if self.function.supports_many_scalar() {
            return self.function.agg_many_scalar(
                &mut self.states,
                key_index_for_row,
                filter,
                rows,
                value,
                is_null,
                arena,
            );
        }
        let function = &self.function;
        let states = &mut self.states;
        for_each_row(key_index_for_row, filter, rows, |_, key| {
            function.agg_scalar(&mut states[key as usize], value, is_null, 1, arena)
        })
    }

    fn finalize(&self, key_index: u32, arena: &Arena) -> Result<Datum, KernelError> {
        self.function
            .finalize(&self.states[key_index as usize], arena)
    }

    fn release(&mut self, capacity: usize) {
        self.states = vec![F::State::default(); capacity];
    }
}

/// Supported aggregating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl TryFrom<&str> for AggOp {
    type Error = VectorAggError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        match name.to_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            _ => Err(VectorAggError::UnrecognisedFunction {
                name: name.to_string(),
            }),
        }
    }
}

fn boxed<F: AggregateFunction>(function: F, capacity: usize) -> Box<dyn AggregateStates> {
    Box::new(StateArray::new(function, capacity))
}

fn unsupported(op: AggOp, data_type: &DataType) -> VectorAggError {
    VectorAggError::UnsupportedArgumentType {
        function: format!("{op:?}").to_lowercase(),
        data_type: data_type.clone(),
    }
}

/// Instantiate a kernel generic over the numeric argument type for each
/// supported numeric type.
macro_rules! numeric_states {
    ($op:expr, $arg_type:expr, $capacity:expr, |$native:ident| $make:expr) => {
        match $arg_type {
            DataType::Int16 => {
                type $native = i16;
                Ok(boxed($make, $capacity))
            }
            DataType::Int32 => {
                type $native = i32;
                Ok(boxed($make, $capacity))
            }
            DataType::Int64 => {
                type $native = i64;
                Ok(boxed($make, $capacity))
            }
            DataType::Float32 => {
                type $native = f32;
                Ok(boxed($make, $capacity))
            }
            DataType::Float64 => {
                type $native = f64;
                Ok(boxed($make, $capacity))
            }
            other => Err(unsupported($op, other)),
        }
    };
}

fn create_states(
    op: AggOp,
    arg_type: Option<&DataType>,
    capacity: usize,
) -> Result<Box<dyn AggregateStates>, VectorAggError> {
    let Some(arg_type) = arg_type else {
        return match op {
            AggOp::Count => Ok(boxed(CountStar, capacity)),
            _ => Err(VectorAggError::shape(format!(
                "{op:?} requires an argument"
            ))),
        };
    };
    match (op, arg_type) {
        (AggOp::Count, _) => Ok(boxed(Count, capacity)),
        (AggOp::Sum, DataType::Int16) => Ok(boxed(IntSum::<i16, i64>::default(), capacity)),
        (AggOp::Sum, DataType::Int32) => Ok(boxed(IntSum::<i32, i64>::default(), capacity)),
        (AggOp::Sum, DataType::Int64) => Ok(boxed(IntSum::<i64, i128>::default(), capacity)),
        (AggOp::Sum, DataType::Float32) => Ok(boxed(FloatSum::<f32>::default(), capacity)),
        (AggOp::Sum, DataType::Float64) => Ok(boxed(FloatSum::<f64>::default(), capacity)),
        (AggOp::Sum, other) => Err(unsupported(op, other)),
        (AggOp::Min, DataType::Utf8) => Ok(boxed(TextMinMax::<false>, capacity)),
        (AggOp::Max, DataType::Utf8) => Ok(boxed(TextMinMax::<true>, capacity)),
        (AggOp::Min, _) => {
            numeric_states!(op, arg_type, capacity, |T| MinMax::<T, false>::default())
        }
        (AggOp::Max, _) => {
            numeric_states!(op, arg_type, capacity, |T| MinMax::<T, true>::default())
        }
        (AggOp::Avg, _) => numeric_states!(op, arg_type, capacity, |T| Avg::<T>::default()),
    }
}

/// One aggregate of the query: its kernel state array, the batch column it
/// reads (none for `count(*)`), the output slot it writes and the optional
/// `FILTER` bitmap slot of the batch.
#[derive(Debug)]
pub struct AggregateDefinition {
    pub(crate) states: Box<dyn AggregateStates>,
    pub input_offset: Option<usize>,
    pub output_offset: usize,
    pub filter_offset: Option<usize>,
}

/// Initial state rows for definitions created outside a grouping policy. The
/// policy resizes them to its configured capacity.
const DEFAULT_STATE_ROWS: usize = 1;

impl AggregateDefinition {
    /// Create an aggregate from a function name and argument. `count` with no
    /// argument is `count(*)`.
    ///
    /// # Errors
    /// If the function name is unrecognised or the argument type is not
    /// supported by it.
    pub fn new(
        function: &str,
        argument: Option<(usize, &DataType)>,
        output_offset: usize,
    ) -> Result<Self, VectorAggError> {
        let op = AggOp::try_from(function)?;
        Ok(Self {
            states: create_states(
                op,
                argument.map(|(_, data_type)| data_type),
                DEFAULT_STATE_ROWS,
            )?,
            input_offset: argument.map(|(offset, _)| offset),
            output_offset,
            filter_offset: None,
        })
    }

    /// Create an aggregate from a kernel directly.
    pub fn with_function<F: AggregateFunction>(
        function: F,
        input_offset: Option<usize>,
        output_offset: usize,
    ) -> Self {
        Self {
            states: boxed(function, DEFAULT_STATE_ROWS),
            input_offset,
            output_offset,
            filter_offset: None,
        }
    }

    /// Only aggregate rows passing the batch's `FILTER` bitmap at
    /// `filter_offset`.
    #[must_use]
    pub fn with_filter(mut self, filter_offset: usize) -> Self {
        self.filter_offset = Some(filter_offset);
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.states.name()
    }

    #[must_use]
    pub fn result_type(&self) -> DataType {
        self.states.result_type()
    }
}

/// Argument type names used in kernel type-mismatch errors.
pub(crate) fn type_name(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Int16 => "int2",
        DataType::Int32 => "int4",
        DataType::Int64 => "int8",
        DataType::Float32 => "float4",
        DataType::Float64 => "float8",
        DataType::Utf8 => "text",
        _ => "unknown",
    }
}
