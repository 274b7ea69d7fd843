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
use super::{AggregateFunction, for_each_row};
use crate::{arena::Arena, column::ColumnView, datum::Datum, error::KernelError};
use arrow::datatypes::DataType;
use std::ops::Range;

fn add_weight(count: i64, weight: u64) -> i64 {
    count.saturating_add(i64::try_from(weight).unwrap_or(i64::MAX))
}

/// `count(*)`: counts every selected row whatever the argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountStar;

impl AggregateFunction for CountStar {
    type State = i64;

    fn name(&self) -> &'static str {
        "count(*)"
    }

    fn result_type(&self) -> DataType {
        DataType::Int64
    }

    fn agg_scalar(
        &self,
        state: &mut i64,
        _value: &Datum,
        _is_null: bool,
        weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        *state = add_weight(*state, weight);
        Ok(())
    }

    fn supports_many_scalar(&self) -> bool {
        true
    }

    fn agg_many_scalar(
        &self,
        states: &mut [i64],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        _value: &Datum,
        _is_null: bool,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        for_each_row(key_index_for_row, filter, rows, |_, key| {
            states[key as usize] += 1;
            Ok(())
        })
    }

    fn agg_many_vector(
        &self,
        states: &mut [i64],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        _column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        for_each_row(key_index_for_row, filter, rows, |_, key| {
            states[key as usize] += 1;
            Ok(())
        })
    }

    fn finalize(&self, state: &i64, _arena: &Arena) -> Result<Datum, KernelError> {
        Ok(Datum::Int64(*state))
    }
}

/// `count(arg)`: counts selected rows with a non-null argument. Null
/// vector arguments are already removed by the combined filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl AggregateFunction for Count {
    type State = i64;

    fn name(&self) -> &'static str {
        "count"
    }

    fn result_type(&self) -> DataType {
        DataType::Int64
    }

    fn agg_scalar(
        &self,
        state: &mut i64,
        _value: &Datum,
        is_null: bool,
        weight: u64,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if !is_null {
            *state = add_weight(*state, weight);
        }
        Ok(())
    }

    fn agg_many_vector(
        &self,
        states: &mut [i64],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        _column: &ColumnView<'_>,
        _arena: &mut Arena,
    ) -> Result<(), KernelError> {
        for_each_row(key_index_for_row, filter, rows, |_, key| {
            states[key as usize] += 1;
            Ok(())
        })
    }

    fn finalize(&self, state: &i64, _arena: &Arena) -> Result<Datum, KernelError> {
        Ok(Datum::Int64(*state))
    }
}
