//! Output rows written by the grouping policy and their conversion to Arrow.
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
use crate::{datum::Datum, error::VectorAggError};
use arrow::{
    array::{
        ArrayRef, Date32Builder, Float32Builder, Float64Builder, Int16Builder, Int32Builder,
        Int64Builder, StringBuilder,
    },
    datatypes::{DataType, SchemaRef},
    record_batch::RecordBatch,
};
use std::sync::Arc;

/// The parent's result row: parallel value and null-flag slots. Grouping
/// columns and aggregates write into the slots named by their output
/// offsets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRow {
    values: Vec<Datum>,
    isnull: Vec<bool>,
}

impl OutputRow {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            values: vec![Datum::Null; width],
            isnull: vec![true; width],
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.values.len()
    }

    fn check_slot(&self, slot: usize) -> Result<(), VectorAggError> {
        if slot < self.values.len() {
            Ok(())
        } else {
            Err(VectorAggError::OutputSlotOutOfRange {
                slot,
                width: self.values.len(),
            })
        }
    }

    /// # Errors
    /// If `slot` is outside the row.
    pub fn set(&mut self, slot: usize, value: Datum) -> Result<(), VectorAggError> {
        self.check_slot(slot)?;
        self.isnull[slot] = value.is_null();
        self.values[slot] = value;
        Ok(())
    }

    /// # Errors
    /// If `slot` is outside the row.
    pub fn set_null(&mut self, slot: usize) -> Result<(), VectorAggError> {
        self.set(slot, Datum::Null)
    }

    #[must_use]
    pub fn value(&self, slot: usize) -> Option<&Datum> {
        self.values.get(slot)
    }

    #[must_use]
    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    #[must_use]
    pub fn isnull(&self) -> &[bool] {
        &self.isnull
    }
}

macro_rules! primitive_column {
    ($builder:ty, $rows:expr, $slot:expr, $variant:ident) => {{
        let mut builder = <$builder>::with_capacity($rows.len());
        for row in $rows {
            match row.value($slot) {
                Some(Datum::$variant(value)) => builder.append_value(*value),
                Some(Datum::Null) => builder.append_null(),
                other => return Err(type_mismatch($slot, other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

fn type_mismatch(slot: usize, value: Option<&Datum>) -> VectorAggError {
    VectorAggError::shape(format!(
        "output slot {slot} holds {value:?} which does not match the schema"
    ))
}

/// Materialise rows into a record batch. Field `i` of `schema` is read from
/// slot `i` of every row.
///
/// # Errors
/// If a slot is missing, a value does not match its field type, a field
/// type is unsupported or text is not valid UTF-8.
pub fn rows_to_record_batch(
    schema: SchemaRef,
    rows: &[OutputRow],
) -> Result<RecordBatch, VectorAggError> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (slot, field) in schema.fields().iter().enumerate() {
        let column = match field.data_type() {
            DataType::Int16 => primitive_column!(Int16Builder, rows, slot, Int16),
            DataType::Int32 => primitive_column!(Int32Builder, rows, slot, Int32),
            DataType::Int64 => primitive_column!(Int64Builder, rows, slot, Int64),
            DataType::Float32 => primitive_column!(Float32Builder, rows, slot, Float32),
            DataType::Float64 => primitive_column!(Float64Builder, rows, slot, Float64),
            DataType::Date32 => primitive_column!(Date32Builder, rows, slot, Date32),
            DataType::Utf8 => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match row.value(slot) {
                        Some(Datum::Text(bytes)) => builder.append_value(
                            std::str::from_utf8(bytes).map_err(|e| {
                                VectorAggError::shape(format!("output slot {slot}: {e}"))
                            })?,
                        ),
                        Some(Datum::Null) => builder.append_null(),
                        other => return Err(type_mismatch(slot, other)),
                    }
                }
                Arc::new(builder.finish()) as ArrayRef
            }
            other => {
                return Err(VectorAggError::shape(format!(
                    "cannot materialise output column of type {other}"
                )));
            }
        };
        columns.push(column);
    }
    Ok(RecordBatch::try_new(schema, columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_error;
    use arrow::{
        array::{AsArray, Int64Array, StringArray},
        datatypes::{Field, Int64Type, Schema},
    };
    use color_eyre::eyre::Result;
    use test_log::test;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, true),
            Field::new("total", DataType::Int64, true),
        ]))
    }

    #[test]
    fn should_set_values_and_nulls() -> Result<()> {
        // Given
        let mut row = OutputRow::new(2);

        // When
        row.set(0, Datum::from("a"))?;
        row.set(1, Datum::Int64(3))?;
        row.set_null(1)?;

        // Then
        assert_eq!(row.values(), &[Datum::from("a"), Datum::Null]);
        assert_eq!(row.isnull(), &[false, true]);
        Ok(())
    }

    #[test]
    fn should_reject_slot_outside_row() {
        let mut row = OutputRow::new(1);
        assert_error!(
            row.set(1, Datum::Int16(1)),
            "output slot 1 is out of range for a row of width 1"
        );
    }

    #[test]
    fn should_build_record_batch() -> Result<()> {
        // Given
        let mut first = OutputRow::new(2);
        first.set(0, Datum::from("x"))?;
        first.set(1, Datum::Int64(2))?;
        let mut second = OutputRow::new(2);
        second.set(1, Datum::Int64(5))?;

        // When
        let batch = rows_to_record_batch(schema(), &[first, second])?;

        // Then
        assert_eq!(batch.num_rows(), 2);
        let keys = batch.column(0).as_string::<i32>();
        assert_eq!(keys, &StringArray::from(vec![Some("x"), None]));
        let totals = batch.column(1).as_primitive::<Int64Type>();
        assert_eq!(totals, &Int64Array::from(vec![2, 5]));
        Ok(())
    }

    #[test]
    fn should_reject_value_of_wrong_type() -> Result<()> {
        let mut row = OutputRow::new(2);
        row.set(1, Datum::Float64(1.0))?;
        assert_error!(
            rows_to_record_batch(schema(), &[row]),
            "shape violation: output slot 1 holds Some(Float64(1.0)) which does not match the schema"
        );
        Ok(())
    }
}
