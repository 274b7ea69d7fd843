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
use crate::{
    arena::{Arena, ArenaSlice},
    column::ColumnView,
    datum::Datum,
    error::KernelError,
};
use arrow::datatypes::DataType;
use bytes::Bytes;
use std::ops::Range;

/// `min`/`max` of text under byte-wise ordering. The current extreme of each
/// group is copied into the aggregate arena, reusing the group's slot when a
/// new extreme replaces it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMinMax<const MAX: bool>;

impl<const MAX: bool> TextMinMax<MAX> {
    fn function() -> &'static str {
        if MAX { "max" } else { "min" }
    }

    fn update(
        state: &mut Option<ArenaSlice>,
        value: &[u8],
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        let replace = match *state {
            None => true,
            Some(current) if MAX => arena.get(current) < value,
            Some(current) => value < arena.get(current),
        };
        if replace {
            if std::str::from_utf8(value).is_err() {
                return Err(KernelError::InvalidUtf8 {
                    function: Self::function(),
                });
            }
            *state = Some(match *state {
                Some(current) => arena.replace(current, value),
                None => arena.alloc_copy(value),
            });
        }
        Ok(())
    }
}

impl<const MAX: bool> AggregateFunction for TextMinMax<MAX> {
    type State = Option<ArenaSlice>;

    fn name(&self) -> &'static str {
        Self::function()
    }

    fn result_type(&self) -> DataType {
        DataType::Utf8
    }

    fn agg_scalar(
        &self,
        state: &mut Option<ArenaSlice>,
        value: &Datum,
        is_null: bool,
        _weight: u64,
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if is_null {
            return Ok(());
        }
        let value = value.as_text().ok_or(KernelError::TypeMismatch {
            function: Self::function(),
            expected: "text",
        })?;
        Self::update(state, value, arena)
    }

    fn agg_many_vector(
        &self,
        states: &mut [Option<ArenaSlice>],
        key_index_for_row: &[u32],
        filter: Option<&[u64]>,
        rows: Range<usize>,
        column: &ColumnView<'_>,
        arena: &mut Arena,
    ) -> Result<(), KernelError> {
        if !matches!(column, ColumnView::Text { .. } | ColumnView::TextDict { .. }) {
            return Err(KernelError::TypeMismatch {
                function: Self::function(),
                expected: "text",
            });
        }
        for_each_row(key_index_for_row, filter, rows, |row, key| {
            let value = column.text(row).unwrap_or_default();
            Self::update(&mut states[key as usize], value, arena)
        })
    }

    fn finalize(&self, state: &Option<ArenaSlice>, arena: &Arena) -> Result<Datum, KernelError> {
        Ok(state.map_or(Datum::Null, |slice| {
            Datum::Text(Bytes::copy_from_slice(arena.get(slice)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmap::from_bools,
        column::{FixedValues, TextValues},
        function::{AggregateStates, StateArray, tests::run_vector},
    };
    use color_eyre::eyre::Result;
    use test_log::test;

    #[test]
    fn should_find_text_min_and_max_per_group() -> Result<()> {
        // Given
        let offsets = [0, 4, 7, 11, 13, 13];
        let dict = TextValues {
            offsets: &offsets,
            data: b"pearfigkiwiab",
        };
        let column = ColumnView::Text {
            values: dict,
            validity: None,
        };
        let keys = [1, 1, 2, 2, 1];
        let filter = from_bools([true, true, true, true, true]);

        // When
        let mut min_states = StateArray::new(TextMinMax::<false>, 1);
        let mut max_states = StateArray::new(TextMinMax::<true>, 1);
        let min = run_vector(&mut min_states, &keys, &column, Some(&filter), 2)?;
        let max = run_vector(&mut max_states, &keys, &column, None, 2)?;

        // Then
        assert_eq!(min, vec![Datum::from(""), Datum::from("ab")]);
        assert_eq!(max, vec![Datum::from("pear"), Datum::from("kiwi")]);
        Ok(())
    }

    #[test]
    fn should_read_through_dictionary() -> Result<()> {
        // Given
        let offsets = [0, 1, 2];
        let indices = [1i16, 0, 1];
        let column = ColumnView::TextDict {
            indices: &indices,
            dict: TextValues {
                offsets: &offsets,
                data: b"xy",
            },
            validity: None,
        };

        // When
        let mut states = StateArray::new(TextMinMax::<false>, 1);
        let result = run_vector(&mut states, &[1, 2, 1], &column, None, 2)?;

        // Then
        assert_eq!(result, vec![Datum::from("y"), Datum::from("x")]);
        Ok(())
    }

    #[test]
    fn should_reject_invalid_utf8() {
        let offsets = [0, 2];
        let column = ColumnView::Text {
            values: TextValues {
                offsets: &offsets,
                data: &[0xff, 0xfe],
            },
            validity: None,
        };
        let result = run_vector(&mut StateArray::new(TextMinMax::<true>, 1), &[1], &column, None, 1);
        assert_eq!(result, Err(KernelError::InvalidUtf8 { function: "max" }));
    }

    #[test]
    fn should_reject_numeric_column() {
        let values = [1i32];
        let column = ColumnView::Fixed {
            values: FixedValues::Width4(&values),
            validity: None,
        };
        let result = run_vector(&mut StateArray::new(TextMinMax::<true>, 1), &[1], &column, None, 1);
        assert_eq!(
            result,
            Err(KernelError::TypeMismatch {
                function: "max",
                expected: "text"
            })
        );
    }

    #[test]
    fn should_bound_arena_for_ascending_input() -> Result<()> {
        // Given
        let mut states = StateArray::new(TextMinMax::<true>, 2);
        states.init(1, 1);
        let mut arena = Arena::new();

        // When
        for value in 0..10_000 {
            let text = Datum::from(format!("{value:08}").as_str());
            states.agg_scalar_range(&[1], None, 0..1, &text, false, &mut arena)?;
        }

        // Then
        assert_eq!(arena.used_bytes(), 8);
        assert_eq!(states.finalize(1, &arena)?, Datum::from("00009999"));
        Ok(())
    }

    #[test]
    fn should_ignore_null_scalar() -> Result<()> {
        let mut state = None;
        let mut arena = Arena::new();
        TextMinMax::<false>.agg_scalar(&mut state, &Datum::Null, true, 1, &mut arena)?;
        TextMinMax::<false>.agg_scalar(&mut state, &Datum::from("b"), false, 1, &mut arena)?;
        TextMinMax::<false>.agg_scalar(&mut state, &Datum::from("a"), false, 1, &mut arena)?;
        assert_eq!(TextMinMax::<false>.finalize(&state, &arena)?, Datum::from("a"));
        Ok(())
    }
}
