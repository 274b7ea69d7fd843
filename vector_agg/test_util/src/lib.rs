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
use arrow::{
    array::{ArrayRef, BooleanArray, DictionaryArray, Int32Array, StringArray},
    datatypes::{DataType, Int16Type},
};
use color_eyre::eyre::Error;
use rand::Rng;
use std::sync::Arc;
use vector_agg::{
    AggregateDefinition, Datum, DecompressedBatch, GroupingColumn, OutputRow, VectorAggConfig,
    VectorAggNode,
};

#[must_use]
pub fn int_array(values: &[Option<i32>]) -> ArrayRef {
    Arc::new(Int32Array::from(values.to_vec()))
}

#[must_use]
pub fn text_array(values: &[Option<&str>]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

#[must_use]
pub fn dict_array(values: &[Option<&str>]) -> ArrayRef {
    Arc::new(values.iter().copied().collect::<DictionaryArray<Int16Type>>())
}

#[must_use]
pub fn bools(values: &[bool]) -> BooleanArray {
    BooleanArray::from(values.to_vec())
}

/// Pull every row out of a node built from the given batches.
#[allow(clippy::missing_errors_doc)]
pub fn run_node(
    agg_defs: Vec<AggregateDefinition>,
    grouping_cols: &[GroupingColumn],
    batches: Vec<DecompressedBatch>,
    config: VectorAggConfig,
) -> Result<Vec<Vec<Datum>>, Error> {
    let width = grouping_cols.len() + agg_defs.len();
    let mut node = VectorAggNode::init(
        agg_defs,
        grouping_cols,
        Box::new(batches.into_iter()),
        config,
        width,
    )?;
    Ok(node
        .collect_rows()?
        .iter()
        .map(|row| row.values().to_vec())
        .collect())
}

/// Rows in a canonical order so results can be compared regardless of the
/// order groups were emitted in.
#[must_use]
pub fn sorted(rows: Vec<Vec<Datum>>) -> Vec<String> {
    let mut rows = rows
        .iter()
        .map(|row| format!("{row:?}"))
        .collect::<Vec<_>>();
    rows.sort();
    rows
}

/// Which grouping columns a generated batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyColumns {
    Int,
    Text,
    TextDict,
    IntAndText,
}

impl KeyColumns {
    #[must_use]
    pub fn grouping_columns(self) -> Vec<GroupingColumn> {
        match self {
            Self::Int => vec![GroupingColumn::new(0, 0, DataType::Int32)],
            Self::Text | Self::TextDict => vec![GroupingColumn::new(0, 0, DataType::Utf8)],
            Self::IntAndText => vec![
                GroupingColumn::new(0, 0, DataType::Int32),
                GroupingColumn::new(1, 1, DataType::Utf8),
            ],
        }
    }

    /// Input offset of the aggregate argument column.
    #[must_use]
    pub fn arg_offset(self) -> usize {
        self.grouping_columns().len()
    }
}

/// Aggregates understood by [`Generated::reference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAgg {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
}

impl RefAgg {
    /// The engine's definition of this aggregate over the int4 argument at
    /// `arg_offset`, optionally restricted by `FILTER` bitmap 0.
    #[allow(clippy::missing_errors_doc)]
    pub fn definition(
        self,
        arg_offset: usize,
        output_offset: usize,
        filtered: bool,
    ) -> Result<AggregateDefinition, Error> {
        let argument = Some((arg_offset, &DataType::Int32));
        let def = match self {
            Self::CountStar => AggregateDefinition::new("count", None, output_offset)?,
            Self::Count => AggregateDefinition::new("count", argument, output_offset)?,
            Self::Sum => AggregateDefinition::new("sum", argument, output_offset)?,
            Self::Min => AggregateDefinition::new("min", argument, output_offset)?,
            Self::Max => AggregateDefinition::new("max", argument, output_offset)?,
        };
        Ok(if filtered { def.with_filter(0) } else { def })
    }
}

/// Randomly generated input: every grouping column shape, one int4
/// argument, the qualification bitmap and one aggregate `FILTER`.
#[derive(Debug, Clone)]
pub struct Generated {
    pub int_keys: Vec<Option<i32>>,
    pub text_keys: Vec<Option<String>>,
    pub args: Vec<Option<i32>>,
    pub qualification: Vec<bool>,
    pub agg_filter: Vec<bool>,
}

impl Generated {
    pub fn random(rng: &mut impl Rng, rows: usize, cardinality: i32) -> Self {
        let int_keys = (0..rows)
            .map(|_| {
                let value = rng.random_range(0..cardinality);
                maybe_null(rng, value)
            })
            .collect();
        let text_keys = (0..rows)
            .map(|_| {
                let value = rng.random_range(0..cardinality);
                maybe_null(rng, value).map(|value| format!("k{value}"))
            })
            .collect();
        let args = (0..rows)
            .map(|_| {
                let value = rng.random_range(-1000..1000);
                maybe_null(rng, value)
            })
            .collect();
        Self {
            int_keys,
            text_keys,
            args,
            qualification: (0..rows).map(|_| rng.random_bool(0.8)).collect(),
            agg_filter: (0..rows).map(|_| rng.random_bool(0.5)).collect(),
        }
    }

    /// Redraw the qualification as 64-row words that either all pass, all
    /// fail or pass row by row at random.
    #[must_use]
    pub fn with_word_runs(mut self, rng: &mut impl Rng) -> Self {
        for word in self.qualification.chunks_mut(64) {
            match rng.random_range(0..3) {
                0 => word.fill(true),
                1 => word.fill(false),
                _ => word.iter_mut().for_each(|bit| *bit = rng.random_bool(0.5)),
            }
        }
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Split the rows into batches of at most `batch_rows`.
    #[allow(clippy::missing_errors_doc)]
    pub fn batches(
        &self,
        keys: KeyColumns,
        batch_rows: usize,
    ) -> Result<Vec<DecompressedBatch>, Error> {
        let mut batches = Vec::new();
        let mut start = 0;
        while start < self.len() {
            let end = (start + batch_rows).min(self.len());
            let text = self.text_keys[start..end]
                .iter()
                .map(Option::as_deref)
                .collect::<Vec<_>>();
            let mut arrays = match keys {
                KeyColumns::Int => vec![int_array(&self.int_keys[start..end])],
                KeyColumns::Text => vec![text_array(&text)],
                KeyColumns::TextDict => vec![dict_array(&text)],
                KeyColumns::IntAndText => {
                    vec![int_array(&self.int_keys[start..end]), text_array(&text)]
                }
            };
            arrays.push(int_array(&self.args[start..end]));
            batches.push(
                DecompressedBatch::from_arrays(&arrays)?
                    .with_qualification(&bools(&self.qualification[start..end]))
                    .with_agg_filter(Some(&bools(&self.agg_filter[start..end]))),
            );
            start = end;
        }
        Ok(batches)
    }

    /// Grouping key of every row as output values.
    #[must_use]
    pub fn key_rows(&self, keys: KeyColumns) -> Vec<Vec<Datum>> {
        let int = |row: usize| Datum::from(self.int_keys[row]);
        let text = |row: usize| Datum::from(self.text_keys[row].as_deref());
        (0..self.len())
            .map(|row| match keys {
                KeyColumns::Int => vec![int(row)],
                KeyColumns::Text | KeyColumns::TextDict => vec![text(row)],
                KeyColumns::IntAndText => vec![int(row), text(row)],
            })
            .collect()
    }

    /// Aggregate the rows one at a time, the way the engine should.
    #[must_use]
    pub fn reference(&self, keys: KeyColumns, aggs: &[(RefAgg, bool)]) -> Vec<Vec<Datum>> {
        let key_rows = self.key_rows(keys);
        let mut groups: Vec<(Vec<Datum>, Vec<usize>)> = Vec::new();
        for (row, key) in key_rows.into_iter().enumerate() {
            if !self.qualification[row] {
                continue;
            }
            match groups.iter_mut().find(|(group, _)| *group == key) {
                Some((_, rows)) => rows.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        groups
            .into_iter()
            .map(|(mut key, rows)| {
                for (agg, filtered) in aggs {
                    let selected = rows
                        .iter()
                        .copied()
                        .filter(|row| !filtered || self.agg_filter[*row])
                        .collect::<Vec<_>>();
                    key.push(self.reference_value(*agg, &selected));
                }
                key
            })
            .collect()
    }

    fn reference_value(&self, agg: RefAgg, rows: &[usize]) -> Datum {
        let values = rows.iter().filter_map(|row| self.args[*row]);
        match agg {
            RefAgg::CountStar => Datum::Int64(i64::try_from(rows.len()).unwrap_or(i64::MAX)),
            RefAgg::Count => Datum::Int64(i64::try_from(values.count()).unwrap_or(i64::MAX)),
            RefAgg::Sum => values
                .map(i64::from)
                .reduce(|a, b| a + b)
                .map_or(Datum::Null, Datum::Int64),
            RefAgg::Min => Datum::from(values.min()),
            RefAgg::Max => Datum::from(values.max()),
        }
    }
}

/// One in ten generated values is null.
fn maybe_null<T>(rng: &mut impl Rng, value: T) -> Option<T> {
    if rng.random_bool(0.1) {
        None
    } else {
        Some(value)
    }
}

/// The values of an output row.
#[must_use]
pub fn values(row: &OutputRow) -> Vec<Datum> {
    row.values().to_vec()
}
