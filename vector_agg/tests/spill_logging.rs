//! Log capture installs its own logger, so these tests live apart from the
//! `test_log` based ones.
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
use color_eyre::eyre::Error;
use log::Level;
use vector_agg::{
    AggregateDefinition, DecompressedBatch, GroupingColumn, VectorAggConfig,
    VectorAggConfigBuilder, VectorAggNode,
};
use vector_agg_test_util::*;

fn info_lines(captured_logs: &[testing_logger::CapturedLog]) -> Vec<String> {
    captured_logs
        .iter()
        .filter(|log| log.level == Level::Info)
        .map(|log| log.body.clone())
        .collect()
}

#[test]
fn should_log_configuration_emission_and_summary() -> Result<(), Error> {
    // Given
    testing_logger::setup();
    let batch =
        DecompressedBatch::from_arrays(&[text_array(&[Some("a"), Some("b"), Some("a")])])?;
    let mut node = VectorAggNode::init(
        vec![AggregateDefinition::new("count", None, 1)?],
        &[GroupingColumn::new(0, 0, DataType::Utf8)],
        Box::new(vec![batch].into_iter()),
        VectorAggConfig::default(),
        2,
    )?;

    // When
    let rows = node.collect_rows()?;

    // Then
    assert_eq!(rows.len(), 2);
    testing_logger::validate(|captured_logs| {
        assert_eq!(
            info_lines(captured_logs),
            vec![
                "Vectorised aggregation configured with spill at 524,288 bytes, 1,000 initial states, dictionary hashing on, batches up to 1000 rows",
                "Emitting 2 groups (1.5 rows per key) with single text key from 3 rows, 3 qualifying, 0 bulk filtered, 0 consecutive keys",
                "Aggregated 1 batches into 2 rows with 0 spills",
            ]
        );
    });
    Ok(())
}

#[test]
fn should_log_every_spill() -> Result<(), Error> {
    // Given
    testing_logger::setup();
    let keys = (0..1000).map(Some).collect::<Vec<_>>();
    let batches = keys
        .chunks(100)
        .map(|chunk| DecompressedBatch::from_arrays(&[int_array(chunk)]))
        .collect::<Result<Vec<_>, _>>()?;
    let config = VectorAggConfigBuilder::new()
        .spill_size_bytes(1024)
        .build()?;
    let mut node = VectorAggNode::init(
        vec![AggregateDefinition::new("count", None, 1)?],
        &[GroupingColumn::new(0, 0, DataType::Int32)],
        Box::new(batches.into_iter()),
        config,
        2,
    )?;

    // When
    let rows = node.collect_rows()?;

    // Then
    assert_eq!(rows.len(), 1000);
    let spills = node.spills();
    assert!(spills > 0);
    testing_logger::validate(|captured_logs| {
        let lines = info_lines(captured_logs);
        let spill_lines = lines
            .iter()
            .filter(|line| {
                line.starts_with("Spilling ") && line.contains(" partial groups after ")
            })
            .count();
        let emit_lines = lines
            .iter()
            .filter(|line| line.starts_with("Emitting "))
            .count();
        assert_eq!(spill_lines, spills);
        assert_eq!(emit_lines, spills + 1);
        assert_eq!(
            lines.last().map(String::as_str),
            Some(format!("Aggregated 10 batches into 1,000 rows with {spills} spills").as_str())
        );
    });
    Ok(())
}
