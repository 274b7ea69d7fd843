//! Execution node driving a [`GroupingPolicyHash`] from a child batch
//! source.
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
    column::DecompressedBatch,
    config::VectorAggConfig,
    error::VectorAggError,
    function::AggregateDefinition,
    grouping_policy::GroupingPolicyHash,
    hashing::GroupingColumn,
    output::OutputRow,
};
use log::info;
use num_format::{Locale, ToFormattedString};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// The scan feeding the node with decompressed batches.
#[cfg_attr(test, mockall::automock)]
pub trait BatchSource: Send {
    /// The next batch, or `None` once the scan is exhausted.
    ///
    /// # Errors
    /// If the scan fails.
    fn next_batch(&mut self) -> Result<Option<DecompressedBatch>, VectorAggError>;
}

impl BatchSource for std::vec::IntoIter<DecompressedBatch> {
    fn next_batch(&mut self) -> Result<Option<DecompressedBatch>, VectorAggError> {
        Ok(self.next())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Accumulating,
    Emitting { child_exhausted: bool },
    Done,
}

/// Pulls batches from its child into the grouping policy until the child is
/// exhausted or the policy asks to spill, then streams the groups. After a
/// spill the policy is reset and accumulation resumes.
pub struct VectorAggNode {
    policy: GroupingPolicyHash,
    child: Box<dyn BatchSource>,
    state: NodeState,
    output: OutputRow,
    max_batch_rows: usize,
    cancelled: Arc<AtomicBool>,
    input_batches: usize,
    emitted_rows: usize,
    spills: usize,
}

impl std::fmt::Debug for VectorAggNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorAggNode")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("input_batches", &self.input_batches)
            .finish_non_exhaustive()
    }
}

fn check_slot(slot: usize, width: usize) -> Result<(), VectorAggError> {
    if slot < width {
        Ok(())
    } else {
        Err(VectorAggError::OutputSlotOutOfRange { slot, width })
    }
}

impl VectorAggNode {
    /// Create a node writing rows of `output_width` slots.
    ///
    /// # Errors
    /// If an output offset lies outside the row or the grouping columns are
    /// not supported.
    pub fn init(
        agg_defs: Vec<AggregateDefinition>,
        grouping_cols: &[GroupingColumn],
        child: Box<dyn BatchSource>,
        config: VectorAggConfig,
        output_width: usize,
    ) -> Result<Self, VectorAggError> {
        for def in &agg_defs {
            check_slot(def.output_offset, output_width)?;
        }
        for column in grouping_cols {
            check_slot(column.output_offset, output_width)?;
        }
        info!("Vectorised aggregation configured with {config}");
        let max_batch_rows = config.max_batch_rows();
        Ok(Self {
            policy: GroupingPolicyHash::new(agg_defs, grouping_cols, config)?,
            child,
            state: NodeState::Accumulating,
            output: OutputRow::new(output_width),
            max_batch_rows,
            cancelled: Arc::new(AtomicBool::new(false)),
            input_batches: 0,
            emitted_rows: 0,
            spills: 0,
        })
    }

    /// Flag that stops the node at its next batch or row.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// The next result row, or `None` when every group has been emitted.
    ///
    /// # Errors
    /// If the child fails, a batch is malformed or too large, a kernel fails
    /// or the query was cancelled.
    pub fn next_output(&mut self) -> Result<Option<&OutputRow>, VectorAggError> {
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(VectorAggError::Cancelled);
            }
            match self.state {
                NodeState::Done => return Ok(None),
                NodeState::Accumulating => self.accumulate()?,
                NodeState::Emitting { child_exhausted } => {
                    if self.policy.emit_next(&mut self.output)? {
                        self.emitted_rows += 1;
                        return Ok(Some(&self.output));
                    }
                    self.policy.reset();
                    self.state = if child_exhausted {
                        info!(
                            "Aggregated {} batches into {} rows with {} spills",
                            self.input_batches.to_formatted_string(&Locale::en),
                            self.emitted_rows.to_formatted_string(&Locale::en),
                            self.spills
                        );
                        NodeState::Done
                    } else {
                        NodeState::Accumulating
                    };
                }
            }
        }
    }

    fn accumulate(&mut self) -> Result<(), VectorAggError> {
        let Some(batch) = self.child.next_batch()? else {
            self.state = NodeState::Emitting {
                child_exhausted: true,
            };
            return Ok(());
        };
        if batch.total_rows() > self.max_batch_rows {
            return Err(VectorAggError::shape(format!(
                "child batch of {} rows exceeds the configured maximum of {}",
                batch.total_rows(),
                self.max_batch_rows
            )));
        }
        self.policy.add_batch(&batch.view()?)?;
        self.input_batches += 1;
        if self.policy.should_emit() {
            self.spills += 1;
            info!(
                "Spilling {} partial groups after {} batches",
                self.policy.last_used_key_index().to_formatted_string(&Locale::en),
                self.input_batches.to_formatted_string(&Locale::en)
            );
            self.state = NodeState::Emitting {
                child_exhausted: false,
            };
        }
        Ok(())
    }

    /// Pull every remaining row.
    ///
    /// # Errors
    /// See [`VectorAggNode::next_output`].
    pub fn collect_rows(&mut self) -> Result<Vec<OutputRow>, VectorAggError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_output()? {
            rows.push(row.clone());
        }
        Ok(rows)
    }

    #[must_use]
    pub fn explain(&self) -> String {
        format!("hashed with {} key", self.policy.explain())
    }

    /// Number of times partial results were emitted before the child was
    /// exhausted.
    #[must_use]
    pub fn spills(&self) -> usize {
        self.spills
    }
}
