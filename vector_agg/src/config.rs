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
use crate::column::BATCH_MAX;
use color_eyre::eyre::{Result, bail};
use num_format::{Locale, ToFormattedString};
use std::fmt::{Display, Formatter};

/// Default soft cap on hashing strategy memory before a spill is requested.
pub const DEFAULT_SPILL_SIZE_BYTES: usize = 512 * 1024;

/// Default number of aggregate states allocated up front.
pub const DEFAULT_INITIAL_STATE_ROWS: usize = 1000;

/// Tuning for the hash grouping policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorAggConfig {
    /// Strategy memory above which `should_emit` asks for a spill
    spill_size_bytes: usize,
    /// Aggregate state capacity after construction or reset
    initial_state_rows: usize,
    /// May the text strategy hash dictionaries instead of rows?
    dictionary_hashing: bool,
    /// Largest batch the node accepts from its child
    max_batch_rows: usize,
}

impl VectorAggConfig {
    #[must_use]
    pub fn spill_size_bytes(&self) -> usize {
        self.spill_size_bytes
    }

    #[must_use]
    pub fn initial_state_rows(&self) -> usize {
        self.initial_state_rows
    }

    #[must_use]
    pub fn dictionary_hashing(&self) -> bool {
        self.dictionary_hashing
    }

    #[must_use]
    pub fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }
}

impl Default for VectorAggConfig {
    fn default() -> Self {
        Self {
            spill_size_bytes: DEFAULT_SPILL_SIZE_BYTES,
            initial_state_rows: DEFAULT_INITIAL_STATE_ROWS,
            dictionary_hashing: true,
            max_batch_rows: BATCH_MAX,
        }
    }
}

impl Display for VectorAggConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "spill at {} bytes, {} initial states, dictionary hashing {}, batches up to {} rows",
            self.spill_size_bytes.to_formatted_string(&Locale::en),
            self.initial_state_rows.to_formatted_string(&Locale::en),
            if self.dictionary_hashing { "on" } else { "off" },
            self.max_batch_rows
        )
    }
}

/// Builder for `VectorAggConfig`.
#[derive(Debug, Clone)]
pub struct VectorAggConfigBuilder {
    spill_size_bytes: usize,
    initial_state_rows: usize,
    dictionary_hashing: bool,
    max_batch_rows: usize,
}

impl Default for VectorAggConfigBuilder {
    fn default() -> Self {
        let defaults = VectorAggConfig::default();
        Self {
            spill_size_bytes: defaults.spill_size_bytes,
            initial_state_rows: defaults.initial_state_rows,
            dictionary_hashing: defaults.dictionary_hashing,
            max_batch_rows: defaults.max_batch_rows,
        }
    }
}

impl VectorAggConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn spill_size_bytes(mut self, spill_size_bytes: usize) -> Self {
        self.spill_size_bytes = spill_size_bytes;
        self
    }

    #[must_use]
    pub fn initial_state_rows(mut self, initial_state_rows: usize) -> Self {
        self.initial_state_rows = initial_state_rows;
        self
    }

    #[must_use]
    pub fn dictionary_hashing(mut self, dictionary_hashing: bool) -> Self {
        self.dictionary_hashing = dictionary_hashing;
        self
    }

    #[must_use]
    pub fn max_batch_rows(mut self, max_batch_rows: usize) -> Self {
        self.max_batch_rows = max_batch_rows;
        self
    }

    /// Build the `VectorAggConfig`, consuming the builder and validating it.
    ///
    /// # Errors
    /// The spill size and initial state rows must be positive and the batch
    /// size must be between 1 and [`BATCH_MAX`].
    pub fn build(self) -> Result<VectorAggConfig> {
        self.validate()?;
        Ok(VectorAggConfig {
            spill_size_bytes: self.spill_size_bytes,
            initial_state_rows: self.initial_state_rows,
            dictionary_hashing: self.dictionary_hashing,
            max_batch_rows: self.max_batch_rows,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.spill_size_bytes == 0 {
            bail!("Spill size must be positive");
        }
        if self.initial_state_rows == 0 {
            bail!("Initial state rows must be positive");
        }
        if !(1..=BATCH_MAX).contains(&self.max_batch_rows) {
            bail!(
                "Maximum batch rows {} must be between 1 and {BATCH_MAX}",
                self.max_batch_rows
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_error;
    use test_log::test;

    #[test]
    fn should_build_defaults() -> Result<()> {
        // When
        let config = VectorAggConfigBuilder::new().build()?;

        // Then
        assert_eq!(config, VectorAggConfig::default());
        assert_eq!(config.spill_size_bytes(), 512 * 1024);
        assert_eq!(config.initial_state_rows(), 1000);
        assert!(config.dictionary_hashing());
        assert_eq!(config.max_batch_rows(), BATCH_MAX);
        Ok(())
    }

    #[test]
    fn should_override_settings() -> Result<()> {
        // When
        let config = VectorAggConfigBuilder::new()
            .spill_size_bytes(4096)
            .initial_state_rows(3)
            .dictionary_hashing(false)
            .max_batch_rows(64)
            .build()?;

        // Then
        assert_eq!(config.spill_size_bytes(), 4096);
        assert_eq!(config.initial_state_rows(), 3);
        assert!(!config.dictionary_hashing());
        assert_eq!(config.max_batch_rows(), 64);
        Ok(())
    }

    #[test]
    fn should_reject_zero_spill_size() {
        assert_error!(
            VectorAggConfigBuilder::new().spill_size_bytes(0).build(),
            "Spill size must be positive"
        );
    }

    #[test]
    fn should_reject_zero_initial_states() {
        assert_error!(
            VectorAggConfigBuilder::new().initial_state_rows(0).build(),
            "Initial state rows must be positive"
        );
    }

    #[test]
    fn should_reject_batch_size_above_maximum() {
        assert_error!(
            VectorAggConfigBuilder::new().max_batch_rows(1001).build(),
            "Maximum batch rows 1001 must be between 1 and 1000"
        );
    }

    #[test]
    fn should_display_formatted_numbers() {
        assert_eq!(
            VectorAggConfig::default().to_string(),
            "spill at 524,288 bytes, 1,000 initial states, dictionary hashing on, batches up to 1000 rows"
        );
    }
}
