//! Error types for the vectorised aggregation engine.
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
use arrow::{datatypes::DataType, error::ArrowError};
use thiserror::Error;

/// Errors raised by the grouping policy, the hashing strategies and the
/// execution node.
#[derive(Error, Debug)]
pub enum VectorAggError {
    #[error("shape violation: {message}")]
    ShapeViolation { message: String },
    #[error("unsupported grouping column type {data_type}")]
    UnsupportedGroupingType { data_type: DataType },
    #[error("unsupported argument type {data_type} for {function}")]
    UnsupportedArgumentType {
        function: String,
        data_type: DataType,
    },
    #[error("unrecognised aggregation function name \"{name}\"")]
    UnrecognisedFunction { name: String },
    #[error("key index space exhausted after {last_used_key_index} keys")]
    KeyIndexOverflow { last_used_key_index: u32 },
    #[error("cannot add a batch while results are being emitted")]
    EmitInProgress,
    #[error("output slot {slot} is out of range for a row of width {width}")]
    OutputSlotOutOfRange { slot: usize, width: usize },
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("child scan failed: {0}")]
    Child(String),
    #[error("query cancelled")]
    Cancelled,
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl VectorAggError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::ShapeViolation {
            message: message.into(),
        }
    }
}

/// Failures reported by aggregate kernels. The engine forwards these without
/// translating them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{function} out of range")]
    Overflow { function: &'static str },
    #[error("invalid UTF-8 input to {function}")]
    InvalidUtf8 { function: &'static str },
    #[error("{function} expected {expected} input")]
    TypeMismatch {
        function: &'static str,
        expected: &'static str,
    },
}
