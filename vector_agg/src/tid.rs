//! Compressed row addressing.
//!
//! A row decompressed from a compressed tuple is addressed by extending the
//! tuple's `(block, offset)` item pointer with the row's index inside the
//! tuple. The low 10 bits of the tuple index are stored in the top 10 bits of
//! the 32-bit block number, leaving 22 bits for the block itself. A tuple
//! index of 0 addresses a row that was never compressed.
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
use color_eyre::eyre::{Result, bail};

/// Largest block number that can carry a tuple index.
pub const MAX_BLOCK_NUMBER: u32 = 0x3F_FFFF;

const TUPLE_INDEX_BITS: u32 = 10;
const TUPLE_INDEX_MASK: u32 = (1 << TUPLE_INDEX_BITS) - 1;
const BLOCK_BITS: u32 = 32 - TUPLE_INDEX_BITS;

/// Item pointer of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemPointer {
    pub block_number: u32,
    pub offset_number: u16,
}

/// Place `tuple_index` into the block number of `tid`.
///
/// # Errors
/// If the block number does not fit in 22 bits or the tuple index exceeds
/// 10 bits.
pub fn encode(tid: ItemPointer, tuple_index: u32) -> Result<ItemPointer> {
    if tid.block_number > MAX_BLOCK_NUMBER {
        bail!(
            "Block number {} exceeds maximum {MAX_BLOCK_NUMBER} for compressed tuple ids",
            tid.block_number
        );
    }
    if tuple_index > TUPLE_INDEX_MASK {
        bail!("Tuple index {tuple_index} exceeds maximum {TUPLE_INDEX_MASK}");
    }
    Ok(ItemPointer {
        block_number: (tuple_index << BLOCK_BITS) | tid.block_number,
        offset_number: tid.offset_number,
    })
}

/// Split an encoded item pointer into the original pointer and the tuple
/// index.
#[must_use]
pub fn decode(tid: ItemPointer) -> (ItemPointer, u32) {
    (
        ItemPointer {
            block_number: tid.block_number & MAX_BLOCK_NUMBER,
            offset_number: tid.offset_number,
        },
        tid.block_number >> BLOCK_BITS,
    )
}
