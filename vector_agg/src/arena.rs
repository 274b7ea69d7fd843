//! Scoped bump arena for variable-length key and aggregate data.
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

/// Capacity kept across resets.
const RETAINED_BYTES: usize = 8 * 1024;

/// Handle to bytes copied into an [`Arena`]. Only meaningful for the arena
/// that produced it, until that arena's next [`Arena::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaSlice {
    start: usize,
    len: usize,
    /// Bytes reserved at `start`, at least `len`.
    capacity: usize,
}

impl ArenaSlice {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Append-only byte storage released wholesale on [`Arena::reset`].
#[derive(Debug, Default)]
pub struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_copy(&mut self, data: &[u8]) -> ArenaSlice {
        let start = self.bytes.len();
        self.bytes.extend_from_slice(data);
        ArenaSlice {
            start,
            len: data.len(),
            capacity: data.len(),
        }
    }

    /// Store `data` in place of `slice`, reusing its bytes when they are
    /// large enough. Otherwise a new slot of at least twice the old
    /// capacity is taken, so a value replaced over and over costs a bounded
    /// multiple of its largest length.
    pub fn replace(&mut self, slice: ArenaSlice, data: &[u8]) -> ArenaSlice {
        if data.len() <= slice.capacity {
            self.bytes[slice.start..slice.start + data.len()].copy_from_slice(data);
            return ArenaSlice {
                len: data.len(),
                ..slice
            };
        }
        let capacity = data.len().max(slice.capacity * 2);
        if slice.start + slice.capacity == self.bytes.len() {
            // Last slot, grow it where it is
            self.bytes.resize(slice.start + capacity, 0);
            self.bytes[slice.start..slice.start + data.len()].copy_from_slice(data);
            return ArenaSlice {
                start: slice.start,
                len: data.len(),
                capacity,
            };
        }
        let start = self.bytes.len();
        self.bytes.resize(start + capacity, 0);
        self.bytes[start..start + data.len()].copy_from_slice(data);
        ArenaSlice {
            start,
            len: data.len(),
            capacity,
        }
    }

    #[must_use]
    pub fn get(&self, slice: ArenaSlice) -> &[u8] {
        &self.bytes[slice.start..slice.start + slice.len]
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
        self.bytes.shrink_to(RETAINED_BYTES);
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.bytes.capacity()
    }
}
