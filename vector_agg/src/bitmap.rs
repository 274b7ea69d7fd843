//! Packed validity and filter bitmaps.
//!
//! Bitmaps are little-endian arrays of 64-bit words: row `i` is bit `i & 63`
//! of word `i >> 6`, a set bit meaning the row is valid (or passes the
//! filter). An absent bitmap means every row is valid.
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
use arrow::buffer::BooleanBuffer;
use std::ops::Range;

/// Number of 64-bit words needed to hold `rows` bits.
#[must_use]
pub const fn words_for_rows(rows: usize) -> usize {
    rows.div_ceil(64)
}

/// Mask selecting the lowest `bits` bits of a word.
#[must_use]
pub const fn low_bits_mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[inline]
#[must_use]
pub fn bit_is_set(words: &[u64], row: usize) -> bool {
    words[row >> 6] & (1u64 << (row & 63)) != 0
}

#[inline]
#[must_use]
pub fn row_is_valid(bitmap: Option<&[u64]>, row: usize) -> bool {
    bitmap.is_none_or(|words| bit_is_set(words, row))
}

#[inline]
pub fn set_bit(words: &mut [u64], row: usize) {
    words[row >> 6] |= 1u64 << (row & 63);
}

/// Count the valid rows among the first `rows` rows.
#[must_use]
pub fn num_valid(bitmap: Option<&[u64]>, rows: usize) -> usize {
    let Some(words) = bitmap else {
        return rows;
    };
    let full_words = rows / 64;
    let mut count: usize = words[..full_words]
        .iter()
        .map(|word| word.count_ones() as usize)
        .sum();
    let tail = rows % 64;
    if tail > 0 {
        count += (words[full_words] & low_bits_mask(tail)).count_ones() as usize;
    }
    count
}

/// Pack an iterator of booleans into bitmap words.
pub fn from_bools(bits: impl IntoIterator<Item = bool>) -> Vec<u64> {
    let mut words = Vec::new();
    for (row, bit) in bits.into_iter().enumerate() {
        if row % 64 == 0 {
            words.push(0);
        }
        if bit {
            set_bit(&mut words, row);
        }
    }
    words
}

/// Copy an Arrow boolean buffer into bitmap words. Trailing bits of the last
/// word are zero.
#[must_use]
pub fn from_boolean_buffer(buffer: &BooleanBuffer) -> Vec<u64> {
    buffer
        .inner()
        .bit_chunks(buffer.offset(), buffer.len())
        .iter_padded()
        .collect()
}

/// How many of the meaningful bits of one filter word are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSummary {
    NonePass,
    AllPass,
    SomePass,
}

#[must_use]
pub fn summarize_word(word: u64, mask: u64) -> WordSummary {
    let word = word & mask;
    if word == 0 {
        WordSummary::NonePass
    } else if word == mask {
        WordSummary::AllPass
    } else {
        WordSummary::SomePass
    }
}

/// AND together every bitmap that is present, writing into `scratch` when
/// more than one is. Returns `None` when all of them are absent, which means
/// every row passes.
pub fn combine_validity<'a>(
    scratch: &'a mut Vec<u64>,
    rows: usize,
    bitmaps: &[Option<&'a [u64]>],
) -> Option<&'a [u64]> {
    let words = words_for_rows(rows);
    let mut present = bitmaps.iter().flatten().peekable();
    let first = present.next()?;
    if present.peek().is_none() {
        return Some(&first[..words]);
    }
    scratch.clear();
    scratch.extend_from_slice(&first[..words]);
    for bitmap in present {
        for (combined, word) in scratch.iter_mut().zip(&bitmap[..words]) {
            *combined &= word;
        }
    }
    Some(&scratch[..])
}

/// Split the rows of a filtered batch into maximal word-aligned ranges whose
/// words all have the same [`WordSummary`].
#[must_use]
pub fn filter_ranges(words: &[u64], rows: usize) -> FilterRanges<'_> {
    FilterRanges {
        words,
        rows,
        next_word: 0,
    }
}

#[derive(Debug, Clone)]
pub struct FilterRanges<'a> {
    words: &'a [u64],
    rows: usize,
    next_word: usize,
}

impl FilterRanges<'_> {
    fn summary_of(&self, word: usize) -> WordSummary {
        let bits = (self.rows - word * 64).min(64);
        summarize_word(self.words[word], low_bits_mask(bits))
    }
}

impl Iterator for FilterRanges<'_> {
    type Item = (WordSummary, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        let total_words = words_for_rows(self.rows);
        if self.next_word >= total_words {
            return None;
        }
        let start_word = self.next_word;
        let summary = self.summary_of(start_word);
        let mut end_word = start_word + 1;
        while end_word < total_words && self.summary_of(end_word) == summary {
            end_word += 1;
        }
        self.next_word = end_word;
        Some((summary, start_word * 64..(end_word * 64).min(self.rows)))
    }
}

/// Row validity lookup used to specialise row loops. [`AllRowsValid`]
/// compiles to nothing, so loops instantiated with it carry no bitmap test.
pub trait RowValidity: Copy {
    fn is_valid(self, row: usize) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct AllRowsValid;

impl RowValidity for AllRowsValid {
    #[inline(always)]
    fn is_valid(self, _row: usize) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidityBits<'a>(pub &'a [u64]);

impl RowValidity for ValidityBits<'_> {
    #[inline(always)]
    fn is_valid(self, row: usize) -> bool {
        bit_is_set(self.0, row)
    }
}

/// Bind `$v` to a [`RowValidity`] for an optional bitmap and evaluate
/// `$body` once per variant, so the body is monomorphised for both the
/// bitmap and the no-bitmap case.
macro_rules! with_validity {
    ($bitmap:expr, |$v:ident| $body:expr) => {
        match $bitmap {
            None => {
                let $v = $crate::bitmap::AllRowsValid;
                $body
            }
            Some(words) => {
                let $v = $crate::bitmap::ValidityBits(words);
                $body
            }
        }
    };
}
pub(crate) use with_validity;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn should_count_valid_rows_in_prefix() {
        // Given
        let words = [u64::MAX, 0b1011];

        // Then
        assert_eq!(num_valid(Some(&words), 64), 64);
        assert_eq!(num_valid(Some(&words), 66), 65);
        assert_eq!(num_valid(Some(&words), 128), 67);
        assert_eq!(num_valid(None, 17), 17);
        assert_eq!(num_valid(Some(&words), 0), 0);
    }

    #[test]
    fn should_test_bits_across_word_boundary() {
        let words = from_bools((0..70).map(|row| row == 63 || row == 64));
        assert_eq!(words.len(), 2);
        assert!(!row_is_valid(Some(&words), 62));
        assert!(row_is_valid(Some(&words), 63));
        assert!(row_is_valid(Some(&words), 64));
        assert!(!row_is_valid(Some(&words), 65));
        assert!(row_is_valid(None, 65));
    }

    #[test]
    fn should_summarize_words_under_mask() {
        assert_eq!(summarize_word(0, u64::MAX), WordSummary::NonePass);
        assert_eq!(summarize_word(u64::MAX, u64::MAX), WordSummary::AllPass);
        assert_eq!(summarize_word(0b101, u64::MAX), WordSummary::SomePass);
        // Bits beyond the batch end don't count
        assert_eq!(summarize_word(0b1111_0111, 0b111), WordSummary::AllPass);
        assert_eq!(summarize_word(0b1000, 0b111), WordSummary::NonePass);
    }

    #[test]
    fn should_combine_no_bitmaps_to_none() {
        let mut scratch = Vec::new();
        assert_eq!(combine_validity(&mut scratch, 10, &[None, None]), None);
    }

    #[test]
    fn should_borrow_single_bitmap() {
        // Given
        let mut scratch = Vec::new();
        let bitmap = vec![0b1010];

        // When
        let combined = combine_validity(&mut scratch, 4, &[None, Some(&bitmap), None]);

        // Then
        assert_eq!(combined, Some(&[0b1010][..]));
        assert!(scratch.is_empty());
    }

    #[test]
    fn should_and_several_bitmaps() {
        // Given
        let mut scratch = Vec::new();
        let a = vec![0b1110, u64::MAX];
        let b = vec![0b0111, 1];
        let c = vec![0b1111, 3];

        // When
        let combined = combine_validity(&mut scratch, 70, &[Some(&a), Some(&b), Some(&c)]);

        // Then
        assert_eq!(combined, Some(&[0b0110, 1][..]));
    }

    #[test]
    fn should_produce_no_ranges_for_empty_batch() {
        assert_eq!(filter_ranges(&[], 0).count(), 0);
    }

    #[test]
    fn should_merge_words_with_same_summary() {
        // Given
        let words = [u64::MAX, u64::MAX, 0, 0, 0b1, u64::MAX];

        // When
        let ranges = filter_ranges(&words, 6 * 64 - 10).collect::<Vec<_>>();

        // Then
        assert_eq!(
            ranges,
            vec![
                (WordSummary::AllPass, 0..128),
                (WordSummary::NonePass, 128..256),
                (WordSummary::SomePass, 256..320),
                (WordSummary::AllPass, 320..374),
            ]
        );
    }

    #[test]
    fn should_classify_partial_last_word() {
        // Given 3 rows and a filter passing rows 0 and 2
        let words = [0b101];

        // Then
        assert_eq!(
            filter_ranges(&words, 3).collect::<Vec<_>>(),
            vec![(WordSummary::SomePass, 0..3)]
        );
    }

    #[test]
    fn should_convert_boolean_buffer_with_offset() {
        // Given
        let buffer = BooleanBuffer::from_iter((0..100).map(|row| row % 3 == 0)).slice(1, 70);

        // When
        let words = from_boolean_buffer(&buffer);

        // Then
        assert_eq!(words.len(), 2);
        for row in 0..70 {
            assert_eq!(bit_is_set(&words, row), (row + 1) % 3 == 0, "row {row}");
        }
        assert_eq!(words[1] >> 6, 0);
    }
}
