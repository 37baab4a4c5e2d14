//! Bit-vector allocator.
//!
//! A fixed-length bit vector where a set bit marks an allocated unit. Runs are
//! found first-fit by a linear scan; fully allocated words are skipped in a
//! single step. The bitmap knows nothing about locking: callers serialize
//! access (the page-table region allocator holds its own lock around it).

use alloc::vec;
use alloc::vec::Vec;

use crate::VmError;

/// Number of bits in one storage word.
const WORD_BITS: usize = usize::BITS as usize;

/// A fixed-length bit vector with run allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<usize>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Returns the number of bits in the bitmap.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the bitmap has no bits at all.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of set bits.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn check_bit(&self, bit: usize) -> Result<(), VmError> {
        if bit < self.len {
            Ok(())
        } else {
            Err(VmError::OutOfRange)
        }
    }

    fn check_run(&self, start: usize, len: usize) -> Result<(), VmError> {
        if len == 0 || start > self.len || len > self.len - start {
            return Err(VmError::OutOfRange);
        }
        Ok(())
    }

    /// Returns whether `bit` is set.
    pub fn status(&self, bit: usize) -> Result<bool, VmError> {
        self.check_bit(bit)?;
        Ok(self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0)
    }

    /// Sets `bit`.
    pub fn set(&mut self, bit: usize) -> Result<(), VmError> {
        self.check_bit(bit)?;
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        Ok(())
    }

    /// Clears `bit`.
    pub fn clear(&mut self, bit: usize) -> Result<(), VmError> {
        self.check_bit(bit)?;
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        Ok(())
    }

    /// Sets (`mark == true`) or clears the run `[start, start + len)`.
    pub fn update_run(&mut self, mark: bool, start: usize, len: usize) -> Result<(), VmError> {
        self.check_run(start, len)?;

        let end = start + len;
        let mut bit = start;
        while bit < end {
            let index = bit / WORD_BITS;
            let offset = bit % WORD_BITS;
            let count = (WORD_BITS - offset).min(end - bit);
            let mask = if count == WORD_BITS {
                usize::MAX
            } else {
                ((1usize << count) - 1) << offset
            };

            if mark {
                self.words[index] |= mask;
            } else {
                self.words[index] &= !mask;
            }
            bit += count;
        }

        Ok(())
    }

    /// Finds the first run of `len` clear bits.
    pub fn search(&self, len: usize) -> Result<Option<usize>, VmError> {
        self.search_from(0, len)
    }

    /// Finds the first run of `len` clear bits starting at or after `start`.
    ///
    /// `start == len()` is accepted and finds nothing.
    pub fn search_from(&self, start: usize, len: usize) -> Result<Option<usize>, VmError> {
        if len == 0 || len > self.len || start > self.len {
            return Err(VmError::OutOfRange);
        }

        let mut bit = start;
        let mut run_start = start;
        let mut run = 0;

        while bit < self.len {
            let index = bit / WORD_BITS;
            let offset = bit % WORD_BITS;
            let word = self.words[index];
            // The final word may be partial; its padding bits are not part of the bitmap.
            let limit = WORD_BITS.min(self.len - index * WORD_BITS);

            if offset == 0 && word == usize::MAX {
                run = 0;
                bit += limit;
                continue;
            }

            for j in offset..limit {
                if word & (1 << j) != 0 {
                    run = 0;
                    continue;
                }
                if run == 0 {
                    run_start = index * WORD_BITS + j;
                }
                run += 1;
                if run == len {
                    return Ok(Some(run_start));
                }
            }

            bit = index * WORD_BITS + limit;
        }

        Ok(None)
    }

    /// Finds and sets the first run of `len` clear bits.
    pub fn alloc(&mut self, len: usize) -> Result<usize, VmError> {
        let start = self.search(len)?.ok_or(VmError::OutOfMemory)?;
        self.update_run(true, start, len)?;
        Ok(start)
    }

    /// Finds and sets the first run of `len` clear bits whose start is a
    /// multiple of `align`.
    ///
    /// Each unaligned candidate moves the search origin to the next multiple
    /// of `align` at or after it, so the scan always makes progress.
    pub fn alloc_aligned(&mut self, len: usize, align: usize) -> Result<usize, VmError> {
        if align == 0 {
            return Err(VmError::OutOfRange);
        }

        let mut origin = 0;
        loop {
            let Some(start) = self.search_from(origin, len)? else {
                return Err(VmError::OutOfMemory);
            };

            if start % align == 0 {
                self.update_run(true, start, len)?;
                return Ok(start);
            }

            origin = start.next_multiple_of(align);
            if origin >= self.len {
                return Err(VmError::OutOfMemory);
            }
        }
    }

    /// Clears the run `[start, start + len)`.
    pub fn free(&mut self, start: usize, len: usize) -> Result<(), VmError> {
        self.update_run(false, start, len)
    }
}
