/// General-purpose allocation bitmap.
///
/// One bit per trackable entry: clear = free, set = allocated. The word
/// buffer either lives inline (compile-time capacity, const-constructible)
/// or is borrowed from the caller (runtime capacity), selected by the
/// storage parameter. A rotating hint remembers the last slot handed out
/// so repeated searches don't rescan a mostly-full prefix.
use core::fmt;

/// Bits per storage word.
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of words needed to track `entries` bits.
pub const fn words_for(entries: usize) -> usize {
    entries.div_ceil(BITS_PER_WORD)
}

/// Allocation state of a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    Free,
    Allocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapError {
    /// Index at or beyond the bitmap capacity.
    OutOfBounds,
    /// No free entries remain.
    Full,
    /// Backing storage too small for the requested capacity.
    OutOfMemory,
}

impl fmt::Display for BitmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapError::OutOfBounds => write!(f, "bitmap index out of bounds"),
            BitmapError::Full => write!(f, "bitmap full"),
            BitmapError::OutOfMemory => write!(f, "bitmap storage too small"),
        }
    }
}

pub struct Bitmap<S> {
    words: S,
    total_entries: usize,
    free_entries: usize,
    index_last_accessed: usize,
}

impl<const WORDS: usize> Bitmap<[u64; WORDS]> {
    /// Inline bitmap with all entries free. `total_entries` must fit in
    /// `WORDS` words.
    pub const fn with_capacity(total_entries: usize) -> Self {
        assert!(total_entries <= WORDS * BITS_PER_WORD);
        Self {
            words: [0; WORDS],
            total_entries,
            free_entries: total_entries,
            index_last_accessed: 0,
        }
    }
}

impl<'a> Bitmap<&'a mut [u64]> {
    /// Bitmap over a caller-provided word buffer; the used words are
    /// zeroed so every entry starts free. The buffer outlives the bitmap
    /// and goes back to its source when the bitmap is dropped.
    pub fn from_slice(words: &'a mut [u64], total_entries: usize) -> Result<Self, BitmapError> {
        if words.len() < words_for(total_entries) {
            return Err(BitmapError::OutOfMemory);
        }
        words[..words_for(total_entries)].fill(0);
        Ok(Self {
            words,
            total_entries,
            free_entries: total_entries,
            index_last_accessed: 0,
        })
    }
}

impl<S: AsRef<[u64]> + AsMut<[u64]>> Bitmap<S> {
    pub fn capacity(&self) -> usize {
        self.total_entries
    }

    pub fn free_entries(&self) -> usize {
        self.free_entries
    }

    pub fn is_full(&self) -> bool {
        self.free_entries == 0
    }

    /// Set entry `index` to `state`. The free count moves only when the
    /// bit actually changes, so re-setting a bit to its current state is
    /// a no-op.
    pub fn set(&mut self, index: usize, state: BitState) -> Result<(), BitmapError> {
        if index >= self.total_entries {
            return Err(BitmapError::OutOfBounds);
        }
        let mask = 1u64 << (index % BITS_PER_WORD);
        let word = &mut self.words.as_mut()[index / BITS_PER_WORD];
        let allocated = *word & mask != 0;
        match state {
            BitState::Allocated if !allocated => {
                *word |= mask;
                self.free_entries -= 1;
            }
            BitState::Free if allocated => {
                *word &= !mask;
                self.free_entries += 1;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether entry `index` is allocated.
    pub fn is_set(&self, index: usize) -> Result<bool, BitmapError> {
        if index >= self.total_entries {
            return Err(BitmapError::OutOfBounds);
        }
        let word = self.words.as_ref()[index / BITS_PER_WORD];
        Ok(word & (1u64 << (index % BITS_PER_WORD)) != 0)
    }

    /// Find a free entry, preferring the slot found last time. When the
    /// hint is taken, scans from zero skipping fully-allocated words.
    /// One pass at most, so this terminates within `capacity` probes.
    pub fn find_first_free(&mut self) -> Result<usize, BitmapError> {
        if self.free_entries == 0 {
            return Err(BitmapError::Full);
        }

        let words = self.words.as_ref();
        let hint = self.index_last_accessed;
        if words[hint / BITS_PER_WORD] & (1u64 << (hint % BITS_PER_WORD)) == 0 {
            return Ok(hint);
        }

        let mut index = 0;
        while index < self.total_entries {
            if index % BITS_PER_WORD == 0 && words[index / BITS_PER_WORD] == u64::MAX {
                index += BITS_PER_WORD;
                continue;
            }
            if words[index / BITS_PER_WORD] & (1u64 << (index % BITS_PER_WORD)) == 0 {
                self.index_last_accessed = index;
                return Ok(index);
            }
            index += 1;
        }

        // unreachable while free_entries stays in sync with the bits
        Err(BitmapError::Full)
    }

    /// Apply `set` across `[start, start + count)`. Stops at the first
    /// failure; entries before it stay changed.
    pub fn set_contiguous(
        &mut self,
        start: usize,
        count: usize,
        state: BitState,
    ) -> Result<(), BitmapError> {
        for index in start..start + count {
            self.set(index, state)?;
        }
        Ok(())
    }
}
