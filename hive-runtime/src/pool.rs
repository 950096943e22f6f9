//! Fixed-capacity allocators.
//!
//! [`Pool`] hands out typed slots addressed by index; [`BufferPool`] hands out
//! equally sized byte buffers addressed by pointer. Both are sized once and
//! find a free slot by scanning an in-use bitmap, so allocation is `O(n / 64)`
//! and never touches the global allocator.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

const WORD_BITS: usize = u64::BITS as usize;

fn bitmap_words(capacity: usize) -> usize {
    capacity.div_ceil(WORD_BITS)
}

/// Find the first clear bit below `capacity`.
fn first_clear(bitmap: &[u64], capacity: usize) -> Option<usize> {
    for (w, word) in bitmap.iter().enumerate() {
        if *word != u64::MAX {
            let index = w * WORD_BITS + word.trailing_ones() as usize;
            return (index < capacity).then_some(index);
        }
    }
    None
}

fn test_bit(bitmap: &[u64], index: usize) -> bool {
    bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
}

fn set_bit(bitmap: &mut [u64], index: usize) {
    bitmap[index / WORD_BITS] |= 1 << (index % WORD_BITS);
}

fn clear_bit(bitmap: &mut [u64], index: usize) {
    bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
}

// ── Pool<T> ─────────────────────────────────────────────────────────────────

/// Fixed set of `T` slots.
pub struct Pool<T> {
    slots: Box<[Option<T>]>,
    in_use: Box<[u64]>,
    used: usize,
}

impl<T> Pool<T> {
    /// Create a pool of `capacity` empty slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            in_use: vec![0; bitmap_words(capacity)].into_boxed_slice(),
            used: 0,
        }
    }

    /// Total slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    /// No slot is occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Every slot is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.used == self.slots.len()
    }

    /// Store `value` in the lowest free slot and return its index.
    ///
    /// # Errors
    ///
    /// Gives the value back when the pool is full.
    pub fn alloc(&mut self, value: T) -> Result<usize, T> {
        let Some(index) = first_clear(&self.in_use, self.slots.len()) else {
            return Err(value);
        };
        set_bit(&mut self.in_use, index);
        self.slots[index] = Some(value);
        self.used += 1;
        Ok(index)
    }

    /// Release slot `index`, returning its value. Out-of-range or free
    /// indices are ignored.
    pub fn free(&mut self, index: usize) -> Option<T> {
        if index >= self.slots.len() || !test_bit(&self.in_use, index) {
            return None;
        }
        clear_bit(&mut self.in_use, index);
        self.used -= 1;
        self.slots[index].take()
    }

    /// Borrow the value in slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    /// Mutably borrow the value in slot `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Occupied slots with their indices, lowest index first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    /// Mutable variant of [`iter`](Self::iter).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }

    /// Index of the first occupied slot whose value satisfies `pred`.
    pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter().find(|(_, v)| pred(v)).map(|(i, _)| i)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}

// ── BufferPool ──────────────────────────────────────────────────────────────

/// Alignment of every buffer handed out by [`BufferPool`].
pub const BUFFER_ALIGN: usize = 8;

/// Fixed set of equally sized byte buffers carved from one allocation.
///
/// Buffers are addressed by pointer. [`free`](Self::free) recovers the slot
/// index from the pointer's offset into the backing storage.
pub struct BufferPool {
    base: NonNull<u8>,
    layout: Option<Layout>,
    slot_size: usize,
    capacity: usize,
    in_use: Box<[u64]>,
    used: usize,
}

impl BufferPool {
    /// Create `capacity` buffers of at least `slot_size` bytes each.
    ///
    /// Slot sizes are rounded up to [`BUFFER_ALIGN`].
    ///
    /// # Panics
    ///
    /// Aborts through [`alloc::handle_alloc_error`] when the backing storage
    /// cannot be allocated.
    #[must_use]
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        let slot_size = slot_size.max(1).next_multiple_of(BUFFER_ALIGN);
        let total = capacity.saturating_mul(slot_size);
        let (base, layout) = if total == 0 {
            (NonNull::dangling(), None)
        } else {
            let Ok(layout) = Layout::from_size_align(total, BUFFER_ALIGN) else {
                alloc::handle_alloc_error(Layout::new::<u64>());
            };
            // SAFETY: `layout` has non-zero size.
            let ptr = unsafe { alloc::alloc(layout) };
            let Some(base) = NonNull::new(ptr) else {
                alloc::handle_alloc_error(layout);
            };
            (base, Some(layout))
        };
        Self {
            base,
            layout,
            slot_size,
            capacity,
            in_use: vec![0; bitmap_words(capacity)].into_boxed_slice(),
            used: 0,
        }
    }

    /// Buffers currently handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    /// No buffer is handed out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Hand out a free buffer, or `None` when all are in use.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let index = first_clear(&self.in_use, self.capacity)?;
        set_bit(&mut self.in_use, index);
        self.used += 1;
        // SAFETY: `index < capacity`, so the offset stays inside the
        // allocation made in `new`.
        Some(unsafe { self.base.add(index * self.slot_size) })
    }

    /// Slot index of `ptr`, if it is the start of one of this pool's
    /// buffers.
    #[must_use]
    pub fn index_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset % self.slot_size != 0 {
            return None;
        }
        let index = offset / self.slot_size;
        (index < self.capacity).then_some(index)
    }

    /// Start of buffer `index`, if it is handed out.
    #[must_use]
    pub fn slot_ptr(&self, index: usize) -> Option<NonNull<u8>> {
        if index >= self.capacity || !test_bit(&self.in_use, index) {
            return None;
        }
        // SAFETY: `index < capacity`, inside the allocation made in `new`.
        Some(unsafe { self.base.add(index * self.slot_size) })
    }

    /// Return the buffer starting at `ptr`.
    ///
    /// Returns `false`, changing nothing, when `ptr` does not belong to this
    /// pool or the buffer is not handed out.
    pub fn free(&mut self, ptr: *const u8) -> bool {
        let Some(index) = self.index_of(ptr) else {
            return false;
        };
        if !test_bit(&self.in_use, index) {
            return false;
        }
        clear_bit(&mut self.in_use, index);
        self.used -= 1;
        true
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: `base` was returned by `alloc::alloc(layout)` in `new`.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("used", &self.used)
            .finish()
    }
}
