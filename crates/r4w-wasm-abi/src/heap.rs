//! Heap negotiation and the aggregate return slot.

use crate::error::{AbiError, Result};

/// Size of one linear-memory page.
pub const PAGE_SIZE: u64 = 65536;

/// Maximum page count of a 32-bit linear memory.
pub const MAX_PAGES: u64 = 65536;

/// Largest heap a 32-bit sandbox can address.
pub const MAX_HEAP: u64 = 1 << 32;

/// Round a requested heap size to what the sandbox will be created with.
///
/// `0` keeps the runtime default. Anything else becomes at least one page,
/// the next power of two, and at most [`MAX_HEAP`].
pub fn adjusted_heap_size(requested: u64) -> u64 {
    if requested == 0 {
        0
    } else if requested <= PAGE_SIZE {
        PAGE_SIZE
    } else if requested >= MAX_HEAP {
        MAX_HEAP
    } else {
        requested.next_power_of_two()
    }
}

/// Page count for an adjusted heap size.
pub fn heap_page_count(heap_size: u64) -> Result<u64> {
    let pages = heap_size / PAGE_SIZE;
    if pages > MAX_PAGES {
        return Err(AbiError::HeapTooLarge { pages });
    }
    Ok(pages)
}

/// Reusable sandbox buffer for aggregate return values.
///
/// Grows to the largest size requested and never shrinks.
#[derive(Debug)]
pub(crate) struct ReturnSlot<P> {
    ptr: P,
    size: usize,
}

impl<P: Copy> ReturnSlot<P> {
    pub(crate) fn new(null: P) -> Self {
        Self { ptr: null, size: 0 }
    }

    /// Current capacity in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Make the slot at least `size` bytes, releasing the old buffer before
    /// acquiring the new one.
    pub(crate) fn ensure(
        &mut self,
        size: usize,
        malloc: impl FnOnce(usize) -> Result<P>,
        free: impl FnOnce(P),
    ) -> Result<P> {
        if size > self.size {
            if self.size > 0 {
                free(self.ptr);
                self.size = 0;
            }
            self.ptr = malloc(size)?;
            self.size = size;
            tracing::trace!(size, "return slot grown");
        }
        Ok(self.ptr)
    }

    /// Give up the buffer, if one was allocated.
    pub(crate) fn take(&mut self) -> Option<P> {
        if self.size == 0 {
            return None;
        }
        self.size = 0;
        Some(self.ptr)
    }
}
