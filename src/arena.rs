//! Arena allocation for parsed message graphs.
//!
//! Every allocation made while parsing one message tree comes from one arena
//! and is released in a single step when the arena is dropped. Returned
//! ranges are zeroed, aligned, and stable: the arena never relocates memory
//! it has handed out, which is what lets messages hold raw pointers into it.

use core::alloc::Layout;
use core::ptr;
use core::ptr::NonNull;

use allocator_api2::alloc::Allocator;

use crate::Error;

// Arena allocates memory for parsed objects, which can be freed all at once.
// We need arena to be a non-generic type to avoid code bloat, but at the same
// time we want users to have full control over the allocator used by the
// arena. Because arena is batching small allocations into sporadic large
// allocations, we can allocate large blocks using the dyn Allocator trait
// object without too much overhead.
pub struct Arena<'a> {
    current: *mut MemBlock,
    cursor: *mut u8,
    end: *mut u8,
    first_block_size: usize,
    allocator: &'a dyn Allocator,
}

// Mem block is a block of contiguous memory allocated from the allocator
struct MemBlock {
    prev: *mut MemBlock,
    layout: Layout, // Layout of the entire block including header
}

pub(crate) const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;
const MAX_BLOCK_SIZE: usize = 1024 * 1024;

impl<'a> Arena<'a> {
    /// Create a new arena with the given allocator.
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self::with_chunk_size(allocator, DEFAULT_BLOCK_SIZE)
    }

    /// Create a new arena whose first chunk has the given size.
    pub fn with_chunk_size(allocator: &'a dyn Allocator, first_block_size: usize) -> Self {
        Self {
            current: ptr::null_mut(),
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
            first_block_size: first_block_size.max(64),
            allocator,
        }
    }

    /// Allocate zeroed memory with the given size and alignment.
    #[inline]
    pub fn alloc_raw(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let size = layout.size();
        let align = layout.align();

        // Align the cursor to the required alignment
        let cursor_addr = self.cursor as usize;
        let aligned_addr = (cursor_addr + align - 1) & !(align - 1);
        let aligned_cursor = aligned_addr as *mut u8;

        // Check if we have enough space: end - aligned_cursor >= size
        let available = (self.end as usize).wrapping_sub(aligned_cursor as usize);
        if crate::utils::likely(aligned_cursor as usize <= self.end as usize && available >= size) {
            self.cursor = unsafe { aligned_cursor.add(size) };
            unsafe { ptr::write_bytes(aligned_cursor, 0, size) };
            return Ok(unsafe { NonNull::new_unchecked(aligned_cursor) });
        }

        self.alloc_outlined(layout, available)
    }

    /// Allocate a zeroed value slot for `T` and return a raw pointer to it.
    pub fn alloc<T>(&mut self) -> Result<*mut T, Error> {
        Ok(self.alloc_raw(Layout::new::<T>())?.as_ptr() as *mut T)
    }

    /// Total bytes held by this arena's chunks.
    pub fn bytes_allocated(&self) -> usize {
        let mut total = 0;
        let mut current = self.current;
        unsafe {
            while !current.is_null() {
                total += (*current).layout.size();
                current = (*current).prev;
            }
        }
        total
    }

    /// Allocate a new memory block - never inlined to keep the fast path small
    #[inline(never)]
    fn alloc_outlined(&mut self, layout: Layout, available: usize) -> Result<NonNull<u8>, Error> {
        const SIGNIFICANT_SPACE_THRESHOLD: usize = 512;

        let ptr = if !self.current.is_null() && available >= SIGNIFICANT_SPACE_THRESHOLD {
            // Significant free space left, which implies this is a large
            // allocation. Give it a dedicated block and keep the current
            // block for future small allocations.
            self.alloc_dedicated(layout)?
        } else {
            self.allocate_new_block(layout)?
        };
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
        Ok(ptr)
    }

    fn allocate_new_block(&mut self, alloc_layout: Layout) -> Result<NonNull<u8>, Error> {
        let (layout, offset) = Layout::new::<MemBlock>()
            .extend(alloc_layout)
            .map_err(|_| Error::AllocError)?;
        let layout = layout.pad_to_align();

        let new_block_size = if self.current.is_null() {
            self.first_block_size
        } else {
            let current_block_size = unsafe { (*self.current).layout.size() };
            (current_block_size * 2).min(MAX_BLOCK_SIZE)
        };

        let (layout, block_start) = layout
            .extend(Layout::array::<u8>(new_block_size).map_err(|_| Error::AllocError)?)
            .map_err(|_| Error::AllocError)?;
        let layout = layout.pad_to_align();

        let ptr = self
            .allocator
            .allocate(layout)
            .map_err(|_| Error::AllocError)?
            .as_ptr() as *mut MemBlock;

        unsafe {
            (*ptr).prev = self.current;
            (*ptr).layout = layout;

            // This becomes the new active block
            self.current = ptr;
            self.cursor = (ptr as *mut u8).add(block_start);
            self.end = (ptr as *mut u8).add(layout.size());
            Ok(NonNull::new_unchecked((ptr as *mut u8).add(offset)))
        }
    }

    fn alloc_dedicated(&mut self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let memblock_layout = Layout::new::<MemBlock>();
        let (extended_layout, data_offset) = memblock_layout
            .extend(layout)
            .map_err(|_| Error::AllocError)?;
        let final_layout = extended_layout.pad_to_align();

        let ptr = self
            .allocator
            .allocate(final_layout)
            .map_err(|_| Error::AllocError)?
            .as_ptr() as *mut MemBlock;

        unsafe {
            (*ptr).layout = final_layout;

            // Insert just after the current head so the active bump block
            // stays where it is.
            (*ptr).prev = (*self.current).prev;
            (*self.current).prev = ptr;

            Ok(NonNull::new_unchecked((ptr as *mut u8).add(data_offset)))
        }
    }
}

impl<'a> Drop for Arena<'a> {
    fn drop(&mut self) {
        unsafe {
            let mut current = self.current;
            while !current.is_null() {
                let prev = (*current).prev;
                let layout = (*current).layout;
                let ptr = NonNull::new_unchecked(current as *mut u8);
                self.allocator.deallocate(ptr, layout);
                current = prev;
            }
        }
    }
}

// Safety: Arena can be sent between threads if the allocator supports it
unsafe impl<'a> Send for Arena<'a> where &'a dyn Allocator: Send {}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn basic_allocation() {
        let mut arena = Arena::new(&Global);

        let ptr1: *mut u32 = arena.alloc().unwrap();
        let ptr2: *mut u64 = arena.alloc().unwrap();

        unsafe {
            assert_eq!(*ptr1, 0);
            assert_eq!(*ptr2, 0);
            *ptr1 = 42;
            *ptr2 = 1337;
            assert_eq!(*ptr1, 42);
            assert_eq!(*ptr2, 1337);
        }
    }

    #[test]
    fn alignment() {
        let mut arena = Arena::new(&Global);

        let _u8_ptr: *mut u8 = arena.alloc().unwrap();
        let u64_ptr: *mut u64 = arena.alloc().unwrap();

        assert_eq!(u64_ptr as usize % core::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn stable_pointers_across_growth() {
        let mut arena = Arena::new(&Global);
        let first: *mut u64 = arena.alloc().unwrap();
        unsafe { *first = 0xDEAD_BEEF };

        // Force several new blocks.
        for _ in 0..64 {
            let layout = Layout::from_size_align(1024, 8).unwrap();
            arena.alloc_raw(layout).unwrap();
        }

        unsafe { assert_eq!(*first, 0xDEAD_BEEF) };
    }

    #[test]
    fn large_allocation_gets_dedicated_block() {
        let mut arena = Arena::new(&Global);
        let _small: *mut u32 = arena.alloc().unwrap();
        let layout = Layout::from_size_align(DEFAULT_BLOCK_SIZE * 2, 8).unwrap();
        let big = arena.alloc_raw(layout).unwrap();
        unsafe {
            let slice = core::slice::from_raw_parts_mut(big.as_ptr(), layout.size());
            slice[0] = 1;
            slice[layout.size() - 1] = 2;
            assert_eq!(slice[0], 1);
            assert_eq!(slice[layout.size() - 1], 2);
        }
        assert!(arena.bytes_allocated() >= DEFAULT_BLOCK_SIZE * 2);
    }
}
