//! Arena container types backing repeated and map fields.
//!
//! These are plain `#[repr(C)]` slot records living inside message hot/cold
//! regions. They never implement `Drop`; their memory belongs to the arena
//! (or, in the zero-copy state, to the caller's input buffer).
//!
//! A [`RepSlot`] is in one of three states, discriminated by its `cap` word:
//!
//! - *zero-copy*: the element storage aliases a packed run in the input
//!   buffer (`cap == ZC_CAP`);
//! - *inline*: elements are laid out back to back in arena memory;
//! - *outlined*: a vector of element pointers, used for repeated messages
//!   once growing the inline run would move already-parsed elements out from
//!   under pointers held elsewhere in the tree.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::Error;
use crate::arena::Arena;
use crate::utils::mix64;

const ZC_CAP: u32 = u32::MAX;
const OUTLINED_FLAG: u32 = 0x8000_0000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RepMode {
    Empty,
    ZeroCopy,
    Inline,
    Outlined,
}

/// Slot header for a repeated field.
#[repr(C)]
pub struct RepSlot {
    ptr: *const u8,
    len: u32,
    cap: u32,
}

impl RepSlot {
    #[inline(always)]
    pub fn mode(&self) -> RepMode {
        if self.cap == 0 && self.len == 0 {
            RepMode::Empty
        } else if self.cap == ZC_CAP {
            RepMode::ZeroCopy
        } else if self.cap & OUTLINED_FLAG != 0 {
            RepMode::Outlined
        } else {
            RepMode::Inline
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the element storage lives outside the arena.
    #[inline(always)]
    pub fn is_zero_copy(&self) -> bool {
        self.cap == ZC_CAP
    }

    /// The raw element storage. For zero-copy varint runs the width is 1.
    #[inline(always)]
    pub fn storage(&self, elem_width: usize) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len as usize * elem_width) }
    }

    /// Enter the zero-copy state, aliasing `count` elements at `ptr`.
    #[inline(always)]
    pub(crate) fn set_zero_copy(&mut self, ptr: *const u8, count: usize) {
        debug_assert!(matches!(self.mode(), RepMode::Empty));
        self.ptr = ptr;
        self.len = count as u32;
        self.cap = ZC_CAP;
    }

    #[inline(always)]
    pub(crate) fn inline_slice<T: Copy>(&self) -> &[T] {
        debug_assert!(!matches!(self.mode(), RepMode::Outlined));
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr as *const T, self.len as usize) }
    }

    /// Read element `i` of a zero-copy fixed-width run without assuming
    /// alignment of the input buffer.
    #[inline(always)]
    pub(crate) fn zc_read<T: Copy>(&self, i: usize) -> T {
        debug_assert!(self.is_zero_copy() && i < self.len as usize);
        unsafe {
            core::ptr::read_unaligned((self.ptr as *const T).byte_add(i * core::mem::size_of::<T>()))
        }
    }

    /// Append one element in the inline state, growing through the arena.
    pub(crate) fn push_inline<T: Copy>(
        &mut self,
        val: T,
        preload: u32,
        arena: &mut Arena<'_>,
    ) -> Result<(), Error> {
        debug_assert!(!self.is_zero_copy() && self.cap & OUTLINED_FLAG == 0);
        if self.len == self.cap {
            self.grow_inline::<T>(preload, arena)?;
        }
        unsafe {
            (self.ptr as *mut T).add(self.len as usize).write(val);
        }
        self.len += 1;
        Ok(())
    }

    pub(crate) fn reserve_inline<T: Copy>(
        &mut self,
        additional: usize,
        arena: &mut Arena<'_>,
    ) -> Result<(), Error> {
        let needed = self.len as usize + additional;
        while (self.cap as usize) < needed {
            self.grow_inline::<T>(needed as u32, arena)?;
        }
        Ok(())
    }

    fn grow_inline<T: Copy>(&mut self, want: u32, arena: &mut Arena<'_>) -> Result<(), Error> {
        let new_cap = (self.cap * 2).max(want).max(4) as usize;
        let layout = Layout::array::<T>(new_cap).map_err(|_| Error::AllocError)?;
        let new_ptr = arena.alloc_raw(layout)?.as_ptr() as *mut T;
        if self.len != 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(self.ptr as *const T, new_ptr, self.len as usize);
            }
        }
        self.ptr = new_ptr as *const u8;
        self.cap = new_cap as u32;
        Ok(())
    }

    /// Convert a zero-copy run of fixed-width elements into an inline arena
    /// run so it can be appended to.
    pub(crate) fn materialize_fixed<T: Copy>(&mut self, arena: &mut Arena<'_>) -> Result<(), Error> {
        debug_assert!(self.is_zero_copy());
        let len = self.len as usize;
        let layout = Layout::array::<T>(len.max(4)).map_err(|_| Error::AllocError)?;
        let new_ptr = arena.alloc_raw(layout)?.as_ptr() as *mut T;
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr, new_ptr as *mut u8, len * core::mem::size_of::<T>());
        }
        self.ptr = new_ptr as *const u8;
        self.cap = len.max(4) as u32;
        Ok(())
    }

    /// Append storage for one message of `elem_size` bytes, returning the
    /// element's address. Starts as an inline run; once the run fills, the
    /// slot outlines into a pointer vector so existing elements stay put.
    pub(crate) fn push_msg(
        &mut self,
        elem_size: usize,
        preload: u32,
        arena: &mut Arena<'_>,
    ) -> Result<NonNull<u8>, Error> {
        match self.mode() {
            RepMode::Empty => {
                let cap = preload.max(4) as usize;
                let layout = Layout::from_size_align(elem_size * cap, 8)
                    .map_err(|_| Error::AllocError)?;
                self.ptr = arena.alloc_raw(layout)?.as_ptr();
                self.cap = cap as u32;
                self.len = 1;
                Ok(unsafe { NonNull::new_unchecked(self.ptr as *mut u8) })
            }
            RepMode::Inline => {
                if self.len < self.cap {
                    let elem = unsafe { (self.ptr as *mut u8).add(self.len as usize * elem_size) };
                    self.len += 1;
                    return Ok(unsafe { NonNull::new_unchecked(elem) });
                }
                self.outline(elem_size, arena)?;
                self.push_msg(elem_size, preload, arena)
            }
            RepMode::Outlined => {
                let elem_layout =
                    Layout::from_size_align(elem_size, 8).map_err(|_| Error::AllocError)?;
                let elem = arena.alloc_raw(elem_layout)?;
                let cap = self.cap & !OUTLINED_FLAG;
                if self.len == cap {
                    self.grow_outlined(arena)?;
                }
                unsafe {
                    (self.ptr as *mut *mut u8)
                        .add(self.len as usize)
                        .write(elem.as_ptr());
                }
                self.len += 1;
                Ok(elem)
            }
            RepMode::ZeroCopy => unreachable!("message runs are never zero-copy"),
        }
    }

    fn outline(&mut self, elem_size: usize, arena: &mut Arena<'_>) -> Result<(), Error> {
        let len = self.len as usize;
        let cap = (len * 2).max(4);
        let layout = Layout::array::<*mut u8>(cap).map_err(|_| Error::AllocError)?;
        let ptrs = arena.alloc_raw(layout)?.as_ptr() as *mut *mut u8;
        for i in 0..len {
            unsafe {
                ptrs.add(i).write((self.ptr as *mut u8).add(i * elem_size));
            }
        }
        self.ptr = ptrs as *const u8;
        self.cap = cap as u32 | OUTLINED_FLAG;
        Ok(())
    }

    fn grow_outlined(&mut self, arena: &mut Arena<'_>) -> Result<(), Error> {
        let len = self.len as usize;
        let cap = ((self.cap & !OUTLINED_FLAG) as usize * 2).max(4);
        let layout = Layout::array::<*mut u8>(cap).map_err(|_| Error::AllocError)?;
        let ptrs = arena.alloc_raw(layout)?.as_ptr() as *mut *mut u8;
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr as *const *mut u8, ptrs, len);
        }
        self.ptr = ptrs as *const u8;
        self.cap = cap as u32 | OUTLINED_FLAG;
        Ok(())
    }

    /// Address of message element `i`, in either message-run state.
    #[inline]
    pub(crate) fn msg_at(&self, i: usize, elem_size: usize) -> *mut u8 {
        debug_assert!(i < self.len as usize);
        match self.mode() {
            RepMode::Inline => unsafe { (self.ptr as *mut u8).add(i * elem_size) },
            RepMode::Outlined => unsafe { *(self.ptr as *const *mut u8).add(i) },
            _ => unreachable!("not a message run"),
        }
    }
}

/// Map entry. `hash == 0` marks an empty slot; computed hashes are nudged
/// away from zero. Keys and values are stored as raw 64-bit images: scalar
/// bits, a packed [`Zc`](crate::zc::Zc), or a message pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub hash: u64,
    pub key: u64,
    pub val: u64,
}

/// Flat open-addressing table for map fields. Lives behind a pointer slot in
/// the message; allocated on first insert.
#[repr(C)]
pub struct RawMap {
    entries: *mut MapEntry,
    cap: u32,
    len: u32,
}

const MAP_MIN_CAP: u32 = 8;

#[inline(always)]
pub(crate) fn map_hash_int(key: u64) -> u64 {
    mix64(key) | 1
}

#[inline(always)]
pub(crate) fn map_hash_bytes(bytes: &[u8]) -> u64 {
    crate::utils::hash_bytes(bytes) | 1
}

impl RawMap {
    pub(crate) fn create(arena: &mut Arena<'_>) -> Result<*mut RawMap, Error> {
        let map = arena.alloc::<RawMap>()?;
        unsafe {
            (*map).alloc_entries(MAP_MIN_CAP, arena)?;
        }
        Ok(map)
    }

    fn alloc_entries(&mut self, cap: u32, arena: &mut Arena<'_>) -> Result<(), Error> {
        let layout = Layout::array::<MapEntry>(cap as usize).map_err(|_| Error::AllocError)?;
        self.entries = arena.alloc_raw(layout)?.as_ptr() as *mut MapEntry;
        self.cap = cap;
        self.len = 0;
        Ok(())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub(crate) fn entries(&self) -> &[MapEntry] {
        unsafe { core::slice::from_raw_parts(self.entries, self.cap as usize) }
    }

    /// Insert or replace. `eq` decides key equality among entries with equal
    /// hashes (string keys compare resolved bytes).
    pub(crate) fn insert(
        &mut self,
        hash: u64,
        key: u64,
        val: u64,
        mut eq: impl FnMut(u64) -> bool,
        arena: &mut Arena<'_>,
    ) -> Result<(), Error> {
        debug_assert!(hash != 0);
        if (self.len + 1) * 8 > self.cap * 7 {
            self.grow(arena)?;
        }
        let mask = (self.cap - 1) as u64;
        let mut slot = (mix64(hash) >> 32) & mask;
        loop {
            let entry = unsafe { &mut *self.entries.add(slot as usize) };
            if entry.hash == 0 {
                *entry = MapEntry { hash, key, val };
                self.len += 1;
                return Ok(());
            }
            if entry.hash == hash && eq(entry.key) {
                // Last write wins, protobuf map merge semantics.
                entry.key = key;
                entry.val = val;
                return Ok(());
            }
            slot = (slot + 1) & mask;
        }
    }

    pub(crate) fn lookup(&self, hash: u64, mut eq: impl FnMut(u64) -> bool) -> Option<&MapEntry> {
        if self.cap == 0 {
            return None;
        }
        let mask = (self.cap - 1) as u64;
        let mut slot = (mix64(hash) >> 32) & mask;
        loop {
            let entry = unsafe { &*self.entries.add(slot as usize) };
            if entry.hash == 0 {
                return None;
            }
            if entry.hash == hash && eq(entry.key) {
                return Some(entry);
            }
            slot = (slot + 1) & mask;
        }
    }

    fn grow(&mut self, arena: &mut Arena<'_>) -> Result<(), Error> {
        let old = self.entries;
        let old_cap = self.cap;
        self.alloc_entries((old_cap * 2).max(MAP_MIN_CAP), arena)?;
        let mask = (self.cap - 1) as u64;
        for i in 0..old_cap as usize {
            let entry = unsafe { *old.add(i) };
            if entry.hash == 0 {
                continue;
            }
            let mut slot = (mix64(entry.hash) >> 32) & mask;
            loop {
                let dst = unsafe { &mut *self.entries.add(slot as usize) };
                if dst.hash == 0 {
                    *dst = entry;
                    break;
                }
                slot = (slot + 1) & mask;
            }
            self.len += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn rep_slot_push_and_read() {
        let mut arena = Arena::new(&Global);
        let mut slot = RepSlot {
            ptr: core::ptr::null(),
            len: 0,
            cap: 0,
        };
        assert_eq!(slot.mode(), RepMode::Empty);
        for v in 0u32..100 {
            slot.push_inline(v, 0, &mut arena).unwrap();
        }
        assert_eq!(slot.mode(), RepMode::Inline);
        assert_eq!(slot.len(), 100);
        assert_eq!(slot.inline_slice::<u32>()[99], 99);
    }

    #[test]
    fn zero_copy_then_materialize() {
        let mut arena = Arena::new(&Global);
        let src: Vec<u8> = (1u32..=4).flat_map(|v| v.to_le_bytes()).collect();
        let mut slot = RepSlot {
            ptr: core::ptr::null(),
            len: 0,
            cap: 0,
        };
        slot.set_zero_copy(src.as_ptr(), 4);
        assert!(slot.is_zero_copy());
        assert_eq!(slot.zc_read::<u32>(2), 3);
        // Storage aliases the input.
        assert_eq!(slot.storage(4).as_ptr(), src.as_ptr());

        slot.materialize_fixed::<u32>(&mut arena).unwrap();
        assert!(!slot.is_zero_copy());
        assert_eq!(slot.inline_slice::<u32>(), &[1, 2, 3, 4]);
        slot.push_inline(5u32, 0, &mut arena).unwrap();
        assert_eq!(slot.inline_slice::<u32>(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn message_run_outlines_without_moving() {
        let mut arena = Arena::new(&Global);
        let mut slot = RepSlot {
            ptr: core::ptr::null(),
            len: 0,
            cap: 0,
        };
        let first = slot.push_msg(32, 2, &mut arena).unwrap().as_ptr();
        let second = slot.push_msg(32, 2, &mut arena).unwrap().as_ptr();
        assert_eq!(slot.mode(), RepMode::Inline);
        // Third element exceeds the preloaded run and forces the outline.
        let third = slot.push_msg(32, 2, &mut arena).unwrap().as_ptr();
        assert_eq!(slot.mode(), RepMode::Outlined);
        assert_eq!(slot.msg_at(0, 32), first);
        assert_eq!(slot.msg_at(1, 32), second);
        assert_eq!(slot.msg_at(2, 32), third);
    }

    #[test]
    fn map_insert_lookup_grow() {
        let mut arena = Arena::new(&Global);
        let map_ptr = RawMap::create(&mut arena).unwrap();
        let map = unsafe { &mut *map_ptr };
        for k in 0u64..50 {
            let h = map_hash_int(k);
            map.insert(h, k, k * 10, |existing| existing == k, &mut arena)
                .unwrap();
        }
        assert_eq!(map.len(), 50);
        for k in 0u64..50 {
            let h = map_hash_int(k);
            let entry = map.lookup(h, |existing| existing == k).unwrap();
            assert_eq!(entry.val, k * 10);
        }
        assert!(map.lookup(map_hash_int(999), |e| e == 999).is_none());

        // Replacement keeps len stable.
        let h = map_hash_int(7);
        map.insert(h, 7, 1234, |e| e == 7, &mut arena).unwrap();
        assert_eq!(map.len(), 50);
        assert_eq!(map.lookup(h, |e| e == 7).unwrap().val, 1234);
    }
}
