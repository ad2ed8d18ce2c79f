//! The in-memory shape of a parsed message.
//!
//! A message is a bare arena allocation: a fixed [`MessageHeader`], then the
//! presence bitset, then field slots at offsets computed by the compiler.
//! There is no Rust struct for the whole thing; all access goes through raw
//! offsets carried by the library tables.
//!
//! Rarely used fields and retained unknown fields live in a separately
//! allocated [`Cold`] region, created on first write and reached through the
//! per-parse [`Shared`] context's cold list.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::Error;
use crate::arena::Arena;
use crate::containers::RepSlot;
use crate::tables::{Library, Offset, Type};
use crate::zc::Zc;

/// Fixed message prefix. The bitset follows at [`HEADER_SIZE`], field slots
/// after that.
#[repr(C)]
pub struct MessageHeader {
    /// Per-parse shared context; identical for every message in one tree.
    pub shared: *const Shared,
    /// Offset of this message's `Type` within the library image.
    pub type_offset: u32,
    /// Index into the shared cold list, negative while no cold region
    /// exists.
    pub cold_index: i32,
}

pub(crate) const HEADER_SIZE: usize = core::mem::size_of::<MessageHeader>();
const _: () = assert!(HEADER_SIZE == 16);

/// Lazily allocated cold region header; cold field slots follow it.
#[repr(C)]
pub struct Cold {
    /// Raw spans of retained unknown fields, in wire order.
    pub unknown: RepSlot,
}

pub(crate) const COLD_HEADER_SIZE: usize = core::mem::size_of::<Cold>();

/// Per-parse shared state. Lives in the same arena as the messages; every
/// message header points at it.
#[repr(C)]
pub struct Shared {
    pub src: *const u8,
    pub src_len: usize,
    pub lib: *const Library,
    /// Cold regions allocated so far, indexed by `MessageHeader::cold_index`.
    pub cold: RepSlot,
}

impl Shared {
    #[inline(always)]
    pub fn src_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.src, self.src_len) }
    }

    #[inline(always)]
    pub fn library(&self) -> &Library {
        unsafe { &*self.lib }
    }
}

#[inline(always)]
pub(crate) unsafe fn header<'a>(msg: *const u8) -> &'a MessageHeader {
    unsafe { &*(msg as *const MessageHeader) }
}

#[inline(always)]
pub(crate) unsafe fn header_mut<'a>(msg: *mut u8) -> &'a mut MessageHeader {
    unsafe { &mut *(msg as *mut MessageHeader) }
}

#[inline(always)]
pub(crate) unsafe fn get_bit(msg: *const u8, bit: u32) -> bool {
    let word = bit / 32;
    let mask = 1u32 << (bit % 32);
    let w = unsafe { *(msg.add(HEADER_SIZE + word as usize * 4) as *const u32) };
    w & mask != 0
}

#[inline(always)]
pub(crate) unsafe fn set_bit(msg: *mut u8, bit: u32) {
    let word = bit / 32;
    let mask = 1u32 << (bit % 32);
    unsafe {
        *(msg.add(HEADER_SIZE + word as usize * 4) as *mut u32) |= mask;
    }
}

/// Read the oneof discriminator word whose block starts at `bit`.
#[inline(always)]
pub(crate) unsafe fn which_word(msg: *const u8, bit: u32) -> u32 {
    debug_assert!(bit % 32 == 0);
    unsafe { *(msg.add(HEADER_SIZE + (bit / 32) as usize * 4) as *const u32) }
}

#[inline(always)]
pub(crate) unsafe fn set_which_word(msg: *mut u8, bit: u32, number: u32) {
    debug_assert!(bit % 32 == 0);
    unsafe {
        *(msg.add(HEADER_SIZE + (bit / 32) as usize * 4) as *mut u32) = number;
    }
}

/// Mark a field present: set its bit, or store the arm number into the
/// oneof discriminator when `offset.number` says this is a oneof arm.
#[inline(always)]
pub(crate) unsafe fn mark_present(msg: *mut u8, offset: Offset) {
    unsafe {
        if offset.number != 0 {
            set_which_word(msg, offset.bit, offset.number);
        } else {
            set_bit(msg, offset.bit);
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn is_present(msg: *const u8, offset: Offset) -> bool {
    unsafe {
        if offset.number != 0 {
            which_word(msg, offset.bit) == offset.number
        } else {
            get_bit(msg, offset.bit)
        }
    }
}

/// Resolve a field's slot for reading. Cold slots resolve to `None` until
/// the cold region exists.
#[inline(always)]
pub(crate) unsafe fn slot_ptr(msg: *const u8, data: i32) -> Option<*mut u8> {
    if data >= 0 {
        return Some(unsafe { msg.add(data as usize) as *mut u8 });
    }
    let hdr = unsafe { header(msg) };
    if hdr.cold_index < 0 {
        return None;
    }
    let shared = unsafe { &*hdr.shared };
    let cold = shared.cold.inline_slice::<*mut u8>()[hdr.cold_index as usize];
    Some(unsafe { cold.add(!data as usize) })
}

/// Resolve a field's slot for writing, allocating the cold region on first
/// use.
#[inline(always)]
pub(crate) unsafe fn slot_ptr_mut(
    msg: *mut u8,
    data: i32,
    ty: &Type,
    arena: &mut Arena<'_>,
) -> Result<*mut u8, Error> {
    if data >= 0 {
        return Ok(unsafe { msg.add(data as usize) });
    }
    let cold = unsafe { ensure_cold(msg, ty, arena)? };
    Ok(unsafe { (cold as *mut u8).add(!data as usize) })
}

/// The message's cold region, if it exists.
#[inline(always)]
pub(crate) unsafe fn cold(msg: *const u8) -> Option<*const Cold> {
    let hdr = unsafe { header(msg) };
    if hdr.cold_index < 0 {
        return None;
    }
    let shared = unsafe { &*hdr.shared };
    Some(shared.cold.inline_slice::<*mut u8>()[hdr.cold_index as usize] as *const Cold)
}

/// Get or create the message's cold region.
pub(crate) unsafe fn ensure_cold(
    msg: *mut u8,
    ty: &Type,
    arena: &mut Arena<'_>,
) -> Result<*mut Cold, Error> {
    let hdr = unsafe { header_mut(msg) };
    let shared = hdr.shared as *mut Shared;
    if hdr.cold_index >= 0 {
        let list = unsafe { (*shared).cold.inline_slice::<*mut u8>() };
        return Ok(list[hdr.cold_index as usize] as *mut Cold);
    }
    let size = (ty.cold_size as usize).max(COLD_HEADER_SIZE);
    let layout = Layout::from_size_align(size, 8).map_err(|_| Error::AllocError)?;
    let region = arena.alloc_raw(layout)?.as_ptr();
    let index = unsafe { (*shared).cold.len() } as i32;
    unsafe {
        (*shared).cold.push_inline(region, 0, arena)?;
    }
    hdr.cold_index = index;
    Ok(region as *mut Cold)
}

/// Retain one unknown-field span in the cold region.
pub(crate) unsafe fn retain_unknown(
    msg: *mut u8,
    ty: &Type,
    span: Zc,
    arena: &mut Arena<'_>,
) -> Result<(), Error> {
    let cold = unsafe { ensure_cold(msg, ty, arena)? };
    unsafe { (*cold).unknown.push_inline(span, 0, arena) }
}

/// Allocate and initialize a fresh message of `ty` on the arena.
pub(crate) fn create_message(
    ty: &Type,
    type_offset: u32,
    shared: *const Shared,
    arena: &mut Arena<'_>,
) -> Result<NonNull<u8>, Error> {
    let layout = Layout::from_size_align(ty.size as usize, 8).map_err(|_| Error::AllocError)?;
    let msg = arena.alloc_raw(layout)?;
    unsafe {
        let hdr = header_mut(msg.as_ptr());
        hdr.shared = shared;
        hdr.type_offset = type_offset;
        hdr.cold_index = -1;
    }
    Ok(msg)
}
