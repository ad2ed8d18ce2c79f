//! The parser VM.
//!
//! A thunk-threaded interpreter over a linked library. Per-parse state is
//! a cursor bounded by the current length limit, the current message, the
//! current [`FieldParser`], and an explicit frame stack for message descent.
//!
//! Dispatch first tries the fast path: with at least eight readable bytes,
//! one unaligned word load masked by the expected parser's tag mask is
//! compared against its folded tag image; a hit means the wire holds exactly
//! the canonical encoding of the expected tag, so sequential fields cost one
//! compare. Otherwise the tag is fully decoded and looked up in the type's
//! tag table. Each hit dispatches through the parser's thunk, then control
//! threads to the statically chosen successor.

use core::ptr;

use crate::Error;
use crate::arena::Arena;
use crate::base::{self, Shared};
use crate::containers::{RawMap, RepMode, RepSlot, map_hash_bytes, map_hash_int};
use crate::reflection::DynamicMessage;
use crate::tables::{FieldParser, Library, TypeParser};
use crate::wire::{ReadCursor, WireType, tag_wire_image, zigzag_decode32, zigzag_decode64};
use crate::zc::Zc;

/// What a thunk tells the dispatch loop to do next.
pub enum Ctl {
    /// Thread to `parser.next_ok`.
    Next,
    /// The thunk redirected control itself (message descent).
    Jump,
}

/// One field-decoding step. Installed per field at compile time; the VM
/// never switches on field kind at run time.
pub type Thunk = unsafe fn(&mut Decoder<'_, '_>, &FieldParser) -> Result<Ctl, Error>;

/// Storage classes of map entry key/value slots, as const parameters of the
/// monomorphized map thunks.
pub(crate) const SC_W1: u8 = 0;
pub(crate) const SC_W4: u8 = 1;
pub(crate) const SC_W8: u8 = 2;
pub(crate) const SC_ZC: u8 = 3;
pub(crate) const SC_MSG: u8 = 4;

struct Frame {
    msg: *mut u8,
    tp: *const TypeParser,
    resume: *const FieldParser,
    end: *const u8,
    commit: Commit,
}

enum Commit {
    None,
    /// Fold the popped scratch entry message into the map at `slot`.
    Map {
        slot: *mut *mut RawMap,
        key_class: u8,
        val_class: u8,
    },
}

pub struct Decoder<'a, 'al> {
    pub(crate) cursor: ReadCursor,
    pub(crate) msg: *mut u8,
    pub(crate) tp: *const TypeParser,
    pub(crate) parser: *const FieldParser,
    pub(crate) shared: *mut Shared,
    pub(crate) arena: &'a mut Arena<'al>,
    pub(crate) lib: &'a Library,
    stack: Vec<Frame>,
    recursion_limit: usize,
}

impl Library {
    /// Parse `src` as a message of type `full_name` into `arena`.
    ///
    /// The returned message borrows both the arena and the source buffer:
    /// string, bytes and packed scalar values alias `src` rather than
    /// copying it.
    pub fn parse<'lib, 'data>(
        &'lib self,
        full_name: &str,
        src: &'data [u8],
        arena: &'data mut Arena<'_>,
    ) -> Result<DynamicMessage<'lib, 'data>, Error> {
        let type_offset = self
            .type_offset(full_name)
            .ok_or_else(|| Error::TypeNotFound(full_name.to_string()))?;
        let ty = self.type_at(type_offset);

        let shared = arena.alloc::<Shared>()?;
        unsafe {
            (*shared).src = src.as_ptr();
            (*shared).src_len = src.len();
            (*shared).lib = self as *const Library;
        }
        let root = base::create_message(ty, type_offset, shared, arena)?;
        let tp = ty.parser;

        let mut decoder = Decoder {
            cursor: ReadCursor::new(src),
            msg: root.as_ptr(),
            tp,
            parser: unsafe { (*tp).entrypoint },
            shared,
            arena,
            lib: self,
            stack: Vec::new(),
            recursion_limit: self.options.recursion_limit as usize,
        };
        decoder.run()?;
        Ok(unsafe { DynamicMessage::from_raw(self, root.as_ptr()) })
    }
}

impl<'a, 'al> Decoder<'a, 'al> {
    fn run(&mut self) -> Result<(), Error> {
        loop {
            while !self.cursor.at_end() {
                self.dispatch()?;
            }
            if self.stack.is_empty() {
                return Ok(());
            }
            self.pop_frame()?;
        }
    }

    #[inline(always)]
    fn dispatch(&mut self) -> Result<(), Error> {
        let expected = self.parser;
        if !expected.is_null() && self.cursor.has(8) {
            let fp = unsafe { &*expected };
            let word = unsafe { self.cursor.load_word() };
            if word & fp.tag_mask == tag_wire_image(fp.tag, fp.tag_mask) {
                self.cursor.advance_tag(fp.tag_mask.count_ones() / 8);
                return self.invoke(fp);
            }
        }
        self.dispatch_slow()
    }

    #[inline(always)]
    fn invoke(&mut self, fp: &FieldParser) -> Result<(), Error> {
        match unsafe { (fp.parse)(self, fp) }? {
            Ctl::Next => {
                self.parser = fp.next_ok;
                Ok(())
            }
            Ctl::Jump => Ok(()),
        }
    }

    #[inline(never)]
    fn dispatch_slow(&mut self) -> Result<(), Error> {
        let tag_start = self.cursor.ptr;
        let tag = self.cursor.read_tag()?;
        if tag >> 3 == 0 {
            return Err(Error::InvalidTag);
        }
        let tp = unsafe { &*self.tp };
        if let Some(fp) = tp.find_tag(crate::wire::fold_tag(tag)) {
            log::trace!("field {} wire {} via tag table", tag >> 3, tag & 7);
            return self.invoke(fp);
        }
        self.unknown_field(tag, tag_start)
    }

    /// Skip (or retain) a field the tag table does not know.
    fn unknown_field(&mut self, tag: u32, tag_start: *const u8) -> Result<(), Error> {
        log::trace!("unknown field {} wire {}", tag >> 3, tag & 7);
        let wire = WireType::try_from((tag & 7) as u8)
            .map_err(|_| Error::UnknownWireType((tag & 7) as u8))?;
        match wire {
            WireType::Varint => {
                self.cursor.read_varint()?;
            }
            WireType::Fixed64 => {
                if !self.cursor.has(8) {
                    return Err(Error::Truncated);
                }
                self.cursor.skip(8);
            }
            WireType::Len => {
                let len = self.cursor.read_size()?;
                self.cursor.skip(len);
            }
            WireType::StartGroup | WireType::EndGroup => return Err(Error::GroupUnsupported),
            WireType::Fixed32 => {
                if !self.cursor.has(4) {
                    return Err(Error::Truncated);
                }
                self.cursor.skip(4);
            }
        }
        let tp = unsafe { &*self.tp };
        if tp.discard_unknown == 0 {
            let ty = self.lib.type_at(tp.type_offset);
            let src = unsafe { (*self.shared).src };
            let start = (tag_start as usize - src as usize) as u32;
            let span = Zc::new(start, self.cursor.offset_from(src));
            unsafe { base::retain_unknown(self.msg, ty, span, self.arena)? };
        }
        // Resync the expectation to the next field in number order.
        if !self.parser.is_null() {
            self.parser = unsafe { (*self.parser).next_err };
        }
        Ok(())
    }

    /// Enter a length-delimited sub-parse whose payload is the next
    /// `inner_len` bytes (already bounds-checked by `read_size`).
    fn push_frame(
        &mut self,
        resume: *const FieldParser,
        inner_len: usize,
        commit: Commit,
    ) -> Result<(), Error> {
        if self.stack.len() >= self.recursion_limit {
            return Err(Error::RecursionLimit);
        }
        self.stack.push(Frame {
            msg: self.msg,
            tp: self.tp,
            resume,
            end: self.cursor.end,
            commit,
        });
        self.cursor.end = unsafe { self.cursor.ptr.add(inner_len) };
        Ok(())
    }

    fn pop_frame(&mut self) -> Result<(), Error> {
        let frame = self.stack.pop().expect("pop on empty parse stack");
        if let Commit::Map {
            slot,
            key_class,
            val_class,
        } = frame.commit
        {
            let entry = self.msg;
            self.commit_map_entry(slot, key_class, val_class, entry)?;
        }
        self.msg = frame.msg;
        self.tp = frame.tp;
        self.parser = frame.resume;
        self.cursor.end = frame.end;
        Ok(())
    }

    /// The message slot for `fp`, allocating the cold region if the field
    /// lives there.
    #[inline(always)]
    unsafe fn slot(&mut self, fp: &FieldParser) -> Result<*mut u8, Error> {
        if fp.offset.data >= 0 {
            return Ok(unsafe { self.msg.add(fp.offset.data as usize) });
        }
        let ty = self.lib.type_at(unsafe { (*self.tp).type_offset });
        unsafe { base::slot_ptr_mut(self.msg, fp.offset.data, ty, self.arena) }
    }

    #[inline(always)]
    unsafe fn store<T: Copy>(&mut self, fp: &FieldParser, val: T) -> Result<Ctl, Error> {
        let slot = unsafe { self.slot(fp)? };
        unsafe {
            (slot as *mut T).write(val);
            base::mark_present(self.msg, fp.offset);
        }
        Ok(Ctl::Next)
    }

    #[inline(always)]
    unsafe fn rep_slot<'s>(&mut self, fp: &FieldParser) -> Result<&'s mut RepSlot, Error> {
        let slot = unsafe { self.slot(fp)? };
        Ok(unsafe { &mut *(slot as *mut RepSlot) })
    }

    fn commit_map_entry(
        &mut self,
        slot: *mut *mut RawMap,
        key_class: u8,
        val_class: u8,
        entry: *mut u8,
    ) -> Result<(), Error> {
        let entry_ty = self.lib.type_at(unsafe { base::header(entry).type_offset });
        let fields = entry_ty.fields();
        let key_off = fields[0].offset.data;
        let val_off = fields[1].offset.data;
        debug_assert!(key_off >= 0 && val_off >= 0);

        let key_bits = unsafe { read_slot_bits(entry, key_off, key_class) };
        let mut val_bits = unsafe { read_slot_bits(entry, val_off, val_class) };

        // A missing message value still maps to a (default, empty) message.
        if val_class == SC_MSG && val_bits == 0 {
            let child_ty = unsafe { &*fields[1].message };
            let child_off = self.lib.offset_of(fields[1].message);
            let m = base::create_message(child_ty, child_off, self.shared, self.arena)?;
            val_bits = m.as_ptr() as u64;
        }

        let map = unsafe {
            if (*slot).is_null() {
                *slot = RawMap::create(self.arena)?;
            }
            &mut **slot
        };

        if key_class == SC_ZC {
            let src = unsafe { (*self.shared).src_bytes() };
            let key = Zc::from_bits(key_bits);
            let hash = map_hash_bytes(key.bytes(src));
            map.insert(
                hash,
                key_bits,
                val_bits,
                |existing| Zc::from_bits(existing).bytes(src) == key.bytes(src),
                self.arena,
            )
        } else {
            let hash = map_hash_int(key_bits);
            map.insert(hash, key_bits, val_bits, |existing| existing == key_bits, self.arena)
        }
    }
}

/// Zero-extended image of a scalar slot.
unsafe fn read_slot_bits(msg: *const u8, data: i32, class: u8) -> u64 {
    let slot = unsafe { msg.add(data as usize) };
    unsafe {
        match class {
            SC_W1 => *slot as u64,
            SC_W4 => ptr::read(slot as *const u32) as u64,
            SC_W8 | SC_ZC => ptr::read(slot as *const u64),
            SC_MSG => ptr::read(slot as *const *mut u8) as u64,
            _ => unreachable!(),
        }
    }
}

// ---------------------------------------------------------------------------
// Singular scalar thunks.

pub(crate) unsafe fn t_varint64(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    unsafe { dec.store(fp, v) }
}

pub(crate) unsafe fn t_varint32(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    unsafe { dec.store(fp, v as u32) }
}

pub(crate) unsafe fn t_sint32(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    unsafe { dec.store(fp, zigzag_decode32(v as u32)) }
}

pub(crate) unsafe fn t_sint64(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    unsafe { dec.store(fp, zigzag_decode64(v)) }
}

pub(crate) unsafe fn t_bool(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    unsafe { dec.store(fp, (v != 0) as u8) }
}

pub(crate) unsafe fn t_fixed32(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_fixed32()?;
    unsafe { dec.store(fp, v) }
}

pub(crate) unsafe fn t_fixed64(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let v = dec.cursor.read_fixed64()?;
    unsafe { dec.store(fp, v) }
}

// ---------------------------------------------------------------------------
// String / bytes thunks. The payload is never copied; the slot records a
// source range.

#[inline(always)]
unsafe fn read_span(dec: &mut Decoder<'_, '_>) -> Result<Zc, Error> {
    let len = dec.cursor.read_size()?;
    let src = unsafe { (*dec.shared).src };
    let start = (dec.cursor.ptr as usize - src as usize) as u32;
    dec.cursor.skip(len);
    Ok(Zc::new(start, start + len as u32))
}

pub(crate) unsafe fn t_string(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let span = unsafe { read_span(dec)? };
    let src = unsafe { (*dec.shared).src_bytes() };
    if core::str::from_utf8(span.bytes(src)).is_err() {
        return Err(Error::InvalidUtf8);
    }
    unsafe { dec.store(fp, span) }
}

pub(crate) unsafe fn t_bytes(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let span = unsafe { read_span(dec)? };
    unsafe { dec.store(fp, span) }
}

pub(crate) unsafe fn t_rep_string(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let span = unsafe { read_span(dec)? };
    let src = unsafe { (*dec.shared).src_bytes() };
    if core::str::from_utf8(span.bytes(src)).is_err() {
        return Err(Error::InvalidUtf8);
    }
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };
    slot.push_inline(span, preload, dec.arena)?;
    Ok(Ctl::Next)
}

pub(crate) unsafe fn t_rep_bytes(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let span = unsafe { read_span(dec)? };
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };
    slot.push_inline(span, preload, dec.arena)?;
    Ok(Ctl::Next)
}

// ---------------------------------------------------------------------------
// Repeated scalar thunks. Unpacked forms append one element; packed forms
// consume the whole run, entering the zero-copy state when the run can be
// aliased directly.

#[inline(always)]
unsafe fn rep_append_varint<T: Copy>(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<Ctl, Error> {
    let v = dec.cursor.read_varint()?;
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };
    if slot.is_zero_copy() {
        materialize_varint(slot, &decode, dec.arena)?;
    }
    slot.push_inline(decode(v), preload, dec.arena)?;
    Ok(Ctl::Next)
}

/// Decode a zero-copy varint run (one byte per element) into arena storage.
fn materialize_varint<T: Copy>(
    slot: &mut RepSlot,
    decode: &impl Fn(u64) -> T,
    arena: &mut Arena<'_>,
) -> Result<(), Error> {
    let bytes: Vec<u8> = slot.storage(1).to_vec();
    *slot = unsafe { core::mem::zeroed() };
    slot.reserve_inline::<T>(bytes.len() + 1, arena)?;
    for b in bytes {
        slot.push_inline(decode(b as u64), 0, arena)?;
    }
    Ok(())
}

#[inline(always)]
unsafe fn rep_packed_varint<T: Copy>(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<Ctl, Error> {
    let len = dec.cursor.read_size()?;
    if len == 0 {
        return Ok(Ctl::Next);
    }
    let run = dec.cursor.ptr;
    let run_bytes = unsafe { core::slice::from_raw_parts(run, len) };
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };

    // A run of single-byte elements can alias the input outright; zigzag
    // runs decode lazily at read time.
    if matches!(slot.mode(), RepMode::Empty) && run_bytes.iter().all(|&b| b < 0x80) {
        slot.set_zero_copy(run, len);
        dec.cursor.skip(len);
        return Ok(Ctl::Next);
    }
    if slot.is_zero_copy() {
        materialize_varint(slot, &decode, dec.arena)?;
    }

    let mut inner = ReadCursor {
        ptr: run,
        end: unsafe { run.add(len) },
    };
    while !inner.at_end() {
        let v = inner.read_varint()?;
        slot.push_inline(decode(v), preload, dec.arena)?;
    }
    dec.cursor.skip(len);
    Ok(Ctl::Next)
}

#[inline(always)]
unsafe fn rep_append_fixed<T: Copy>(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
    val: T,
) -> Result<Ctl, Error> {
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };
    if slot.is_zero_copy() {
        slot.materialize_fixed::<T>(dec.arena)?;
    }
    slot.push_inline(val, preload, dec.arena)?;
    Ok(Ctl::Next)
}

#[inline(always)]
unsafe fn rep_packed_fixed<T: Copy>(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let len = dec.cursor.read_size()?;
    if len == 0 {
        return Ok(Ctl::Next);
    }
    if len % core::mem::size_of::<T>() != 0 {
        return Err(Error::Truncated);
    }
    let count = len / core::mem::size_of::<T>();
    let run = dec.cursor.ptr;
    let preload = fp.preload;
    let slot = unsafe { dec.rep_slot(fp)? };

    if matches!(slot.mode(), RepMode::Empty) {
        slot.set_zero_copy(run, count);
        dec.cursor.skip(len);
        return Ok(Ctl::Next);
    }
    if slot.is_zero_copy() {
        slot.materialize_fixed::<T>(dec.arena)?;
    }
    slot.reserve_inline::<T>(count, dec.arena)?;
    for i in 0..count {
        let val = unsafe {
            core::ptr::read_unaligned((run as *const T).byte_add(i * core::mem::size_of::<T>()))
        };
        slot.push_inline(val, preload, dec.arena)?;
    }
    dec.cursor.skip(len);
    Ok(Ctl::Next)
}

pub(crate) unsafe fn t_rep_varint64(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_append_varint(dec, fp, |v| v) }
}

pub(crate) unsafe fn t_rep_varint64_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_varint(dec, fp, |v| v) }
}

pub(crate) unsafe fn t_rep_varint32(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_append_varint(dec, fp, |v| v as u32) }
}

pub(crate) unsafe fn t_rep_varint32_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_varint(dec, fp, |v| v as u32) }
}

pub(crate) unsafe fn t_rep_sint32(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_append_varint(dec, fp, |v| zigzag_decode32(v as u32)) }
}

pub(crate) unsafe fn t_rep_sint32_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_varint(dec, fp, |v| zigzag_decode32(v as u32)) }
}

pub(crate) unsafe fn t_rep_sint64(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_append_varint(dec, fp, zigzag_decode64) }
}

pub(crate) unsafe fn t_rep_sint64_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_varint(dec, fp, zigzag_decode64) }
}

pub(crate) unsafe fn t_rep_bool(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_append_varint(dec, fp, |v| (v != 0) as u8) }
}

pub(crate) unsafe fn t_rep_bool_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_varint(dec, fp, |v| (v != 0) as u8) }
}

pub(crate) unsafe fn t_rep_fixed32(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let v = dec.cursor.read_fixed32()?;
    unsafe { rep_append_fixed(dec, fp, v) }
}

pub(crate) unsafe fn t_rep_fixed32_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_fixed::<u32>(dec, fp) }
}

pub(crate) unsafe fn t_rep_fixed64(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let v = dec.cursor.read_fixed64()?;
    unsafe { rep_append_fixed(dec, fp, v) }
}

pub(crate) unsafe fn t_rep_fixed64_packed(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    unsafe { rep_packed_fixed::<u64>(dec, fp) }
}

// ---------------------------------------------------------------------------
// Message descent thunks.

pub(crate) unsafe fn t_message(dec: &mut Decoder<'_, '_>, fp: &FieldParser) -> Result<Ctl, Error> {
    let len = dec.cursor.read_size()?;
    let child_tp = fp.message;
    let child_off = unsafe { (*child_tp).type_offset };
    let child_ty = dec.lib.type_at(child_off);

    let slot = unsafe { dec.slot(fp)? } as *mut *mut u8;
    // Merge into an existing sub-message, except when a oneof switched arms
    // underneath it.
    let present = unsafe { base::is_present(dec.msg, fp.offset) };
    let child = unsafe {
        if present && !(*slot).is_null() {
            *slot
        } else {
            let m = base::create_message(child_ty, child_off, dec.shared, dec.arena)?;
            *slot = m.as_ptr();
            m.as_ptr()
        }
    };
    unsafe { base::mark_present(dec.msg, fp.offset) };

    dec.push_frame(fp.next_ok, len, Commit::None)?;
    dec.msg = child;
    dec.tp = child_tp;
    dec.parser = unsafe { (*child_tp).entrypoint };
    Ok(Ctl::Jump)
}

pub(crate) unsafe fn t_rep_message(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let len = dec.cursor.read_size()?;
    let child_tp = fp.message;
    let child_off = unsafe { (*child_tp).type_offset };
    let child_ty = dec.lib.type_at(child_off);

    let preload = fp.preload;
    let shared = dec.shared;
    let slot = unsafe { dec.rep_slot(fp)? };
    let child = slot.push_msg(child_ty.size as usize, preload, dec.arena)?;
    unsafe {
        let hdr = base::header_mut(child.as_ptr());
        hdr.shared = shared;
        hdr.type_offset = child_off;
        hdr.cold_index = -1;
    }

    dec.push_frame(fp.next_ok, len, Commit::None)?;
    dec.msg = child.as_ptr();
    dec.tp = child_tp;
    dec.parser = unsafe { (*child_tp).entrypoint };
    Ok(Ctl::Jump)
}

/// Map fields parse each entry into a scratch message of the synthesized
/// entry type via its `map_entry` program, then fold it into the flat table
/// when the entry frame pops.
pub(crate) unsafe fn t_map<const K: u8, const V: u8>(
    dec: &mut Decoder<'_, '_>,
    fp: &FieldParser,
) -> Result<Ctl, Error> {
    let len = dec.cursor.read_size()?;
    let entry_tp = fp.message;
    let entry_off = unsafe { (*entry_tp).type_offset };
    let entry_ty = dec.lib.type_at(entry_off);

    let scratch = base::create_message(entry_ty, entry_off, dec.shared, dec.arena)?;
    let slot = unsafe { dec.slot(fp)? } as *mut *mut RawMap;

    dec.push_frame(
        fp.next_ok,
        len,
        Commit::Map {
            slot,
            key_class: K,
            val_class: V,
        },
    )?;
    dec.msg = scratch.as_ptr();
    dec.tp = entry_tp;
    dec.parser = unsafe { (*entry_tp).map_entry };
    Ok(Ctl::Jump)
}
