//! Read-only reflection over parsed messages.
//!
//! [`DynamicMessage`] is a thin view: a message pointer plus the library it
//! was compiled against. Field access goes through the getter function
//! pointer the compiler installed per field, so there is no type switch
//! here; this module only supplies the getter implementations and the
//! wrapper types ([`ListRef`], [`MapRef`]) that present containers.
//!
//! All returned values borrow from the view: scalar copies aside, strings,
//! bytes and zero-copy runs alias the original input buffer.

use core::marker::PhantomData;

use crate::base::{self, Shared};
use crate::containers::{RawMap, RepMode, RepSlot, map_hash_bytes, map_hash_int};
use crate::schema::Kind;
use crate::tables::{Field, Library, Type};
use crate::wire::zigzag_decode32;
use crate::zc::Zc;

/// Message context handed to getters: the raw message plus the lifetime the
/// extracted value is allowed to carry.
#[derive(Copy, Clone)]
pub struct MsgCtx<'a> {
    pub(crate) msg: *const u8,
    pub(crate) _ph: PhantomData<&'a ()>,
}

impl<'a> MsgCtx<'a> {
    #[inline(always)]
    fn shared(self) -> &'a Shared {
        unsafe { &*base::header(self.msg).shared }
    }

    #[inline(always)]
    fn src(self) -> &'a [u8] {
        let shared = self.shared();
        unsafe { core::slice::from_raw_parts(shared.src, shared.src_len) }
    }
}

/// Extracts a reflective value from a message given its field record.
pub type Getter = for<'a> unsafe fn(MsgCtx<'a>, &'a Field) -> Option<Value<'a>>;

/// A dynamically typed view of one field value.
pub enum Value<'a> {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Enum(i32),
    String(&'a str),
    Bytes(&'a [u8]),
    Message(DynamicMessage<'a, 'a>),
    Repeated(ListRef<'a>),
    Map(MapRef<'a>),
}

/// A parsed message tied to its library (`'lib`) and to the arena and
/// source buffer it was parsed from (`'data`).
pub struct DynamicMessage<'lib, 'data> {
    lib: &'lib Library,
    msg: *const u8,
    _data: PhantomData<&'data [u8]>,
}

impl<'lib, 'data> Clone for DynamicMessage<'lib, 'data> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'lib, 'data> Copy for DynamicMessage<'lib, 'data> {}

impl<'lib, 'data> DynamicMessage<'lib, 'data> {
    /// Safety: `msg` must be a live message allocated by a parse against
    /// `lib`, outliving `'data`.
    pub(crate) unsafe fn from_raw(lib: &'lib Library, msg: *const u8) -> Self {
        DynamicMessage {
            lib,
            msg,
            _data: PhantomData,
        }
    }

    #[inline]
    pub fn ty(&self) -> &'lib Type {
        self.lib.type_at(unsafe { base::header(self.msg).type_offset })
    }

    pub fn library(&self) -> &'lib Library {
        self.lib
    }

    pub fn full_name(&self) -> &'lib str {
        let off = unsafe { base::header(self.msg).type_offset };
        &self.lib.aux_at(off).full_name
    }

    fn meta_by_name(&self, name: &str) -> Option<&'lib crate::tables::FieldMeta> {
        let off = unsafe { base::header(self.msg).type_offset };
        self.lib.aux_at(off).fields.iter().find(|m| m.name == name)
    }

    fn call_getter<'a>(&'a self, index: u32) -> Option<Value<'a>> {
        let field = &self.ty().fields()[index as usize];
        let getter = field.getter?;
        let ctx = MsgCtx {
            msg: self.msg,
            _ph: PhantomData,
        };
        unsafe { getter(ctx, field) }
    }

    /// Presence check. For repeated and map fields this is "non-empty".
    pub fn has(&self, name: &str) -> bool {
        self.meta_by_name(name)
            .is_some_and(|m| self.call_getter(m.index).is_some())
    }

    pub fn get<'a>(&'a self, name: &str) -> Option<Value<'a>> {
        self.call_getter(self.meta_by_name(name)?.index)
    }

    /// Field lookup by wire number, through the type's embedded numbers
    /// table (the path extensions take).
    pub fn get_by_number<'a>(&'a self, number: u32) -> Option<Value<'a>> {
        let ty = self.ty();
        let field = ty.by_number(number)?;
        let getter = field.getter?;
        let ctx = MsgCtx {
            msg: self.msg,
            _ph: PhantomData,
        };
        unsafe { getter(ctx, field) }
    }

    /// Name of the populated arm of the named oneof, if any.
    pub fn which_oneof(&self, oneof: &str) -> Option<&'lib str> {
        let off = unsafe { base::header(self.msg).type_offset };
        let aux = self.lib.aux_at(off);
        let idx = aux.oneofs.iter().position(|o| o == oneof)? as u16;
        let arm = aux.fields.iter().find(|m| m.oneof_index == Some(idx))?;
        let field = &self.ty().fields()[arm.index as usize];
        let number = unsafe { base::which_word(self.msg, field.offset.bit) };
        if number == 0 {
            return None;
        }
        aux.fields
            .iter()
            .find(|m| m.number == number && m.oneof_index == Some(idx))
            .map(|m| m.name.as_str())
    }

    /// `(number, value)` for every present field, in declaration order.
    pub fn present_fields<'a>(&'a self) -> Vec<(u32, Value<'a>)> {
        let off = unsafe { base::header(self.msg).type_offset };
        let aux = self.lib.aux_at(off);
        aux.fields
            .iter()
            .filter_map(|m| Some((m.number, self.call_getter(m.index)?)))
            .collect()
    }

    /// Raw spans of retained unknown fields, in wire order.
    pub fn unknown_fields<'a>(&'a self) -> impl Iterator<Item = &'a [u8]> {
        let spans: &[Zc] = match unsafe { base::cold(self.msg) } {
            Some(cold) => unsafe { (*cold).unknown.inline_slice::<Zc>() },
            None => &[],
        };
        let shared = unsafe { &*base::header(self.msg).shared };
        let src = unsafe { core::slice::from_raw_parts(shared.src, shared.src_len) };
        spans.iter().map(move |zc| zc.bytes(src))
    }

    /// Whether this message has allocated a cold region.
    pub fn has_cold_region(&self) -> bool {
        unsafe { base::header(self.msg).cold_index >= 0 }
    }
}

impl core::fmt::Debug for DynamicMessage<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let off = unsafe { base::header(self.msg).type_offset };
        let aux = self.lib.aux_at(off);
        let mut dbg = f.debug_struct(&aux.full_name);
        for meta in &aux.fields {
            if let Some(value) = self.call_getter(meta.index) {
                dbg.field(&meta.name, &value);
            }
        }
        dbg.finish()
    }
}

impl core::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Value::Bool(v) => v.fmt(f),
            Value::Int32(v) => v.fmt(f),
            Value::Int64(v) => v.fmt(f),
            Value::UInt32(v) => v.fmt(f),
            Value::UInt64(v) => v.fmt(f),
            Value::Float(v) => v.fmt(f),
            Value::Double(v) => v.fmt(f),
            Value::Enum(v) => write!(f, "enum({v})"),
            Value::String(v) => v.fmt(f),
            Value::Bytes(v) => v.fmt(f),
            Value::Message(v) => v.fmt(f),
            Value::Repeated(v) => f.debug_list().entries(v.iter()).finish(),
            Value::Map(v) => {
                let mut dbg = f.debug_map();
                for (k, val) in v.iter() {
                    dbg.entry(&k, &val);
                }
                dbg.finish()
            }
        }
    }
}

/// Element interpretation of a repeated slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ElemRepr {
    Bool,
    VarI32,
    VarU32,
    VarI64,
    VarU64,
    Zig32,
    Zig64,
    Enum,
    Fix32U,
    Fix32I,
    Fix32F,
    Fix64U,
    Fix64I,
    Fix64F,
    Span { utf8: bool },
    Msg,
}

impl ElemRepr {
    /// Width of one element in the slot's current backing storage.
    fn width(self, zero_copy: bool) -> usize {
        match self {
            ElemRepr::Bool => 1,
            ElemRepr::Fix32U | ElemRepr::Fix32I | ElemRepr::Fix32F => 4,
            ElemRepr::Fix64U | ElemRepr::Fix64I | ElemRepr::Fix64F => 8,
            ElemRepr::Span { .. } => 8,
            ElemRepr::Msg => 8,
            // Varint family: one wire byte per element in zero-copy state,
            // decoded width in arena state.
            ElemRepr::VarI32 | ElemRepr::VarU32 | ElemRepr::Zig32 | ElemRepr::Enum => {
                if zero_copy { 1 } else { 4 }
            }
            ElemRepr::VarI64 | ElemRepr::VarU64 | ElemRepr::Zig64 => {
                if zero_copy { 1 } else { 8 }
            }
        }
    }
}

/// View of a repeated field.
#[derive(Copy, Clone)]
pub struct ListRef<'a> {
    slot: &'a RepSlot,
    repr: ElemRepr,
    shared: &'a Shared,
    /// Element type for message runs, else null.
    child: *const Type,
}

impl<'a> ListRef<'a> {
    pub fn len(&self) -> usize {
        self.slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }

    /// Whether the element storage aliases the input buffer.
    pub fn is_zero_copy(&self) -> bool {
        self.slot.is_zero_copy()
    }

    /// The raw backing bytes (input buffer in zero-copy state, arena
    /// otherwise).
    pub fn storage(&self) -> &'a [u8] {
        self.slot.storage(self.repr.width(self.slot.is_zero_copy()))
    }

    pub fn get(&self, i: usize) -> Value<'a> {
        assert!(i < self.len(), "repeated index out of bounds");
        let zc = self.slot.is_zero_copy();
        let slot = self.slot;
        match self.repr {
            ElemRepr::Bool => Value::Bool(if zc {
                slot.zc_read::<u8>(i) != 0
            } else {
                slot.inline_slice::<u8>()[i] != 0
            }),
            ElemRepr::VarU32 => Value::UInt32(if zc {
                slot.zc_read::<u8>(i) as u32
            } else {
                slot.inline_slice::<u32>()[i]
            }),
            ElemRepr::VarI32 => Value::Int32(if zc {
                slot.zc_read::<u8>(i) as i32
            } else {
                slot.inline_slice::<u32>()[i] as i32
            }),
            ElemRepr::Enum => Value::Enum(if zc {
                slot.zc_read::<u8>(i) as i32
            } else {
                slot.inline_slice::<u32>()[i] as i32
            }),
            ElemRepr::VarU64 => Value::UInt64(if zc {
                slot.zc_read::<u8>(i) as u64
            } else {
                slot.inline_slice::<u64>()[i]
            }),
            ElemRepr::VarI64 => Value::Int64(if zc {
                slot.zc_read::<u8>(i) as i64
            } else {
                slot.inline_slice::<u64>()[i] as i64
            }),
            // Zigzag zero-copy runs decode lazily, right here.
            ElemRepr::Zig32 => Value::Int32(if zc {
                zigzag_decode32(slot.zc_read::<u8>(i) as u32)
            } else {
                slot.inline_slice::<i32>()[i]
            }),
            ElemRepr::Zig64 => Value::Int64(if zc {
                crate::wire::zigzag_decode64(slot.zc_read::<u8>(i) as u64)
            } else {
                slot.inline_slice::<i64>()[i]
            }),
            ElemRepr::Fix32U => Value::UInt32(if zc {
                slot.zc_read::<u32>(i)
            } else {
                slot.inline_slice::<u32>()[i]
            }),
            ElemRepr::Fix32I => Value::Int32(if zc {
                slot.zc_read::<u32>(i) as i32
            } else {
                slot.inline_slice::<u32>()[i] as i32
            }),
            ElemRepr::Fix32F => Value::Float(f32::from_bits(if zc {
                slot.zc_read::<u32>(i)
            } else {
                slot.inline_slice::<u32>()[i]
            })),
            ElemRepr::Fix64U => Value::UInt64(if zc {
                slot.zc_read::<u64>(i)
            } else {
                slot.inline_slice::<u64>()[i]
            }),
            ElemRepr::Fix64I => Value::Int64(if zc {
                slot.zc_read::<u64>(i) as i64
            } else {
                slot.inline_slice::<u64>()[i] as i64
            }),
            ElemRepr::Fix64F => Value::Double(f64::from_bits(if zc {
                slot.zc_read::<u64>(i)
            } else {
                slot.inline_slice::<u64>()[i]
            })),
            ElemRepr::Span { utf8 } => {
                let span = slot.inline_slice::<Zc>()[i];
                let bytes = span.bytes(self.shared_src());
                if utf8 {
                    Value::String(unsafe { core::str::from_utf8_unchecked(bytes) })
                } else {
                    Value::Bytes(bytes)
                }
            }
            ElemRepr::Msg => {
                let ty = unsafe { &*self.child };
                let msg = self.slot.msg_at(i, ty.size as usize);
                Value::Message(unsafe {
                    DynamicMessage::from_raw(self.shared.library(), msg)
                })
            }
        }
    }

    fn shared_src(&self) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.shared.src, self.shared.src_len) }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value<'a>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// A map key extracted for iteration or lookup.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MapKey<'a> {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    String(&'a str),
}

/// View of a map field.
#[derive(Copy, Clone)]
pub struct MapRef<'a> {
    map: &'a RawMap,
    key_kind: Kind,
    val_kind: Kind,
    shared: &'a Shared,
}

impl<'a> MapRef<'a> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn src(&self) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.shared.src, self.shared.src_len) }
    }

    fn key_value(&self, bits: u64) -> MapKey<'a> {
        match self.key_kind {
            Kind::Bool => MapKey::Bool(bits != 0),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => MapKey::Int32(bits as u32 as i32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => MapKey::Int64(bits as i64),
            Kind::Uint32 | Kind::Fixed32 => MapKey::UInt32(bits as u32),
            Kind::Uint64 | Kind::Fixed64 => MapKey::UInt64(bits as u64),
            Kind::String => {
                let bytes = Zc::from_bits(bits).bytes(self.src());
                MapKey::String(unsafe { core::str::from_utf8_unchecked(bytes) })
            }
            _ => unreachable!("invalid map key kind"),
        }
    }

    fn value(&self, bits: u64) -> Value<'a> {
        match self.val_kind {
            Kind::Bool => Value::Bool(bits != 0),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::Int32(bits as u32 as i32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::Int64(bits as i64),
            Kind::Uint32 | Kind::Fixed32 => Value::UInt32(bits as u32),
            Kind::Uint64 | Kind::Fixed64 => Value::UInt64(bits),
            Kind::Enum => Value::Enum(bits as u32 as i32),
            Kind::Float => Value::Float(f32::from_bits(bits as u32)),
            Kind::Double => Value::Double(f64::from_bits(bits)),
            Kind::String => {
                let bytes = Zc::from_bits(bits).bytes(self.src());
                Value::String(unsafe { core::str::from_utf8_unchecked(bytes) })
            }
            Kind::Bytes => Value::Bytes(Zc::from_bits(bits).bytes(self.src())),
            Kind::Message => Value::Message(unsafe {
                DynamicMessage::from_raw(self.shared.library(), bits as usize as *const u8)
            }),
        }
    }

    pub fn get(&self, key: MapKey<'_>) -> Option<Value<'a>> {
        match key {
            MapKey::String(s) => {
                let src = self.src();
                let entry = self.map.lookup(map_hash_bytes(s.as_bytes()), |existing| {
                    Zc::from_bits(existing).bytes(src) == s.as_bytes()
                })?;
                Some(self.value(entry.val))
            }
            _ => {
                let bits = match key {
                    MapKey::Bool(b) => b as u64,
                    MapKey::Int32(v) => v as u32 as u64,
                    MapKey::Int64(v) => v as u64,
                    MapKey::UInt32(v) => v as u64,
                    MapKey::UInt64(v) => v,
                    MapKey::String(_) => unreachable!(),
                };
                let entry = self.map.lookup(map_hash_int(bits), |existing| existing == bits)?;
                Some(self.value(entry.val))
            }
        }
    }

    /// Iterate entries in table order (insertion order is not preserved).
    pub fn iter(&self) -> impl Iterator<Item = (MapKey<'a>, Value<'a>)> + '_ {
        self.map
            .entries()
            .iter()
            .filter(|e| e.hash != 0)
            .map(move |e| (self.key_value(e.key), self.value(e.val)))
    }
}

// ---------------------------------------------------------------------------
// Getter implementations installed by the compiler.

#[inline(always)]
unsafe fn read_scalar<'a, T: Copy>(ctx: MsgCtx<'a>, field: &'a Field) -> Option<T> {
    unsafe {
        if !base::is_present(ctx.msg, field.offset) {
            return None;
        }
        let slot = base::slot_ptr(ctx.msg, field.offset.data)?;
        Some(core::ptr::read(slot as *const T))
    }
}

macro_rules! scalar_getter {
    ($name:ident, $ty:ty, $variant:ident) => {
        pub(crate) unsafe fn $name<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
            unsafe { read_scalar::<$ty>(ctx, f).map(Value::$variant) }
        }
    };
}

scalar_getter!(g_int32, i32, Int32);
scalar_getter!(g_uint32, u32, UInt32);
scalar_getter!(g_int64, i64, Int64);
scalar_getter!(g_uint64, u64, UInt64);
scalar_getter!(g_float, f32, Float);
scalar_getter!(g_double, f64, Double);
scalar_getter!(g_enum, i32, Enum);

pub(crate) unsafe fn g_bool<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
    unsafe { read_scalar::<u8>(ctx, f).map(|v| Value::Bool(v != 0)) }
}

pub(crate) unsafe fn g_string<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
    let span = unsafe { read_scalar::<Zc>(ctx, f)? };
    let bytes = span.bytes(ctx.src());
    Some(Value::String(unsafe {
        core::str::from_utf8_unchecked(bytes)
    }))
}

pub(crate) unsafe fn g_bytes<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
    let span = unsafe { read_scalar::<Zc>(ctx, f)? };
    Some(Value::Bytes(span.bytes(ctx.src())))
}

pub(crate) unsafe fn g_message<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
    let child = unsafe { read_scalar::<*const u8>(ctx, f)? };
    if child.is_null() {
        return None;
    }
    let lib = ctx.shared().library();
    Some(Value::Message(unsafe { DynamicMessage::from_raw(lib, child) }))
}

#[inline(always)]
unsafe fn read_list<'a>(ctx: MsgCtx<'a>, f: &'a Field, repr: ElemRepr) -> Option<Value<'a>> {
    let slot = unsafe { base::slot_ptr(ctx.msg, f.offset.data)? };
    let slot = unsafe { &*(slot as *const RepSlot) };
    if slot.is_empty() && matches!(slot.mode(), RepMode::Empty) {
        return None;
    }
    Some(Value::Repeated(ListRef {
        slot,
        repr,
        shared: ctx.shared(),
        child: f.message,
    }))
}

macro_rules! list_getter {
    ($name:ident, $repr:expr) => {
        pub(crate) unsafe fn $name<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
            unsafe { read_list(ctx, f, $repr) }
        }
    };
}

list_getter!(g_rep_bool, ElemRepr::Bool);
list_getter!(g_rep_int32, ElemRepr::VarI32);
list_getter!(g_rep_uint32, ElemRepr::VarU32);
list_getter!(g_rep_int64, ElemRepr::VarI64);
list_getter!(g_rep_uint64, ElemRepr::VarU64);
list_getter!(g_rep_sint32, ElemRepr::Zig32);
list_getter!(g_rep_sint64, ElemRepr::Zig64);
list_getter!(g_rep_enum, ElemRepr::Enum);
list_getter!(g_rep_fixed32, ElemRepr::Fix32U);
list_getter!(g_rep_sfixed32, ElemRepr::Fix32I);
list_getter!(g_rep_float, ElemRepr::Fix32F);
list_getter!(g_rep_fixed64, ElemRepr::Fix64U);
list_getter!(g_rep_sfixed64, ElemRepr::Fix64I);
list_getter!(g_rep_double, ElemRepr::Fix64F);
list_getter!(g_rep_string, ElemRepr::Span { utf8: true });
list_getter!(g_rep_bytes, ElemRepr::Span { utf8: false });
list_getter!(g_rep_message, ElemRepr::Msg);

pub(crate) unsafe fn g_map<'a>(ctx: MsgCtx<'a>, f: &'a Field) -> Option<Value<'a>> {
    let slot = unsafe { base::slot_ptr(ctx.msg, f.offset.data)? };
    let map = unsafe { *(slot as *const *const RawMap) };
    if map.is_null() {
        return None;
    }
    let lib = ctx.shared().library();
    let entry_off = lib.offset_of(f.message);
    let aux = lib.aux_at(entry_off);
    Some(Value::Map(MapRef {
        map: unsafe { &*map },
        key_kind: aux.fields[0].kind,
        val_kind: aux.fields[1].kind,
        shared: ctx.shared(),
    }))
}
