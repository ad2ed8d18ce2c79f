//! The archetype catalog.
//!
//! An [`Archetype`] bundles everything the compiler needs to lay out and
//! decode one class of field: slot size and alignment, presence-bit count,
//! the reflective getter to install, and the decoding thunk(s) keyed by wire
//! form. Selection happens once per field at compile time; the parse loop
//! then runs entirely on the installed function pointers.

use crate::decoding::{self, SC_MSG, SC_W1, SC_W4, SC_W8, SC_ZC, Thunk};
use crate::reflection::{self, Getter};
use crate::schema::{FieldSchema, Kind, Syntax};
use crate::wire::WireType;

pub(crate) struct Archetype {
    /// Hot/cold slot bytes and alignment.
    pub size: u32,
    pub align: u32,
    /// Presence bits to allocate in the bitset (oneof arms get a shared
    /// 32-bit block from the compiler instead).
    pub bits: u32,
    pub getter: Getter,
    /// Canonical wire form and its thunk.
    pub wire: WireType,
    pub thunk: Thunk,
    /// Alternate wire form: the packed/unpacked dual for repeated scalars.
    pub alt: Option<(WireType, Thunk)>,
}

const SLOT_PTR: (u32, u32) = (8, 8);
const SLOT_REP: (u32, u32) = (16, 8);
const SLOT_SPAN: (u32, u32) = (8, 8);

fn singular(size: u32, align: u32, wire: WireType, thunk: Thunk, getter: Getter) -> Archetype {
    Archetype {
        size,
        align,
        bits: 1,
        getter,
        wire,
        thunk,
        alt: None,
    }
}

/// Repeated scalar: the syntax/packed option picks which wire form is
/// canonical; the other stays reachable through the tag table.
fn repeated_scalar(
    elem_wire: WireType,
    unpacked: Thunk,
    packed: Thunk,
    getter: Getter,
    packed_default: bool,
) -> Archetype {
    let (wire, thunk, alt) = if packed_default {
        (WireType::Len, packed, Some((elem_wire, unpacked)))
    } else {
        (elem_wire, unpacked, Some((WireType::Len, packed)))
    };
    Archetype {
        size: SLOT_REP.0,
        align: SLOT_REP.1,
        bits: 0,
        getter,
        wire,
        thunk,
        alt,
    }
}

/// Storage class of a map entry slot, for the monomorphized map thunks.
pub(crate) fn slot_class(kind: Kind) -> u8 {
    match kind {
        Kind::Bool => SC_W1,
        Kind::Int32
        | Kind::Uint32
        | Kind::Sint32
        | Kind::Fixed32
        | Kind::Sfixed32
        | Kind::Float
        | Kind::Enum => SC_W4,
        Kind::Int64
        | Kind::Uint64
        | Kind::Sint64
        | Kind::Fixed64
        | Kind::Sfixed64
        | Kind::Double => SC_W8,
        Kind::String | Kind::Bytes => SC_ZC,
        Kind::Message => SC_MSG,
    }
}

/// The monomorphized map thunk for a (key class, value class) shape.
fn map_thunk(key: u8, val: u8) -> Thunk {
    macro_rules! shapes {
        ($($k:ident, $v:ident);* $(;)?) => {
            match (key, val) {
                $( ($k, $v) => decoding::t_map::<{ $k }, { $v }>, )*
                _ => unreachable!("invalid map shape"),
            }
        };
    }
    shapes!(
        SC_W1, SC_W1; SC_W1, SC_W4; SC_W1, SC_W8; SC_W1, SC_ZC; SC_W1, SC_MSG;
        SC_W4, SC_W1; SC_W4, SC_W4; SC_W4, SC_W8; SC_W4, SC_ZC; SC_W4, SC_MSG;
        SC_W8, SC_W1; SC_W8, SC_W4; SC_W8, SC_W8; SC_W8, SC_ZC; SC_W8, SC_MSG;
        SC_ZC, SC_W1; SC_ZC, SC_W4; SC_ZC, SC_W8; SC_ZC, SC_ZC; SC_ZC, SC_MSG;
    )
}

/// Select the archetype for one field.
///
/// `check_utf8` is the compiler's string-promotion decision (profile,
/// syntax, and configuration already folded in). `map_shape` is set for map
/// fields, carrying the entry's (key, value) storage classes.
pub(crate) fn select(
    field: &FieldSchema,
    syntax: Syntax,
    check_utf8: bool,
    map_shape: Option<(u8, u8)>,
) -> Archetype {
    use WireType::*;

    if let Some((key, val)) = map_shape {
        return Archetype {
            size: SLOT_PTR.0,
            align: SLOT_PTR.1,
            bits: 0,
            getter: reflection::g_map,
            wire: Len,
            thunk: map_thunk(key, val),
            alt: None,
        };
    }

    if field.is_repeated() {
        let packed = field.packed_by_default(syntax);
        return match field.kind {
            Kind::Bool => repeated_scalar(
                Varint,
                decoding::t_rep_bool,
                decoding::t_rep_bool_packed,
                reflection::g_rep_bool,
                packed,
            ),
            Kind::Int32 => repeated_scalar(
                Varint,
                decoding::t_rep_varint32,
                decoding::t_rep_varint32_packed,
                reflection::g_rep_int32,
                packed,
            ),
            Kind::Uint32 => repeated_scalar(
                Varint,
                decoding::t_rep_varint32,
                decoding::t_rep_varint32_packed,
                reflection::g_rep_uint32,
                packed,
            ),
            Kind::Enum => repeated_scalar(
                Varint,
                decoding::t_rep_varint32,
                decoding::t_rep_varint32_packed,
                reflection::g_rep_enum,
                packed,
            ),
            Kind::Int64 => repeated_scalar(
                Varint,
                decoding::t_rep_varint64,
                decoding::t_rep_varint64_packed,
                reflection::g_rep_int64,
                packed,
            ),
            Kind::Uint64 => repeated_scalar(
                Varint,
                decoding::t_rep_varint64,
                decoding::t_rep_varint64_packed,
                reflection::g_rep_uint64,
                packed,
            ),
            Kind::Sint32 => repeated_scalar(
                Varint,
                decoding::t_rep_sint32,
                decoding::t_rep_sint32_packed,
                reflection::g_rep_sint32,
                packed,
            ),
            Kind::Sint64 => repeated_scalar(
                Varint,
                decoding::t_rep_sint64,
                decoding::t_rep_sint64_packed,
                reflection::g_rep_sint64,
                packed,
            ),
            Kind::Fixed32 => repeated_scalar(
                Fixed32,
                decoding::t_rep_fixed32,
                decoding::t_rep_fixed32_packed,
                reflection::g_rep_fixed32,
                packed,
            ),
            Kind::Sfixed32 => repeated_scalar(
                Fixed32,
                decoding::t_rep_fixed32,
                decoding::t_rep_fixed32_packed,
                reflection::g_rep_sfixed32,
                packed,
            ),
            Kind::Float => repeated_scalar(
                Fixed32,
                decoding::t_rep_fixed32,
                decoding::t_rep_fixed32_packed,
                reflection::g_rep_float,
                packed,
            ),
            Kind::Fixed64 => repeated_scalar(
                Fixed64,
                decoding::t_rep_fixed64,
                decoding::t_rep_fixed64_packed,
                reflection::g_rep_fixed64,
                packed,
            ),
            Kind::Sfixed64 => repeated_scalar(
                Fixed64,
                decoding::t_rep_fixed64,
                decoding::t_rep_fixed64_packed,
                reflection::g_rep_sfixed64,
                packed,
            ),
            Kind::Double => repeated_scalar(
                Fixed64,
                decoding::t_rep_fixed64,
                decoding::t_rep_fixed64_packed,
                reflection::g_rep_double,
                packed,
            ),
            Kind::String => Archetype {
                size: SLOT_REP.0,
                align: SLOT_REP.1,
                bits: 0,
                getter: reflection::g_rep_string,
                wire: Len,
                thunk: if check_utf8 {
                    decoding::t_rep_string
                } else {
                    decoding::t_rep_bytes
                },
                alt: None,
            },
            Kind::Bytes => Archetype {
                size: SLOT_REP.0,
                align: SLOT_REP.1,
                bits: 0,
                getter: reflection::g_rep_bytes,
                wire: Len,
                thunk: decoding::t_rep_bytes,
                alt: None,
            },
            Kind::Message => Archetype {
                size: SLOT_REP.0,
                align: SLOT_REP.1,
                bits: 0,
                getter: reflection::g_rep_message,
                wire: Len,
                thunk: decoding::t_rep_message,
                alt: None,
            },
        };
    }

    match field.kind {
        Kind::Bool => singular(1, 1, Varint, decoding::t_bool, reflection::g_bool),
        Kind::Int32 => singular(4, 4, Varint, decoding::t_varint32, reflection::g_int32),
        Kind::Uint32 => singular(4, 4, Varint, decoding::t_varint32, reflection::g_uint32),
        Kind::Enum => singular(4, 4, Varint, decoding::t_varint32, reflection::g_enum),
        Kind::Int64 => singular(8, 8, Varint, decoding::t_varint64, reflection::g_int64),
        Kind::Uint64 => singular(8, 8, Varint, decoding::t_varint64, reflection::g_uint64),
        Kind::Sint32 => singular(4, 4, Varint, decoding::t_sint32, reflection::g_int32),
        Kind::Sint64 => singular(8, 8, Varint, decoding::t_sint64, reflection::g_int64),
        Kind::Fixed32 => singular(4, 4, Fixed32, decoding::t_fixed32, reflection::g_uint32),
        Kind::Sfixed32 => singular(4, 4, Fixed32, decoding::t_fixed32, reflection::g_int32),
        Kind::Float => singular(4, 4, Fixed32, decoding::t_fixed32, reflection::g_float),
        Kind::Fixed64 => singular(8, 8, Fixed64, decoding::t_fixed64, reflection::g_uint64),
        Kind::Sfixed64 => singular(8, 8, Fixed64, decoding::t_fixed64, reflection::g_int64),
        Kind::Double => singular(8, 8, Fixed64, decoding::t_fixed64, reflection::g_double),
        Kind::String => singular(
            SLOT_SPAN.0,
            SLOT_SPAN.1,
            Len,
            if check_utf8 {
                decoding::t_string
            } else {
                decoding::t_bytes
            },
            reflection::g_string,
        ),
        Kind::Bytes => singular(SLOT_SPAN.0, SLOT_SPAN.1, Len, decoding::t_bytes, reflection::g_bytes),
        Kind::Message => singular(
            SLOT_PTR.0,
            SLOT_PTR.1,
            Len,
            decoding::t_message,
            reflection::g_message,
        ),
    }
}
