//! The schema compiler.
//!
//! Lowers a resolved [`Schema`] (plus a [`Profile`] and [`Options`]) into a
//! linked [`Library`]. Per type: select an archetype for every field, pack
//! the message layout (bitset, hot region, profile-driven cold region,
//! shared oneof slots), then emit the `Type` and `TypeParser` images as
//! linker symbols. References between types are relocations, so mutually
//! recursive schemas need no special casing.

use std::collections::HashMap;

use core::mem::offset_of;
use core::ptr::NonNull;

use crate::archetype::{self, Archetype, slot_class};
use crate::arena::Arena;
use crate::base::{COLD_HEADER_SIZE, HEADER_SIZE};
use crate::decoding::Thunk;
use crate::linker::{Linker, RelocKind, align_up};
use crate::profile::{FieldProfile, Profile};
use crate::reflection::Getter;
use crate::schema::{Cardinality, FieldSchema, Kind, ResolvedMessage, Schema, Syntax};
use crate::tables::{
    Field, FieldMeta, FieldParser, Library, MapMeta, Offset, Type, TypeAux, TypeParser,
    build_lookup_slots,
};
use crate::wire::{fold_tag, tag_byte_mask, tag_encoded_len};
use crate::{Error, Options};

/// Fields decoded in fewer than this fraction of parses move to the cold
/// region.
const COLD_THRESHOLD: f32 = 0.1;

static GLOBAL_ALLOC: allocator_api2::alloc::Global = allocator_api2::alloc::Global;

/// Compile `schema` into a linked library.
pub fn compile(schema: &Schema, profile: &Profile, options: &Options) -> Result<Library, Error> {
    let resolved = schema.resolve();
    let index = Schema::index(&resolved);

    let mut linker = Linker::new();
    let mut aux_by_name: HashMap<String, TypeAux> = HashMap::new();

    for rm in &resolved {
        let plan = plan_type(rm, &index, profile, options)?;
        log::debug!(
            "compiled {}: size={} cold_size={} fields={} parsers={}",
            plan.full_name,
            plan.size,
            plan.cold_size,
            plan.fields.len(),
            plan.rows.len()
        );
        aux_by_name.insert(plan.full_name.clone(), plan.aux());
        emit_type(&mut linker, &plan)?;
    }

    let mut arena = Arena::new(&GLOBAL_ALLOC);
    let image = linker.link(&mut arena)?;

    let mut types = HashMap::new();
    let mut aux = HashMap::new();
    for rm in &resolved {
        let offset = image.offsets[&format!("ty:{}", rm.full_name)] as u32;
        types.insert(rm.full_name.clone(), offset);
        let type_aux = aux_by_name
            .remove(&rm.full_name)
            .expect("aux built for every planned type");
        aux.insert(offset, type_aux);
    }

    Ok(Library::from_image(
        arena,
        NonNull::new(image.base).ok_or(Error::AllocError)?,
        image.len,
        types,
        aux,
        options.clone(),
    ))
}

struct FieldPlan<'s> {
    schema: &'s FieldSchema,
    offset: Offset,
    getter: Getter,
    /// Full name of the nested message type, for message-valued fields.
    child: Option<String>,
    map: Option<MapMeta>,
}

struct RowPlan {
    tag: u32,
    thunk: Thunk,
    /// Target of the row's nested-parser relocation.
    child: Option<String>,
    offset: Offset,
    preload: u32,
    next_ok: usize,
    next_err: usize,
}

struct TypePlan<'s> {
    full_name: String,
    size: u32,
    cold_size: u32,
    discard_unknown: bool,
    map_entry: bool,
    oneofs: Vec<String>,
    fields: Vec<FieldPlan<'s>>,
    rows: Vec<RowPlan>,
}

impl TypePlan<'_> {
    fn aux(&self) -> TypeAux {
        TypeAux {
            full_name: self.full_name.clone(),
            fields: self
                .fields
                .iter()
                .enumerate()
                .map(|(i, f)| FieldMeta {
                    name: f.schema.name.clone(),
                    number: f.schema.number,
                    kind: f.schema.kind,
                    cardinality: f.schema.cardinality,
                    oneof_index: f.schema.oneof_index,
                    is_extension: f.schema.is_extension,
                    map: f.map,
                    index: i as u32,
                })
                .collect(),
            oneofs: self.oneofs.clone(),
            map_entry: self.map_entry,
        }
    }
}

fn plan_type<'s>(
    rm: &ResolvedMessage<'s>,
    index: &HashMap<&str, &ResolvedMessage<'_>>,
    profile: &Profile,
    options: &Options,
) -> Result<TypePlan<'s>, Error> {
    let msg = rm.message;
    let syntax = rm.syntax;

    // Pass 1: archetype selection.
    let mut archs: Vec<Archetype> = Vec::with_capacity(msg.fields.len());
    let mut profs: Vec<FieldProfile> = Vec::with_capacity(msg.fields.len());
    let mut children: Vec<Option<String>> = Vec::with_capacity(msg.fields.len());
    let mut maps: Vec<Option<MapMeta>> = Vec::with_capacity(msg.fields.len());

    for field in &msg.fields {
        let mut child = None;
        let mut map_shape = None;
        let mut map_meta = None;
        if field.kind == Kind::Message {
            let entry = index
                .get(field.type_name.as_str())
                .ok_or_else(|| Error::TypeNotFound(field.type_name.clone()))?;
            if entry.message.map_entry && field.is_repeated() {
                let entry_fields = &entry.message.fields;
                if entry_fields.len() != 2
                    || entry_fields[0].number != 1
                    || entry_fields[1].number != 2
                {
                    return Err(Error::MapEntryUnsupported(field.type_name.clone()));
                }
                map_shape = Some((
                    slot_class(entry_fields[0].kind),
                    slot_class(entry_fields[1].kind),
                ));
                map_meta = Some(MapMeta {
                    key: entry_fields[0].kind,
                    value: entry_fields[1].kind,
                });
            }
            child = Some(entry.full_name.clone());
        }

        let prof = if msg.map_entry {
            FieldProfile::unrecorded(false)
        } else {
            profile.for_field(&rm.full_name, field.number, field.is_extension)
        };
        let check_utf8 = field.kind == Kind::String
            && !(prof.assume_utf8 || syntax == Syntax::Proto2 || options.assume_utf8_default);

        archs.push(archetype::select(field, syntax, check_utf8, map_shape));
        profs.push(prof);
        children.push(child);
        maps.push(map_meta);
    }

    // Pass 2: layout packing. Oneof arms share one slot per group and a
    // 32-bit discriminator block in the bitset; cold fields move behind a
    // negative offset. Map entry types stay entirely hot, their slots are
    // read back positionally when entries commit.
    let mut group_extent = vec![(0u32, 1u32); msg.oneofs.len()];
    for (field, arch) in msg.fields.iter().zip(&archs) {
        if let Some(oi) = field.oneof_index {
            let g = &mut group_extent[oi as usize];
            g.0 = g.0.max(arch.size);
            g.1 = g.1.max(arch.align);
        }
    }

    let mut bits = 0u32;
    let mut group_bit = vec![None::<u32>; msg.oneofs.len()];
    let mut offsets = vec![
        Offset {
            bit: 0,
            data: 0,
            number: 0
        };
        msg.fields.len()
    ];
    let mut cold = vec![false; msg.fields.len()];

    for (i, (field, arch)) in msg.fields.iter().zip(&archs).enumerate() {
        if let Some(oi) = field.oneof_index {
            let bit = *group_bit[oi as usize].get_or_insert_with(|| {
                let b = align_up(bits as usize, 32) as u32;
                bits = b + 32;
                b
            });
            offsets[i].bit = bit;
            offsets[i].number = field.number;
        } else if arch.bits > 0 {
            offsets[i].bit = bits;
            bits += arch.bits;
        }
        cold[i] = !msg.map_entry
            && field.oneof_index.is_none()
            && profs[i].decode_probability < COLD_THRESHOLD;
    }

    let bitset_words = bits.div_ceil(32) as usize;
    let mut hot = HEADER_SIZE + bitset_words * 4;
    let mut cold_off = COLD_HEADER_SIZE;
    let mut group_data = vec![None::<i32>; msg.oneofs.len()];

    for (i, (field, arch)) in msg.fields.iter().zip(&archs).enumerate() {
        if let Some(oi) = field.oneof_index {
            let data = *group_data[oi as usize].get_or_insert_with(|| {
                let (size, align) = group_extent[oi as usize];
                hot = align_up(hot, align as usize);
                let off = hot as i32;
                hot += size as usize;
                off
            });
            offsets[i].data = data;
        } else if cold[i] {
            cold_off = align_up(cold_off, arch.align as usize);
            offsets[i].data = !(cold_off as i32);
            cold_off += arch.size as usize;
        } else {
            hot = align_up(hot, arch.align as usize);
            offsets[i].data = hot as i32;
            hot += arch.size as usize;
        }
    }

    let size = align_up(hot, 8) as u32;
    let cold_size = align_up(cold_off, 8) as u32;

    // Pass 3: parser emission. Canonical rows in field-number order, the
    // packed/unpacked duals appended after so they stay reachable through
    // the tag table only.
    let mut order: Vec<usize> = (0..msg.fields.len()).collect();
    order.sort_by_key(|&i| msg.fields[i].number);

    let mut rows: Vec<RowPlan> = Vec::new();
    let n = order.len();
    for (pos, &i) in order.iter().enumerate() {
        let field = &msg.fields[i];
        let arch = &archs[i];
        let repeated = field.cardinality == Cardinality::Repeated;
        // Both successors follow field-number order; only next_ok is
        // overridden to "retry" for repeated fields.
        let successor = (pos + 1) % n;
        let next_ok = if repeated { pos } else { successor };
        rows.push(RowPlan {
            tag: field.number << 3 | arch.wire as u32,
            thunk: arch.thunk,
            child: children[i].clone(),
            offset: offsets[i],
            preload: profs[i].expected_count,
            next_ok,
            next_err: successor,
        });
    }
    for (pos, &i) in order.iter().enumerate() {
        let field = &msg.fields[i];
        if let Some((alt_wire, alt_thunk)) = archs[i].alt {
            let idx = rows.len();
            rows.push(RowPlan {
                tag: field.number << 3 | alt_wire as u32,
                thunk: alt_thunk,
                child: children[i].clone(),
                offset: offsets[i],
                preload: profs[i].expected_count,
                next_ok: idx,
                next_err: (pos + 1) % n,
            });
        }
    }

    let fields = msg
        .fields
        .iter()
        .enumerate()
        .map(|(i, schema)| FieldPlan {
            schema,
            offset: offsets[i],
            getter: archs[i].getter,
            child: children[i].clone(),
            map: maps[i],
        })
        .collect();

    Ok(TypePlan {
        full_name: rm.full_name.clone(),
        size,
        cold_size,
        discard_unknown: options.discard_unknown,
        map_entry: msg.map_entry,
        oneofs: msg.oneofs.clone(),
        fields,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Emission. Each component is its own symbol; consecutive insertion plus
// size/alignment discipline keeps the adjacency the table accessors rely on.

fn put_u32(data: &mut Vec<u8>, v: u32) {
    data.extend_from_slice(&v.to_ne_bytes());
}

fn put_i32(data: &mut Vec<u8>, v: i32) {
    data.extend_from_slice(&v.to_ne_bytes());
}

fn put_u64(data: &mut Vec<u8>, v: u64) {
    data.extend_from_slice(&v.to_ne_bytes());
}

fn put_ptr(data: &mut Vec<u8>, v: usize) {
    data.extend_from_slice(&v.to_ne_bytes());
}

fn put_offset(data: &mut Vec<u8>, offset: Offset) {
    put_u32(data, offset.bit);
    put_i32(data, offset.data);
    put_u32(data, offset.number);
}

fn emit_type(linker: &mut Linker, plan: &TypePlan<'_>) -> Result<(), Error> {
    let ty_name = format!("ty:{}", plan.full_name);
    let tp_name = format!("tp:{}", plan.full_name);
    let fields_name = format!("{ty_name}.fields");
    let numbers_name = format!("{ty_name}.numbers");
    let tags_name = format!("{tp_name}.tags");
    let parsers_name = format!("{tp_name}.parsers");

    let number_pairs: Vec<(u64, u32)> = plan
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.schema.number as u64, i as u32))
        .collect();
    let number_slots = build_lookup_slots(&number_pairs);

    let tag_pairs: Vec<(u64, u32)> = plan
        .rows
        .iter()
        .enumerate()
        .map(|(i, r)| (fold_tag(r.tag), i as u32))
        .collect();
    let tag_slots = build_lookup_slots(&tag_pairs);

    // Type record.
    let ty = linker.new_symbol(&ty_name, 8)?;
    {
        let data = linker.data_mut(&ty);
        put_u32(data, plan.size);
        put_u32(data, plan.cold_size);
        put_ptr(data, 0); // parser, relocated
        put_u32(data, plan.fields.len() as u32);
        put_u32(data, number_slots.len() as u32 - 1);
        debug_assert_eq!(data.len(), core::mem::size_of::<Type>());
    }
    linker.reloc(&ty, offset_of!(Type, parser), RelocKind::Address, &tp_name, 0);

    // Field table, one zeroed padding entry at the end.
    let fields = linker.new_symbol(&fields_name, 8)?;
    for (i, field) in plan.fields.iter().enumerate() {
        let base = i * core::mem::size_of::<Field>();
        let data = linker.data_mut(&fields);
        put_ptr(data, 0); // message, maybe relocated
        put_ptr(data, field.getter as usize);
        put_offset(data, field.offset);
        put_u32(data, 0); // struct padding
        if let Some(child) = &field.child {
            linker.reloc(
                &fields,
                base + offset_of!(Field, message),
                RelocKind::Address,
                &format!("ty:{child}"),
                0,
            );
        }
    }
    {
        let data = linker.data_mut(&fields);
        data.resize(data.len() + core::mem::size_of::<Field>(), 0);
        debug_assert_eq!(
            data.len(),
            (plan.fields.len() + 1) * core::mem::size_of::<Field>()
        );
    }

    // Field-number lookup table.
    let numbers = linker.new_symbol(&numbers_name, 8)?;
    {
        let data = linker.data_mut(&numbers);
        for &(key, idx) in &number_slots {
            put_u32(data, key as u32);
            put_u32(data, idx);
        }
    }

    // TypeParser record.
    let tp = linker.new_symbol(&tp_name, 8)?;
    {
        let data = linker.data_mut(&tp);
        put_ptr(data, 0); // entrypoint, relocated below when rows exist
        put_ptr(data, 0); // map_entry
        put_u32(data, 0); // type_offset, relocated
        put_u32(data, tag_slots.len() as u32 - 1);
        put_u32(data, plan.rows.len() as u32);
        put_u32(data, plan.discard_unknown as u32);
        debug_assert_eq!(data.len(), core::mem::size_of::<TypeParser>());
    }
    if !plan.rows.is_empty() {
        linker.reloc(
            &tp,
            offset_of!(TypeParser, entrypoint),
            RelocKind::Address,
            &parsers_name,
            0,
        );
        if plan.map_entry {
            linker.reloc(
                &tp,
                offset_of!(TypeParser, map_entry),
                RelocKind::Address,
                &parsers_name,
                0,
            );
        }
    }
    linker.reloc(
        &tp,
        offset_of!(TypeParser, type_offset),
        RelocKind::Abs32,
        &ty_name,
        0,
    );

    // Tag lookup table.
    let tags = linker.new_symbol(&tags_name, 8)?;
    {
        let data = linker.data_mut(&tags);
        for &(key, idx) in &tag_slots {
            put_u64(data, key);
            put_u32(data, idx);
            put_u32(data, 0);
        }
    }

    // Parser program.
    let parsers = linker.new_symbol(&parsers_name, 8)?;
    let row_size = core::mem::size_of::<FieldParser>();
    for (i, row) in plan.rows.iter().enumerate() {
        let base = i * row_size;
        let tag_len = tag_encoded_len(row.tag);
        let data = linker.data_mut(&parsers);
        put_u64(data, fold_tag(row.tag));
        put_u64(data, tag_byte_mask(tag_len));
        put_ptr(data, 0); // message, maybe relocated
        put_ptr(data, 0); // next_ok, relocated
        put_ptr(data, 0); // next_err, relocated
        put_ptr(data, row.thunk as usize);
        put_offset(data, row.offset);
        put_u32(data, row.preload);
        debug_assert_eq!(linker.len(&parsers), base + row_size);

        if let Some(child) = &row.child {
            linker.reloc(
                &parsers,
                base + offset_of!(FieldParser, message),
                RelocKind::Address,
                &format!("tp:{child}"),
                0,
            );
        }
        linker.reloc(
            &parsers,
            base + offset_of!(FieldParser, next_ok),
            RelocKind::Address,
            &parsers_name,
            row.next_ok * row_size,
        );
        linker.reloc(
            &parsers,
            base + offset_of!(FieldParser, next_err),
            RelocKind::Address,
            &parsers_name,
            row.next_err * row_size,
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FileSchema, MessageSchema};

    fn options() -> Options {
        Options::default()
    }

    fn demo_schema() -> Schema {
        Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("M")
                    .field(FieldSchema::new("a", 1, Kind::Int32, Cardinality::Singular))
                    .field(FieldSchema::new("b", 2, Kind::String, Cardinality::Singular))
                    .field(FieldSchema::new(
                        "c",
                        3,
                        Kind::Uint64,
                        Cardinality::Repeated,
                    )),
            ),
        )
    }

    #[test]
    fn layout_invariants() {
        let lib = compile(&demo_schema(), &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.M").unwrap();
        assert_eq!(ty.size % 8, 0);
        assert_eq!(ty.count, 3);
        for field in &ty.fields()[..3] {
            let data = field.offset.data;
            assert!(
                (data >= 0 && (data as u32) < ty.size) || (!data as u32) < ty.cold_size,
                "offset {data} outside hot and cold regions"
            );
        }
        // Padding entry is inert.
        let pad = &ty.fields()[3];
        assert!(pad.getter.is_none());
        assert!(pad.message.is_null());
    }

    #[test]
    fn numbers_table_finds_every_field() {
        let lib = compile(&demo_schema(), &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.M").unwrap();
        for number in 1..=3 {
            let field = ty.by_number(number).expect("field present");
            assert!(field.getter.is_some());
        }
        assert!(ty.by_number(4).is_none());
        assert!(ty.by_number(0).is_none());
    }

    #[test]
    fn parser_chain_follows_number_order() {
        let lib = compile(&demo_schema(), &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.M").unwrap();
        let tp = ty.parser();
        let parsers = tp.parsers();
        // 3 canonical rows + 1 packed/unpacked dual for the repeated uint64.
        assert_eq!(parsers.len(), 4);
        assert_eq!(tp.entrypoint, &parsers[0] as *const FieldParser);
        // Singular rows chain forward.
        assert_eq!(parsers[0].next_ok, &parsers[1] as *const FieldParser);
        assert_eq!(parsers[1].next_ok, &parsers[2] as *const FieldParser);
        // The repeated row retries itself.
        assert_eq!(parsers[2].next_ok, &parsers[2] as *const FieldParser);
        // next_err resyncs every row (the repeated one included) to the
        // next field in number order, wrapping at the end.
        assert_eq!(parsers[0].next_err, &parsers[1] as *const FieldParser);
        assert_eq!(parsers[1].next_err, &parsers[2] as *const FieldParser);
        assert_eq!(parsers[2].next_err, &parsers[0] as *const FieldParser);
        assert_eq!(parsers[3].next_err, &parsers[0] as *const FieldParser);
    }

    #[test]
    fn tags_table_reaches_both_wire_forms() {
        let lib = compile(&demo_schema(), &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.M").unwrap();
        let tp = ty.parser();
        // Packed (canonical in proto3) and unpacked forms of field 3.
        assert!(tp.find_tag(fold_tag(3 << 3 | 2)).is_some());
        assert!(tp.find_tag(fold_tag(3 << 3 | 0)).is_some());
        // Unknown tag misses.
        assert!(tp.find_tag(fold_tag(9 << 3)).is_none());
    }

    #[test]
    fn cyclic_schema_links() {
        let schema = Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("Node")
                    .field(FieldSchema::new("v", 1, Kind::Int32, Cardinality::Singular))
                    .field(FieldSchema::message(
                        "next",
                        2,
                        Cardinality::Singular,
                        "demo.Node",
                    )),
            ),
        );
        let lib = compile(&schema, &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.Node").unwrap();
        // The self-reference resolved to the type's own record.
        let next = ty.by_number(2).unwrap();
        assert_eq!(next.message, ty as *const Type);
        assert!(lib.image_contains(next.message as *const u8));
    }

    #[test]
    fn oneof_arms_share_slot_and_block() {
        let schema = Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("O")
                    .oneof("choice")
                    .field(FieldSchema::new("a", 1, Kind::Uint64, Cardinality::Singular).in_oneof(0))
                    .field(
                        FieldSchema::new("b", 2, Kind::String, Cardinality::Singular).in_oneof(0),
                    ),
            ),
        );
        let lib = compile(&schema, &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.O").unwrap();
        let a = ty.by_number(1).unwrap();
        let b = ty.by_number(2).unwrap();
        assert_eq!(a.offset.data, b.offset.data);
        assert_eq!(a.offset.bit, b.offset.bit);
        assert_eq!(a.offset.bit % 32, 0);
        assert_eq!(a.offset.number, 1);
        assert_eq!(b.offset.number, 2);
    }

    #[test]
    fn profile_moves_rare_field_cold() {
        let schema = Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("M")
                    .field(FieldSchema::new("hot", 1, Kind::Int32, Cardinality::Singular))
                    .field(FieldSchema::new(
                        "cold_fld",
                        2,
                        Kind::Int32,
                        Cardinality::Singular,
                    )),
            ),
        );
        // Without profile data both fields stay hot.
        let lib = compile(&schema, &Profile::new(), &options()).unwrap();
        let ty = lib.type_by_name("demo.M").unwrap();
        assert!(ty.by_number(2).unwrap().offset.data >= 0);

        // Simulate 100 parses where `cold_fld` shows up once.
        let profile = Profile::new();
        let bytes_with_both: &[u8] = &[0x08, 0x01, 0x10, 0x02];
        let bytes_hot_only: &[u8] = &[0x08, 0x01];
        let arena_alloc = allocator_api2::alloc::Global;
        for i in 0..100 {
            let mut arena = Arena::new(&arena_alloc);
            let bytes = if i == 0 { bytes_with_both } else { bytes_hot_only };
            let msg = lib.parse("demo.M", bytes, &mut arena).unwrap();
            profile.record(&msg);
        }

        let relinked = compile(&schema, &profile, &options()).unwrap();
        let ty = relinked.type_by_name("demo.M").unwrap();
        assert!(ty.by_number(1).unwrap().offset.data >= 0);
        assert!(ty.by_number(2).unwrap().offset.data < 0, "cold_fld not cold");
    }
}
