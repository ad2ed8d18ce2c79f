use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use allocator_api2::alloc::Global;
use protolith::{
    Arena, Cardinality, FieldSchema, FileSchema, Kind, Library, MessageSchema, Options, Profile,
    Schema, Syntax, compile,
};

fn bench_schema() -> Schema {
    Schema::new().file(
        FileSchema::new("bench", Syntax::Proto3)
            .message(
                MessageSchema::new("Envelope")
                    .field(FieldSchema::new("id", 1, Kind::Uint64, Cardinality::Singular))
                    .field(FieldSchema::new(
                        "payload",
                        2,
                        Kind::Bytes,
                        Cardinality::Singular,
                    ))
                    .field(FieldSchema::message(
                        "items",
                        3,
                        Cardinality::Repeated,
                        "bench.Item",
                    ))
                    .field(FieldSchema::new(
                        "samples",
                        4,
                        Kind::Fixed64,
                        Cardinality::Repeated,
                    )),
            )
            .message(
                MessageSchema::new("Item")
                    .field(FieldSchema::new("key", 1, Kind::String, Cardinality::Singular))
                    .field(FieldSchema::new(
                        "value",
                        2,
                        Kind::Int64,
                        Cardinality::Singular,
                    )),
            ),
    )
}

fn varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push(v as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn len_field(out: &mut Vec<u8>, number: u32, bytes: &[u8]) {
    varint(out, ((number << 3) | 2) as u64);
    varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn medium_message() -> Vec<u8> {
    let mut buf = Vec::new();
    varint(&mut buf, 1 << 3);
    varint(&mut buf, 0xDEAD_BEEF);
    len_field(&mut buf, 2, b"Hello World! This is a test payload with some content.");
    for i in 0..16u64 {
        let mut item = Vec::new();
        len_field(&mut item, 1, format!("key-{i}").as_bytes());
        varint(&mut item, 2 << 3);
        varint(&mut item, i * 1000);
        len_field(&mut buf, 3, &item);
    }
    buf
}

fn repeated_heavy_message() -> Vec<u8> {
    let mut buf = Vec::new();
    let payload: Vec<u8> = (0..2048u64).flat_map(|v| v.to_le_bytes()).collect();
    len_field(&mut buf, 4, &payload);
    buf
}

fn bench_parse(c: &mut Criterion, lib: &Library, name: &str, data: &[u8]) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function(name, |b| {
        b.iter(|| {
            let mut arena = Arena::new(&Global);
            let msg = lib
                .parse("bench.Envelope", black_box(data), &mut arena)
                .unwrap();
            black_box(msg.has("id"));
        })
    });
    group.finish();
}

fn benches(c: &mut Criterion) {
    let lib = compile(&bench_schema(), &Profile::new(), &Options::default()).unwrap();
    let medium = medium_message();
    let heavy = repeated_heavy_message();
    bench_parse(c, &lib, "medium", &medium);
    bench_parse(c, &lib, "packed_fixed64", &heavy);
}

criterion_group!(benches_group, benches);
criterion_main!(benches_group);
