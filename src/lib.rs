//! protolith: a table-driven protobuf parsing runtime.
//!
//! A resolved schema is compiled, together with an optional decode
//! [`Profile`], into a [`Library`]: one contiguous, immutable blob of type
//! records and parser programs laid out for cache locality. A thunk-threaded
//! VM executes those programs against wire bytes, producing arena-allocated
//! [`DynamicMessage`] trees whose string, bytes, and packed scalar values
//! alias the input buffer instead of copying it.
//!
//! ```
//! use protolith::{
//!     Arena, Cardinality, FieldSchema, FileSchema, Kind, MessageSchema, Options, Profile,
//!     Schema, Syntax, Value, compile,
//! };
//! use allocator_api2::alloc::Global;
//!
//! let schema = Schema::new().file(
//!     FileSchema::new("demo", Syntax::Proto3).message(
//!         MessageSchema::new("Ping")
//!             .field(FieldSchema::new("seq", 1, Kind::Uint64, Cardinality::Singular)),
//!     ),
//! );
//! let library = compile(&schema, &Profile::new(), &Options::default()).unwrap();
//!
//! let mut arena = Arena::new(&Global);
//! let msg = library.parse("demo.Ping", &[0x08, 0x2A], &mut arena).unwrap();
//! assert!(matches!(msg.get("seq"), Some(Value::UInt64(42))));
//! ```
//!
//! The crate is parse-only: no message construction, no emission, no JSON.
//! Callers keep the input buffer alive as long as any message parsed from it
//! is reachable; the borrow on [`Library::parse`]'s source slice enforces
//! this.

pub mod arena;
mod archetype;
pub mod base;
pub mod compiler;
pub mod containers;
pub mod decoding;
pub mod linker;
pub mod profile;
pub mod reflection;
pub mod schema;
pub mod tables;
pub mod utils;
pub mod wire;
pub mod zc;

pub use arena::Arena;
pub use compiler::compile;
pub use profile::{FieldProfile, Profile};
pub use reflection::{DynamicMessage, ListRef, MapKey, MapRef, Value};
pub use schema::{Cardinality, FieldSchema, FileSchema, Kind, MessageSchema, Schema, Syntax};
pub use tables::Library;
pub use zc::Zc;

/// Everything that can go wrong while compiling a schema or parsing a
/// message. Parse errors are fatal to the parse; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input truncated")]
    Truncated,
    #[error("malformed varint")]
    MalformedVarint,
    #[error("field number exceeds 32 bits")]
    TagOverflow,
    #[error("invalid tag")]
    InvalidTag,
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("unknown wire type {0}")]
    UnknownWireType(u8),
    #[error("group wire format is not supported")]
    GroupUnsupported,
    #[error("message nesting exceeds the recursion limit")]
    RecursionLimit,
    #[error("message type `{0}` not found in library")]
    TypeNotFound(String),
    #[error("map entry type `{0}` is malformed")]
    MapEntryUnsupported(String),
    #[error("duplicate symbol `{0}`")]
    DuplicateSymbol(String),
    #[error("undefined symbol `{0}`")]
    UndefinedSymbol(String),
    #[error("type has too many dependencies")]
    TooManyDependencies,
    #[error("arena allocation failed")]
    AllocError,
}

/// Compilation and parse configuration.
#[derive(Clone, Debug)]
pub struct Options {
    /// Drop unknown fields instead of retaining their raw bytes.
    pub discard_unknown: bool,
    /// Skip UTF-8 validation on every string field, regardless of profile.
    pub assume_utf8_default: bool,
    /// First chunk size for arenas the caller sizes off this library.
    pub arena_chunk_size: usize,
    /// Maximum message nesting depth.
    pub recursion_limit: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            discard_unknown: false,
            assume_utf8_default: false,
            arena_chunk_size: arena::DEFAULT_BLOCK_SIZE,
            recursion_limit: 100,
        }
    }
}

impl Options {
    pub fn discard_unknown(mut self, discard: bool) -> Self {
        self.discard_unknown = discard;
        self
    }

    pub fn assume_utf8_default(mut self, assume: bool) -> Self {
        self.assume_utf8_default = assume;
        self
    }

    pub fn arena_chunk_size(mut self, size: usize) -> Self {
        self.arena_chunk_size = size;
        self
    }

    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn parse_two_scalars() {
        let schema = Schema::new().file(
            FileSchema::new("t", Syntax::Proto3).message(
                MessageSchema::new("Pair")
                    .field(FieldSchema::new("x", 1, Kind::Uint64, Cardinality::Singular))
                    .field(FieldSchema::new("y", 2, Kind::Fixed64, Cardinality::Singular)),
            ),
        );
        let library = compile(&schema, &Profile::new(), &Options::default()).unwrap();

        // x = 1 (varint), y = 2 (fixed64).
        let buf = [0o10, 1, 0o21, 2, 0, 0, 0, 0, 0, 0, 0];
        let mut arena = Arena::new(&Global);
        let msg = library.parse("t.Pair", &buf, &mut arena).unwrap();

        assert!(matches!(msg.get("x"), Some(Value::UInt64(1))));
        assert!(matches!(msg.get("y"), Some(Value::UInt64(2))));
        assert!(msg.get("missing").is_none());
    }

    #[test]
    fn library_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Library>();
    }
}
