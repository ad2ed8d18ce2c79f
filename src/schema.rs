//! The resolved schema tree consumed by the compiler.
//!
//! protolith does not parse `.proto` text. Callers hand it a [`Schema`]: an
//! owned descriptor tree (files holding messages holding fields) with types
//! already resolved to full names. The builder methods exist so schemas can
//! be assembled programmatically, e.g. from a decoded
//! `FileDescriptorSet` or by hand in tests.

use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Syntax {
    Proto2,
    Proto3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinality {
    Singular,
    Optional,
    Repeated,
}

/// Declared field types. Enums decode as open `int32`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    Enum,
    String,
    Bytes,
    Message,
}

impl Kind {
    pub fn is_message(self) -> bool {
        self == Kind::Message
    }

    /// The wire type of one element of this kind, ignoring packing.
    pub(crate) fn element_wire_type(self) -> crate::wire::WireType {
        use crate::wire::WireType::*;
        match self {
            Kind::Bool
            | Kind::Int32
            | Kind::Int64
            | Kind::Uint32
            | Kind::Uint64
            | Kind::Sint32
            | Kind::Sint64
            | Kind::Enum => Varint,
            Kind::Fixed32 | Kind::Sfixed32 | Kind::Float => Fixed32,
            Kind::Fixed64 | Kind::Sfixed64 | Kind::Double => Fixed64,
            Kind::String | Kind::Bytes | Kind::Message => Len,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldSchema {
    pub name: String,
    pub number: u32,
    pub kind: Kind,
    pub cardinality: Cardinality,
    /// Full name of the message type, for `Kind::Message` fields.
    pub type_name: String,
    /// Index into the containing message's `oneofs`, for oneof arms.
    pub oneof_index: Option<u16>,
    /// Explicit `[packed = ...]` option; `None` means the syntax default.
    pub packed: Option<bool>,
    pub is_extension: bool,
}

impl FieldSchema {
    pub fn new(name: &str, number: u32, kind: Kind, cardinality: Cardinality) -> Self {
        FieldSchema {
            name: name.to_string(),
            number,
            kind,
            cardinality,
            type_name: String::new(),
            oneof_index: None,
            packed: None,
            is_extension: false,
        }
    }

    pub fn message(name: &str, number: u32, cardinality: Cardinality, type_name: &str) -> Self {
        let mut f = Self::new(name, number, Kind::Message, cardinality);
        f.type_name = type_name.to_string();
        f
    }

    pub fn in_oneof(mut self, index: u16) -> Self {
        self.oneof_index = Some(index);
        self
    }

    pub fn packed(mut self, packed: bool) -> Self {
        self.packed = Some(packed);
        self
    }

    pub fn extension(mut self) -> Self {
        self.is_extension = true;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.cardinality == Cardinality::Repeated
    }

    /// Whether repeated elements are packed on the wire by default.
    pub(crate) fn packed_by_default(&self, syntax: Syntax) -> bool {
        if !self.is_repeated() || self.kind.element_wire_type() == crate::wire::WireType::Len {
            return false;
        }
        self.packed.unwrap_or(syntax == Syntax::Proto3)
    }
}

#[derive(Clone, Debug)]
pub struct MessageSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub oneofs: Vec<String>,
    pub nested: Vec<MessageSchema>,
    /// Set for synthesized map entry types (key = 1, value = 2).
    pub map_entry: bool,
}

impl MessageSchema {
    pub fn new(name: &str) -> Self {
        MessageSchema {
            name: name.to_string(),
            fields: Vec::new(),
            oneofs: Vec::new(),
            nested: Vec::new(),
            map_entry: false,
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn oneof(mut self, name: &str) -> Self {
        self.oneofs.push(name.to_string());
        self
    }

    pub fn nested(mut self, message: MessageSchema) -> Self {
        self.nested.push(message);
        self
    }

    pub fn map_entry(mut self) -> Self {
        self.map_entry = true;
        self
    }

    /// Declare a map field: synthesizes the nested entry type and the
    /// repeated message field pointing at it, the way descriptors encode
    /// maps.
    pub fn map_field(
        mut self,
        name: &str,
        number: u32,
        key: Kind,
        value: Kind,
        value_type_name: &str,
        parent_full_name: &str,
    ) -> Self {
        let entry_name = map_entry_name(name);
        let mut value_field = FieldSchema::new("value", 2, value, Cardinality::Optional);
        if value == Kind::Message {
            value_field.type_name = value_type_name.to_string();
        }
        let entry = MessageSchema::new(&entry_name)
            .field(FieldSchema::new("key", 1, key, Cardinality::Optional))
            .field(value_field)
            .map_entry();
        self.nested.push(entry);
        let entry_full = format!("{}.{}", parent_full_name, entry_name);
        self.fields.push(FieldSchema::message(
            name,
            number,
            Cardinality::Repeated,
            &entry_full,
        ));
        self
    }
}

fn map_entry_name(field_name: &str) -> String {
    // "weather_stations" -> "WeatherStationsEntry", matching descriptor
    // synthesis rules.
    let mut out = String::new();
    let mut upper = true;
    for ch in field_name.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out.push_str("Entry");
    out
}

#[derive(Clone, Debug)]
pub struct FileSchema {
    pub package: String,
    pub syntax: Syntax,
    pub messages: Vec<MessageSchema>,
}

impl FileSchema {
    pub fn new(package: &str, syntax: Syntax) -> Self {
        FileSchema {
            package: package.to_string(),
            syntax,
            messages: Vec::new(),
        }
    }

    pub fn message(mut self, message: MessageSchema) -> Self {
        self.messages.push(message);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub files: Vec<FileSchema>,
}

/// One message flattened out of the schema tree, with its resolved full name.
pub(crate) struct ResolvedMessage<'a> {
    pub full_name: String,
    pub message: &'a MessageSchema,
    pub syntax: Syntax,
}

impl Schema {
    pub fn new() -> Self {
        Schema { files: Vec::new() }
    }

    pub fn file(mut self, file: FileSchema) -> Self {
        self.files.push(file);
        self
    }

    /// Flatten all messages (including nested ones) with full names, in a
    /// stable order.
    pub(crate) fn resolve(&self) -> Vec<ResolvedMessage<'_>> {
        let mut out = Vec::new();
        for file in &self.files {
            for message in &file.messages {
                let full = if file.package.is_empty() {
                    message.name.clone()
                } else {
                    format!("{}.{}", file.package, message.name)
                };
                flatten(message, &full, file.syntax, &mut out);
            }
        }
        out
    }

    pub(crate) fn index<'a>(
        resolved: &'a [ResolvedMessage<'a>],
    ) -> HashMap<&'a str, &'a ResolvedMessage<'a>> {
        resolved.iter().map(|m| (m.full_name.as_str(), m)).collect()
    }
}

fn flatten<'a>(
    message: &'a MessageSchema,
    full_name: &str,
    syntax: Syntax,
    out: &mut Vec<ResolvedMessage<'a>>,
) {
    out.push(ResolvedMessage {
        full_name: full_name.to_string(),
        message,
        syntax,
    });
    for nested in &message.nested {
        let nested_full = format!("{}.{}", full_name, nested.name);
        flatten(nested, &nested_full, syntax, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_flattens_nested_names() {
        let schema = Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("Outer")
                    .field(FieldSchema::new("x", 1, Kind::Int32, Cardinality::Singular))
                    .nested(MessageSchema::new("Inner")),
            ),
        );
        let resolved = schema.resolve();
        let names: Vec<&str> = resolved.iter().map(|m| m.full_name.as_str()).collect();
        assert_eq!(names, ["demo.Outer", "demo.Outer.Inner"]);
    }

    #[test]
    fn map_field_synthesizes_entry() {
        let schema = Schema::new().file(
            FileSchema::new("demo", Syntax::Proto3).message(
                MessageSchema::new("M").map_field("counts", 3, Kind::String, Kind::Uint64, "", "demo.M"),
            ),
        );
        let resolved = schema.resolve();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].full_name, "demo.M.CountsEntry");
        assert!(resolved[1].message.map_entry);
        let field = &resolved[0].message.fields[0];
        assert_eq!(field.type_name, "demo.M.CountsEntry");
        assert_eq!(field.cardinality, Cardinality::Repeated);
    }

    #[test]
    fn packed_defaults_follow_syntax() {
        let f = FieldSchema::new("v", 1, Kind::Int32, Cardinality::Repeated);
        assert!(f.packed_by_default(Syntax::Proto3));
        assert!(!f.packed_by_default(Syntax::Proto2));
        let s = FieldSchema::new("s", 2, Kind::String, Cardinality::Repeated);
        assert!(!s.packed_by_default(Syntax::Proto3));
    }
}
