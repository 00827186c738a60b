// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{collections::BTreeMap, sync::Arc};

/// Wire type of a schema field
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldType {
    /// Fixed-width big-endian i32
    Int32,
    /// Fixed-width big-endian i64
    Int64,
    /// Fixed-width big-endian f32
    Float32,
    /// Fixed-width big-endian f64
    Float64,
    /// `varint(len) | bytes`, UTF-8
    String,
    /// `varint(len) | bytes`
    Bytes,
    /// Single byte, 0 or 1
    Bool,
    /// `varint(count) | items`
    Array,
    /// `varint(count) | (string, string)*`
    Map,
    /// `varint(len) | inner fields`
    Nested,
}

/// A dynamically typed field value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// Homogeneous array
    Array(Vec<Value>),
    /// String-to-string map
    Map(BTreeMap<String, String>),
    /// Nested document
    Nested(Document),
}

impl Value {
    /// Returns `true` if the value matches the wire type.
    #[must_use]
    pub fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Self::Int32(_), FieldType::Int32)
                | (Self::Int64(_), FieldType::Int64)
                | (Self::Float32(_), FieldType::Float32)
                | (Self::Float64(_), FieldType::Float64)
                | (Self::String(_), FieldType::String)
                | (Self::Bytes(_), FieldType::Bytes)
                | (Self::Bool(_), FieldType::Bool)
                | (Self::Array(_), FieldType::Array)
                | (Self::Map(_), FieldType::Map)
                | (Self::Nested(_), FieldType::Nested)
        )
    }
}

/// A decoded or to-be-encoded message: field name → value
pub type Document = BTreeMap<String, Value>;

/// One field of a [`Schema`]
#[derive(Clone, Debug)]
pub struct FieldDef {
    /// Wire tag, unique within the schema, never 0
    pub tag: u32,

    /// Field name
    pub name: String,

    /// Wire type
    pub field_type: FieldType,

    /// Decoding fails if a required field is absent and has no default
    pub required: bool,

    /// Filled in by the decoder when the tag is missing
    pub default: Option<Value>,

    /// Element type for arrays
    pub element_type: Option<FieldType>,

    /// Schema of a nested document
    pub nested: Option<Arc<Schema>>,
}

impl FieldDef {
    /// Creates a field definition.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is 0, which is reserved as the terminator.
    #[must_use]
    pub fn new<S: Into<String>>(tag: u32, name: S, field_type: FieldType) -> Self {
        assert!(tag != 0, "tag 0 is reserved");

        Self {
            tag,
            name: name.into(),
            field_type,
            required: false,
            default: None,
            element_type: None,
            nested: None,
        }
    }

    /// Marks the field required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the decoder-side default.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Sets the array element type.
    #[must_use]
    pub fn element_type(mut self, element_type: FieldType) -> Self {
        self.element_type = Some(element_type);
        self
    }

    /// Sets the nested schema.
    #[must_use]
    pub fn nested(mut self, schema: Arc<Schema>) -> Self {
        self.nested = Some(schema);
        self
    }
}

/// A named, versioned message schema
#[derive(Clone, Debug, Default)]
pub struct Schema {
    /// Schema name, carried in every message header
    pub name: String,

    /// Schema version, carried in every message header
    pub version: u16,

    fields: Vec<FieldDef>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new<S: Into<String>>(name: S, version: u16) -> Self {
        Self {
            name: name.into(),
            version,
            fields: Vec::new(),
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Looks a field up by wire tag.
    #[must_use]
    pub fn field_by_tag(&self, tag: u32) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    /// Looks a field up by name.
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Registry of schemas by (name, version)
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: std::collections::HashMap<(String, u16), Arc<Schema>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, returning the shared handle.
    pub fn register(&mut self, schema: Schema) -> Arc<Schema> {
        let key = (schema.name.clone(), schema.version);
        let schema = Arc::new(schema);
        self.schemas.insert(key, schema.clone());
        schema
    }

    /// Looks a schema up by name and version.
    #[must_use]
    pub fn get(&self, name: &str, version: u16) -> Option<Arc<Schema>> {
        self.schemas.get(&(name.to_owned(), version)).cloned()
    }

    /// Returns the highest registered version of a schema name.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas
            .iter()
            .filter(|((n, _), _)| n == name)
            .max_by_key(|((_, v), _)| *v)
            .map(|(_, schema)| schema.clone())
    }

    /// Registered versions of a schema name, ascending.
    #[must_use]
    pub fn versions(&self, name: &str) -> Vec<u16> {
        let mut versions = self
            .schemas
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect::<Vec<_>>();

        versions.sort_unstable();
        versions
    }
}

/// Checks whether `new` can read data written under `old` (and vice versa).
///
/// Flags tag type changes and new required fields without defaults.
/// Returns `(compatible, issues)`.
#[must_use]
pub fn check_compatibility(old: &Schema, new: &Schema) -> (bool, Vec<String>) {
    let mut issues = Vec::new();

    for old_field in old.fields() {
        if let Some(new_field) = new.field_by_tag(old_field.tag) {
            if old_field.field_type != new_field.field_type {
                issues.push(format!(
                    "type change for tag {}: {:?} -> {:?}",
                    old_field.tag, old_field.field_type, new_field.field_type,
                ));
            }
        }
    }

    for new_field in new.fields() {
        if old.field_by_tag(new_field.tag).is_none()
            && new_field.required
            && new_field.default.is_none()
        {
            issues.push(format!(
                "new required field without default: tag {} ({})",
                new_field.tag, new_field.name,
            ));
        }
    }

    (issues.is_empty(), issues)
}
