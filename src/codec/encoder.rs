// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    schema::{Document, FieldDef, FieldType, Schema, Value},
    MAGIC,
};
use crate::Error;
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;
use varint_rs::VarintWriter;

/// Encodes documents under a fixed schema
pub struct Encoder<'a> {
    schema: &'a Schema,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder for the schema.
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Encodes a document into the versioned wire format.
    ///
    /// Layout: `MAGIC | version:u16 | name_len:u16 | name | fields | varint(0)`
    /// where each field is `varint(tag) | payload`.
    pub fn encode(&self, doc: &Document) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();

        out.write_all(&MAGIC)?;
        out.write_u16::<BigEndian>(self.schema.version)?;

        let name = self.schema.name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| Error::InvalidSchema("schema name too long".into()))?;

        out.write_u16::<BigEndian>(name_len)?;
        out.write_all(name)?;

        self.encode_fields(doc, &mut out)?;

        Ok(out)
    }

    fn encode_fields(&self, doc: &Document, out: &mut Vec<u8>) -> crate::Result<()> {
        for field in self.schema.fields() {
            let Some(value) = doc.get(&field.name) else {
                if field.required {
                    return Err(Error::InvalidSchema(format!(
                        "missing required field: {}",
                        field.name,
                    )));
                }
                continue;
            };

            if !value.matches(field.field_type) {
                return Err(Error::InvalidSchema(format!(
                    "field {} expects {:?}",
                    field.name, field.field_type,
                )));
            }

            out.write_u32_varint(field.tag)?;
            Self::encode_value(value, field, out)?;
        }

        // Terminator
        out.write_u32_varint(0)?;

        Ok(())
    }

    fn encode_value(value: &Value, field: &FieldDef, out: &mut Vec<u8>) -> crate::Result<()> {
        match value {
            Value::Int32(v) => out.write_i32::<BigEndian>(*v)?,
            Value::Int64(v) => out.write_i64::<BigEndian>(*v)?,
            Value::Float32(v) => out.write_f32::<BigEndian>(*v)?,
            Value::Float64(v) => out.write_f64::<BigEndian>(*v)?,
            Value::Bool(v) => out.write_u8(u8::from(*v))?,
            Value::String(v) => Self::encode_bytes(v.as_bytes(), out)?,
            Value::Bytes(v) => Self::encode_bytes(v, out)?,
            Value::Array(items) => {
                let element_type = field.element_type.unwrap_or(FieldType::String);

                let element_field =
                    FieldDef::new(field.tag, field.name.clone(), element_type);

                out.write_u32_varint(u32::try_from(items.len()).map_err(|_| {
                    Error::InvalidSchema("array too long".into())
                })?)?;

                for item in items {
                    if !item.matches(element_type) {
                        return Err(Error::InvalidSchema(format!(
                            "array {} expects {element_type:?} elements",
                            field.name,
                        )));
                    }
                    Self::encode_value(item, &element_field, out)?;
                }
            }
            Value::Map(map) => {
                out.write_u32_varint(u32::try_from(map.len()).map_err(|_| {
                    Error::InvalidSchema("map too long".into())
                })?)?;

                for (k, v) in map {
                    Self::encode_bytes(k.as_bytes(), out)?;
                    Self::encode_bytes(v.as_bytes(), out)?;
                }
            }
            Value::Nested(doc) => {
                let Some(nested_schema) = &field.nested else {
                    return Err(Error::InvalidSchema(format!(
                        "field {} has no nested schema",
                        field.name,
                    )));
                };

                let mut inner = Vec::new();
                Encoder::new(nested_schema).encode_fields(doc, &mut inner)?;

                Self::encode_bytes(&inner, out)?;
            }
        }

        Ok(())
    }

    fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) -> crate::Result<()> {
        out.write_u32_varint(
            u32::try_from(bytes.len())
                .map_err(|_| Error::InvalidSchema("value too long".into()))?,
        )?;
        out.write_all(bytes)?;
        Ok(())
    }
}

/// One-shot convenience wrapper around [`Encoder`].
pub fn encode(schema: &Schema, doc: &Document) -> crate::Result<Vec<u8>> {
    Encoder::new(schema).encode(doc)
}
