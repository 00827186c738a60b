// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    schema::{Document, FieldDef, FieldType, Schema, SchemaRegistry, Value},
    MAGIC,
};
use crate::{coding::DecodeError, Error};
use byteorder::{BigEndian, ReadBytesExt};
use std::{
    collections::BTreeMap,
    io::{Cursor, Read},
};
use varint_rs::VarintReader;

/// Decodes versioned messages, reconciling writer and reader schemas
///
/// Forward compatibility: unknown tags are skipped, by the writer
/// (source) schema's type if the registry knows it, else by the
/// length-prefix convention. Backward compatibility: missing tags resolve
/// to the reader field's declared default, or fail if the field is
/// required.
#[derive(Default)]
pub struct Decoder<'a> {
    registry: Option<&'a SchemaRegistry>,
    target: Option<&'a Schema>,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder that resolves writer schemas from a registry.
    #[must_use]
    pub fn with_registry(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry: Some(registry),
            target: None,
        }
    }

    /// Forces decoding under a specific reader schema.
    #[must_use]
    pub fn with_target(mut self, schema: &'a Schema) -> Self {
        self.target = Some(schema);
        self
    }

    /// Decodes a message.
    pub fn decode(&self, data: &[u8]) -> crate::Result<Document> {
        let mut cursor = Cursor::new(data);

        let mut magic = [0u8; MAGIC.len()];
        cursor.read_exact(&mut magic)?;

        if magic != MAGIC {
            return Err(DecodeError::InvalidHeader("venc").into());
        }

        let version = cursor.read_u16::<BigEndian>()?;
        let name_len = cursor.read_u16::<BigEndian>()?;

        let mut name = vec![0; name_len as usize];
        cursor.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(DecodeError::from)?;

        let source = self
            .registry
            .and_then(|registry| registry.get(&name, version));

        let schema: &Schema = match (self.target, &source) {
            (Some(target), _) => target,
            (None, Some(source)) => source,
            (None, None) => {
                return Err(Error::InvalidSchema(format!(
                    "unknown schema: {name} v{version}"
                )));
            }
        };

        Self::decode_fields(&mut cursor, schema, source.as_deref())
    }

    fn decode_fields(
        cursor: &mut Cursor<&[u8]>,
        schema: &Schema,
        source: Option<&Schema>,
    ) -> crate::Result<Document> {
        let mut doc = Document::new();
        let mut seen = Vec::new();

        loop {
            // A clean end of input counts as termination
            let tag = match cursor.read_u32_varint() {
                Ok(tag) => tag,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            if tag == 0 {
                break;
            }

            seen.push(tag);

            let Some(field) = schema.field_by_tag(tag) else {
                Self::skip_field(cursor, source.and_then(|s| s.field_by_tag(tag)))?;
                continue;
            };

            let value = Self::decode_value(cursor, field)?;
            doc.insert(field.name.clone(), value);
        }

        for field in schema.fields() {
            if seen.contains(&field.tag) {
                continue;
            }

            if let Some(default) = &field.default {
                doc.insert(field.name.clone(), default.clone());
            } else if field.required {
                return Err(Error::InvalidSchema(format!(
                    "missing required field: {}",
                    field.name,
                )));
            }
        }

        Ok(doc)
    }

    fn decode_value(cursor: &mut Cursor<&[u8]>, field: &FieldDef) -> crate::Result<Value> {
        Ok(match field.field_type {
            FieldType::Int32 => Value::Int32(cursor.read_i32::<BigEndian>()?),
            FieldType::Int64 => Value::Int64(cursor.read_i64::<BigEndian>()?),
            FieldType::Float32 => Value::Float32(cursor.read_f32::<BigEndian>()?),
            FieldType::Float64 => Value::Float64(cursor.read_f64::<BigEndian>()?),
            FieldType::Bool => Value::Bool(cursor.read_u8()? != 0),
            FieldType::String => {
                Value::String(String::from_utf8(Self::read_bytes(cursor)?).map_err(DecodeError::from)?)
            }
            FieldType::Bytes => Value::Bytes(Self::read_bytes(cursor)?),
            FieldType::Array => {
                let element_type = field.element_type.unwrap_or(FieldType::String);
                let element_field = FieldDef::new(field.tag, field.name.clone(), element_type);

                let count = cursor.read_u32_varint()?;
                let mut items = Vec::with_capacity(count as usize);

                for _ in 0..count {
                    items.push(Self::decode_value(cursor, &element_field)?);
                }

                Value::Array(items)
            }
            FieldType::Map => {
                let count = cursor.read_u32_varint()?;
                let mut map = BTreeMap::new();

                for _ in 0..count {
                    let key = String::from_utf8(Self::read_bytes(cursor)?)
                        .map_err(DecodeError::from)?;
                    let value = String::from_utf8(Self::read_bytes(cursor)?)
                        .map_err(DecodeError::from)?;
                    map.insert(key, value);
                }

                Value::Map(map)
            }
            FieldType::Nested => {
                let Some(nested_schema) = &field.nested else {
                    return Err(Error::InvalidSchema(format!(
                        "field {} has no nested schema",
                        field.name,
                    )));
                };

                let inner = Self::read_bytes(cursor)?;
                let mut inner_cursor = Cursor::new(inner.as_slice());

                Value::Nested(Self::decode_fields(
                    &mut inner_cursor,
                    nested_schema,
                    None,
                )?)
            }
        })
    }

    /// Skips an unknown field, using the writer's type if known, else the
    /// length-prefix convention.
    fn skip_field(cursor: &mut Cursor<&[u8]>, source_field: Option<&FieldDef>) -> crate::Result<()> {
        let Some(field) = source_field else {
            let len = cursor.read_u32_varint()?;
            Self::advance(cursor, len as u64)?;
            return Ok(());
        };

        match field.field_type {
            FieldType::Int32 | FieldType::Float32 => Self::advance(cursor, 4)?,
            FieldType::Int64 | FieldType::Float64 => Self::advance(cursor, 8)?,
            FieldType::Bool => Self::advance(cursor, 1)?,
            FieldType::String | FieldType::Bytes | FieldType::Nested => {
                let len = cursor.read_u32_varint()?;
                Self::advance(cursor, u64::from(len))?;
            }
            FieldType::Array => {
                let element_type = field.element_type.unwrap_or(FieldType::String);
                let element_field = FieldDef::new(field.tag, field.name.clone(), element_type);

                let count = cursor.read_u32_varint()?;
                for _ in 0..count {
                    Self::skip_field(cursor, Some(&element_field))?;
                }
            }
            FieldType::Map => {
                let count = cursor.read_u32_varint()?;
                for _ in 0..count {
                    let len = cursor.read_u32_varint()?;
                    Self::advance(cursor, u64::from(len))?;
                    let len = cursor.read_u32_varint()?;
                    Self::advance(cursor, u64::from(len))?;
                }
            }
        }

        Ok(())
    }

    fn read_bytes(cursor: &mut Cursor<&[u8]>) -> crate::Result<Vec<u8>> {
        let len = cursor.read_u32_varint()?;
        let mut buf = vec![0u8; len as usize];
        cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn advance(cursor: &mut Cursor<&[u8]>, by: u64) -> crate::Result<()> {
        let target = cursor.position() + by;

        if target > cursor.get_ref().len() as u64 {
            return Err(DecodeError::UnexpectedEof.into());
        }

        cursor.set_position(target);
        Ok(())
    }
}

/// One-shot decode against a registry.
pub fn decode(registry: &SchemaRegistry, data: &[u8]) -> crate::Result<Document> {
    Decoder::with_registry(registry).decode(data)
}

/// One-shot decode under an explicit reader schema, resolving the writer
/// schema from the registry for unknown-tag skipping.
pub fn decode_as(
    registry: &SchemaRegistry,
    target: &Schema,
    data: &[u8],
) -> crate::Result<Document> {
    Decoder::with_registry(registry).with_target(target).decode(data)
}
