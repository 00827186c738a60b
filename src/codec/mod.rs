// Copyright (c) 2025-present, skerry-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Versioned, schema-evolvable wire format
//!
//! Messages carry an 8-byte header (`VENC | version | name_len`) and the
//! schema name, followed by varint-tagged fields terminated by a zero tag.
//! Readers and writers may disagree on the schema version: unknown tags are
//! skipped, missing tags fall back to declared defaults.

mod decoder;
mod encoder;
mod schema;

pub use {
    decoder::{decode, decode_as, Decoder},
    encoder::{encode, Encoder},
    schema::{check_compatibility, Document, FieldDef, FieldType, Schema, SchemaRegistry, Value},
};

/// Magic bytes every message starts with
pub const MAGIC: [u8; 4] = *b"VENC";

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn user_v1() -> Schema {
        Schema::new("user", 1)
            .field(FieldDef::new(1, "id", FieldType::Int64).required())
            .field(FieldDef::new(2, "name", FieldType::String))
    }

    fn user_v2() -> Schema {
        Schema::new("user", 2)
            .field(FieldDef::new(1, "id", FieldType::Int64).required())
            .field(FieldDef::new(2, "name", FieldType::String))
            .field(
                FieldDef::new(3, "email", FieldType::String)
                    .default_value(Value::String("unknown@example.com".into())),
            )
            .field(FieldDef::new(4, "tags", FieldType::Array).element_type(FieldType::String))
    }

    fn sample_v1() -> Document {
        Document::from([
            ("id".to_owned(), Value::Int64(42)),
            ("name".to_owned(), Value::String("ada".into())),
        ])
    }

    #[test]
    fn codec_round_trip() -> crate::Result<()> {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());

        let bytes = encode(&user_v1(), &sample_v1())?;
        let decoded = decode(&registry, &bytes)?;

        assert_eq!(sample_v1(), decoded);
        Ok(())
    }

    #[test]
    fn codec_old_writer_new_reader_fills_defaults() -> crate::Result<()> {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());
        registry.register(user_v2());

        let bytes = encode(&user_v1(), &sample_v1())?;
        let decoded = decode_as(&registry, &user_v2(), &bytes)?;

        assert_eq!(
            Some(&Value::String("unknown@example.com".into())),
            decoded.get("email"),
        );
        assert_eq!(Some(&Value::Int64(42)), decoded.get("id"));

        Ok(())
    }

    #[test]
    fn codec_new_writer_old_reader_skips_unknown_tags() -> crate::Result<()> {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());
        registry.register(user_v2());

        let doc = Document::from([
            ("id".to_owned(), Value::Int64(7)),
            ("name".to_owned(), Value::String("grace".into())),
            ("email".to_owned(), Value::String("grace@example.com".into())),
            (
                "tags".to_owned(),
                Value::Array(vec![
                    Value::String("admin".into()),
                    Value::String("ops".into()),
                ]),
            ),
        ]);

        let bytes = encode(&user_v2(), &doc)?;
        let decoded = decode_as(&registry, &user_v1(), &bytes)?;

        assert_eq!(Some(&Value::Int64(7)), decoded.get("id"));
        assert_eq!(Some(&Value::String("grace".into())), decoded.get("name"));
        assert!(!decoded.contains_key("email"));
        assert!(!decoded.contains_key("tags"));

        Ok(())
    }

    #[test]
    fn codec_unknown_tag_without_source_schema_uses_length_prefix() -> crate::Result<()> {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());

        // The writer's v2 schema is NOT registered; its extra field must be
        // a length-prefixed type for the reader to skip it blindly
        let writer = Schema::new("user", 2)
            .field(FieldDef::new(1, "id", FieldType::Int64).required())
            .field(FieldDef::new(2, "name", FieldType::String))
            .field(FieldDef::new(9, "note", FieldType::String));

        let doc = Document::from([
            ("id".to_owned(), Value::Int64(1)),
            ("name".to_owned(), Value::String("x".into())),
            ("note".to_owned(), Value::String("ignore me".into())),
        ]);

        let bytes = encode(&writer, &doc)?;
        let decoded = decode_as(&registry, &user_v1(), &bytes)?;

        assert_eq!(Some(&Value::Int64(1)), decoded.get("id"));
        assert!(!decoded.contains_key("note"));

        Ok(())
    }

    #[test]
    fn codec_missing_required_field_fails() {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());

        let doc = Document::from([("name".to_owned(), Value::String("nobody".into()))]);

        assert!(matches!(
            encode(&user_v1(), &doc),
            Err(crate::Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn codec_type_mismatch_fails() {
        let doc = Document::from([("id".to_owned(), Value::String("not a number".into()))]);

        assert!(matches!(
            encode(&user_v1(), &doc),
            Err(crate::Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn codec_bad_magic_fails() {
        let mut registry = SchemaRegistry::new();
        registry.register(user_v1());

        assert!(decode(&registry, b"NOPE....").is_err());
    }

    #[test]
    fn codec_nested_and_map_round_trip() -> crate::Result<()> {
        let address = std::sync::Arc::new(
            Schema::new("address", 1)
                .field(FieldDef::new(1, "city", FieldType::String))
                .field(FieldDef::new(2, "zip", FieldType::String)),
        );

        let schema = Schema::new("profile", 1)
            .field(FieldDef::new(1, "address", FieldType::Nested).nested(address))
            .field(FieldDef::new(2, "labels", FieldType::Map));

        let mut registry = SchemaRegistry::new();
        registry.register(schema.clone());

        let doc = Document::from([
            (
                "address".to_owned(),
                Value::Nested(Document::from([
                    ("city".to_owned(), Value::String("lund".into())),
                    ("zip".to_owned(), Value::String("22100".into())),
                ])),
            ),
            (
                "labels".to_owned(),
                Value::Map(std::collections::BTreeMap::from([
                    ("env".to_owned(), "prod".to_owned()),
                    ("tier".to_owned(), "1".to_owned()),
                ])),
            ),
        ]);

        let bytes = encode(&schema, &doc)?;
        let decoded = decode(&registry, &bytes)?;

        assert_eq!(doc, decoded);
        Ok(())
    }
}
