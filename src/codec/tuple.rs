//! Tuple Codec
//!
//! A compact, self-describing binary layout for flat entities. Field 0 of
//! every schema is the primary key.
//!
//! ## Payload Format
//!
//! ```text
//! [u16 field count] { [u8 tag] [value] }*
//!
//! tag 0  Null   (no value bytes)
//! tag 1  Bool   u8 (0 or 1)
//! tag 2  Int    i64
//! tag 3  Str    u32 length, UTF-8 bytes
//! tag 4  Bytes  u32 length, raw bytes
//! ```
//!
//! All integers are little-endian. Because every field is tagged, matching a
//! template walks the payload field by field and compares raw bytes; no
//! `String` or `Vec` is built unless a template field actually needs to be
//! compared, and even then the comparison borrows from the payload.

use super::{EntityCodec, MatchResult};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Bytes),
}

impl Value {
    fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldKind::Bool),
            Value::Int(_) => Some(FieldKind::Int),
            Value::Str(_) => Some(FieldKind::Str),
            Value::Bytes(_) => Some(FieldKind::Bytes),
        }
    }

    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            Value::Null => out.put_u8(TAG_NULL),
            Value::Bool(b) => {
                out.put_u8(TAG_BOOL);
                out.put_u8(u8::from(*b));
            }
            Value::Int(i) => {
                out.put_u8(TAG_INT);
                out.put_i64_le(*i);
            }
            Value::Str(s) => {
                out.put_u8(TAG_STR);
                out.put_u32_le(length_prefix(s.len())?);
                out.put_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.put_u8(TAG_BYTES);
                out.put_u32_le(length_prefix(b.len())?);
                out.put_slice(b);
            }
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 8,
            Value::Str(s) => 4 + s.len(),
            Value::Bytes(b) => 4 + b.len(),
        }
    }
}

/// Variable-length values carry a u32 length prefix.
fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Codec(format!("field of {len} bytes exceeds the u32 length prefix")))
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Str,
    Bytes,
}

/// Ordered field list of a persistent type.
#[derive(Debug, Clone)]
pub struct Schema {
    type_name: String,
    fields: Vec<(String, FieldKind)>,
}

impl Schema {
    /// Starts a schema whose first field is the primary key.
    pub fn new(type_name: impl Into<String>, key: impl Into<String>, key_kind: FieldKind) -> Self {
        Self {
            type_name: type_name.into(),
            fields: vec![(key.into(), key_kind)],
        }
    }

    /// Appends a field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    /// Position of a named field.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A materialised row of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub fields: Vec<Value>,
}

impl Entity {
    pub fn new(fields: Vec<Value>) -> Self {
        Self { fields }
    }

    /// The primary key field.
    pub fn key(&self) -> Option<&Value> {
        self.fields.first()
    }
}

/// A sparse entity; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    fields: Vec<Option<Value>>,
}

impl Template {
    /// A template with every field unset; matches all entities.
    pub fn any() -> Self {
        Self::default()
    }

    /// Sets field `index` to an exact value.
    pub fn with(mut self, index: usize, value: impl Into<Value>) -> Self {
        if self.fields.len() <= index {
            self.fields.resize(index + 1, None);
        }
        self.fields[index] = Some(value.into());
        self
    }

    /// Template that selects exactly one primary key.
    pub fn by_key(key: impl Into<Value>) -> Self {
        Self::any().with(0, key)
    }
}

/// [`EntityCodec`] for flat tuples described by a [`Schema`].
#[derive(Debug, Clone)]
pub struct TupleCodec {
    schema: Schema,
}

impl TupleCodec {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn validate(&self, entity: &Entity) -> Result<()> {
        if entity.fields.len() != self.schema.len() {
            return Err(Error::Codec(format!(
                "{} expects {} fields, got {}",
                self.schema.type_name,
                self.schema.len(),
                entity.fields.len()
            )));
        }
        for (i, (value, (name, kind))) in entity.fields.iter().zip(&self.schema.fields).enumerate() {
            match value.kind() {
                None if i == 0 => {
                    return Err(Error::Codec(format!("primary key '{name}' is null")));
                }
                Some(actual) if actual != *kind => {
                    return Err(Error::Codec(format!(
                        "field '{name}' expects {kind:?}, got {actual:?}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Borrowed view of one encoded field.
#[derive(Debug, PartialEq, Eq)]
enum RawField<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Str(&'a [u8]),
    Bytes(&'a [u8]),
}

impl RawField<'_> {
    fn equals(&self, value: &Value) -> bool {
        match (self, value) {
            (RawField::Null, Value::Null) => true,
            (RawField::Bool(a), Value::Bool(b)) => a == b,
            (RawField::Int(a), Value::Int(b)) => a == b,
            (RawField::Str(a), Value::Str(b)) => *a == b.as_bytes(),
            (RawField::Bytes(a), Value::Bytes(b)) => *a == &b[..],
            _ => false,
        }
    }

    fn to_value(&self) -> Result<Value> {
        Ok(match self {
            RawField::Null => Value::Null,
            RawField::Bool(b) => Value::Bool(*b),
            RawField::Int(i) => Value::Int(*i),
            RawField::Str(s) => Value::Str(
                std::str::from_utf8(s)
                    .map_err(|e| Error::Codec(e.to_string()))?
                    .to_string(),
            ),
            RawField::Bytes(b) => Value::Bytes(Bytes::copy_from_slice(b)),
        })
    }
}

/// Forward-only reader over a payload.
struct FieldReader<'a> {
    buf: &'a [u8],
    remaining_fields: u16,
}

impl<'a> FieldReader<'a> {
    fn new(payload: &'a [u8]) -> Result<Self> {
        let (count, rest) = split(payload, 2)?;
        Ok(Self {
            buf: rest,
            remaining_fields: u16::from_le_bytes([count[0], count[1]]),
        })
    }

    fn field_count(&self) -> u16 {
        self.remaining_fields
    }

    fn next_field(&mut self) -> Result<Option<RawField<'a>>> {
        if self.remaining_fields == 0 {
            return Ok(None);
        }
        self.remaining_fields -= 1;

        let (tag, rest) = split(self.buf, 1)?;
        self.buf = rest;
        let field = match tag[0] {
            TAG_NULL => RawField::Null,
            TAG_BOOL => RawField::Bool(self.take(1)?[0] != 0),
            TAG_INT => {
                let raw = self.take(8)?;
                let mut le = [0u8; 8];
                le.copy_from_slice(raw);
                RawField::Int(i64::from_le_bytes(le))
            }
            TAG_STR => RawField::Str(self.take_prefixed()?),
            TAG_BYTES => RawField::Bytes(self.take_prefixed()?),
            other => return Err(Error::Codec(format!("unknown field tag {other}"))),
        };
        Ok(Some(field))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let (head, rest) = split(self.buf, n)?;
        self.buf = rest;
        Ok(head)
    }

    fn take_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.take(4)?;
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        self.take(len)
    }
}

fn split(buf: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if buf.len() < n {
        return Err(Error::Codec(format!(
            "truncated payload: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(buf.split_at(n))
}

impl EntityCodec for TupleCodec {
    type Key = Value;
    type Entity = Entity;
    type Template = Template;

    fn type_name(&self) -> &str {
        &self.schema.type_name
    }

    fn read_key(&self, payload: &[u8]) -> Result<Value> {
        let mut reader = FieldReader::new(payload)?;
        match reader.next_field()? {
            Some(RawField::Null) | None => Err(Error::Codec("payload has no primary key".into())),
            Some(field) => field.to_value(),
        }
    }

    fn key_of(&self, entity: &Entity) -> Result<Value> {
        match entity.key() {
            Some(Value::Null) | None => Err(Error::Codec("entity has no primary key".into())),
            Some(key) => Ok(key.clone()),
        }
    }

    fn matches(&self, payload: &[u8], template: &Template) -> Result<MatchResult> {
        let mut reader = FieldReader::new(payload)?;
        if template.fields.len() > reader.field_count() as usize {
            return Ok(MatchResult::Mismatched);
        }

        for wanted in &template.fields {
            let field = match reader.next_field()? {
                Some(field) => field,
                None => return Ok(MatchResult::Mismatched),
            };
            if let Some(value) = wanted {
                if !field.equals(value) {
                    return Ok(MatchResult::Mismatched);
                }
            }
        }
        Ok(MatchResult::Matched)
    }

    fn serialize(&self, entity: &Entity) -> Result<Bytes> {
        self.validate(entity)?;

        let len = 2 + entity.fields.iter().map(Value::encoded_len).sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        let count = u16::try_from(entity.fields.len())
            .map_err(|_| Error::Codec(format!("{} fields exceed the u16 field count", entity.fields.len())))?;
        out.put_u16_le(count);
        for value in &entity.fields {
            value.encode(&mut out)?;
        }
        Ok(out.freeze())
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Entity> {
        let mut reader = FieldReader::new(payload)?;
        let mut fields = Vec::with_capacity(reader.field_count() as usize);
        while let Some(field) = reader.next_field()? {
            fields.push(field.to_value()?);
        }
        Ok(Entity::new(fields))
    }
}
