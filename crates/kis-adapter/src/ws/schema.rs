/*
[INPUT]:  '^'-separated event payloads and per-channel field tables
[OUTPUT]: Decoded records keyed by field name
[POS]:    WebSocket layer - declarative record decoding
[UPDATE]: When adding decoders or changing how payloads split into records
*/

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::http::{KisError, Result};

const FIELD_SEPARATOR: char = '^';

/// One decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Missing,
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(value) => Some(*value),
            FieldValue::Integer(value) => Some(Decimal::from(*value)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(value) => f.write_str(value),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Decimal(value) => write!(f, "{value}"),
            FieldValue::Missing => Ok(()),
        }
    }
}

pub type Decoder = fn(&str) -> Option<FieldValue>;

pub fn text(raw: &str) -> Option<FieldValue> {
    Some(FieldValue::Text(raw.trim().to_string()))
}

pub fn integer(raw: &str) -> Option<FieldValue> {
    raw.trim().parse::<i64>().ok().map(FieldValue::Integer)
}

pub fn decimal(raw: &str) -> Option<FieldValue> {
    Decimal::from_str(raw.trim()).ok().map(FieldValue::Decimal)
}

/// `(name, decoder, default)` row of a record table.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub decode: Decoder,
    pub default: FieldValue,
}

impl FieldSpec {
    pub fn new(name: &'static str, decode: Decoder, default: FieldValue) -> Self {
        Self {
            name,
            decode,
            default,
        }
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, text, FieldValue::Text(String::new()))
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, integer, FieldValue::Integer(0))
    }

    pub fn decimal(name: &'static str) -> Self {
        Self::new(name, decimal, FieldValue::Decimal(Decimal::ZERO))
    }
}

/// Decoded record. Field order follows the schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub tr_id: String,
    fields: Vec<(&'static str, FieldValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (*name, value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Ordered field table for one channel.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub tr_id: String,
    pub fields: Vec<FieldSpec>,
    /// Field carrying the subscription key (e.g. the stock code), if any.
    pub key_field: Option<&'static str>,
}

impl RecordSchema {
    pub fn new(tr_id: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            tr_id: tr_id.into(),
            fields,
            key_field: None,
        }
    }

    pub fn with_key_field(mut self, name: &'static str) -> Self {
        self.key_field = Some(name);
        self
    }

    /// Split `payload` into `count` records and decode each positionally.
    /// Short or undecodable fields fall back to their default.
    pub fn decode_payload(&self, payload: &str, count: usize) -> Result<Vec<Record>> {
        if count == 0 {
            return Err(KisError::Protocol("record count must be positive".to_string()));
        }

        let values: Vec<&str> = payload.split(FIELD_SEPARATOR).collect();
        let per_record = values.len() / count;
        if per_record == 0 {
            return Err(KisError::Protocol(format!(
                "{} fields cannot hold {count} {} records",
                values.len(),
                self.tr_id
            )));
        }

        Ok(values
            .chunks(per_record)
            .take(count)
            .map(|chunk| self.decode_record(chunk))
            .collect())
    }

    fn decode_record(&self, values: &[&str]) -> Record {
        let fields = self
            .fields
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let value = values
                    .get(index)
                    .and_then(|raw| (spec.decode)(raw))
                    .unwrap_or_else(|| spec.default.clone());
                (spec.name, value)
            })
            .collect();

        Record {
            tr_id: self.tr_id.clone(),
            fields,
        }
    }

    /// Subscription key carried by `record`, per `key_field`.
    pub fn key_of<'r>(&self, record: &'r Record) -> Option<&'r str> {
        self.key_field.and_then(|name| record.text(name))
    }
}

/// `tr_id -> schema` table supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<RecordSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: RecordSchema) -> &mut Self {
        self.schemas.insert(schema.tr_id.clone(), Arc::new(schema));
        self
    }

    pub fn with(mut self, schema: RecordSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, tr_id: &str) -> Option<Arc<RecordSchema>> {
        self.schemas.get(tr_id).cloned()
    }

    pub fn contains(&self, tr_id: &str) -> bool {
        self.schemas.contains_key(tr_id)
    }
}
