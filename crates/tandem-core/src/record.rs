//! # Record Boundary
//!
//! The remote store speaks in loosely-typed records: a record type, a string
//! id and a map of fields, scoped to a zone. These types model that wire
//! shape; converting between records and [`SyncEntity`](crate::SyncEntity)
//! happens in exactly one place (the record codec in `tandem-sync`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{EntityKind, EntityRef, ZoneId};

// =============================================================================
// Field Values
// =============================================================================

/// One typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    TextList(Vec<String>),
}

// =============================================================================
// Record
// =============================================================================

/// Identity of a record inside the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub zone: ZoneId,
    pub record_type: String,
    pub record_name: String,
}

impl From<&EntityRef> for RecordKey {
    fn from(entity: &EntityRef) -> Self {
        RecordKey {
            zone: entity.zone.clone(),
            record_type: entity.kind.record_type().to_string(),
            record_name: entity.id.to_string(),
        }
    }
}

impl RecordKey {
    /// Resolves the key back to a typed entity reference.
    pub fn entity_ref(&self) -> CoreResult<EntityRef> {
        let kind = EntityKind::from_record_type(&self.record_type)
            .ok_or_else(|| CoreError::UnknownRecordType(self.record_type.clone()))?;
        let id = Uuid::parse_str(&self.record_name).map_err(|e| CoreError::InvalidValue {
            field: "record_name".into(),
            value: format!("{}: {}", self.record_name, e),
        })?;
        Ok(EntityRef::new(kind, id, self.zone.clone()))
    }
}

/// A record as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_type: String,
    pub record_name: String,
    pub zone: ZoneId,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Server-assigned version. `None` on records never saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_tag: Option<String>,
}

impl Record {
    pub fn new(
        record_type: impl Into<String>,
        record_name: impl Into<String>,
        zone: ZoneId,
    ) -> Self {
        Record {
            record_type: record_type.into(),
            record_name: record_name.into(),
            zone,
            fields: BTreeMap::new(),
            change_tag: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            zone: self.zone.clone(),
            record_type: self.record_type.clone(),
            record_name: self.record_name.clone(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.fields.get(name) {
            Some(FieldValue::Timestamp(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(FieldValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Like [`Record::bytes`] but missing fields are an error.
    pub fn require_bytes(&self, name: &str) -> CoreResult<&[u8]> {
        self.bytes(name).ok_or_else(|| CoreError::MissingField {
            record_type: self.record_type.clone(),
            field: name.to_string(),
        })
    }
}

/// A deletion reported by a delta fetch.
pub type DeletedRecord = RecordKey;

// =============================================================================
// Base64 helpers
// =============================================================================

/// Serde adapter storing byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
