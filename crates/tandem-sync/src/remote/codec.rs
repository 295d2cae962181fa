//! # Record Codec
//!
//! Maps entities to store records and back. Nothing else in the engine
//! looks inside a record's field map.
//!
//! ## Record Layout
//! ```text
//! recordType   "Conversation" | "Message" | "KnowledgeItem" | "Project" | "Settings"
//! recordName   entity UUID
//! fields
//!   payload      Bytes      sealed entity JSON
//!   modifiedAt   Timestamp  plaintext, lets the store order without decrypting
//!   schema       Integer    payload layout version
//! ```

use std::sync::Arc;

use tracing::warn;

use crate::crypto::Cipher;
use crate::error::{SyncError, SyncResult};
use tandem_core::{FieldValue, Record, SyncEntity};

pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_MODIFIED_AT: &str = "modifiedAt";
pub const FIELD_SCHEMA: &str = "schema";

/// Payload layout written by this build.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct RecordCodec {
    cipher: Arc<dyn Cipher>,
}

impl RecordCodec {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        RecordCodec { cipher }
    }

    /// Builds the record for an entity, carrying the last known change tag.
    pub fn encode(&self, entity: &SyncEntity, change_tag: Option<String>) -> SyncResult<Record> {
        let sealed = self.cipher.encrypt(&entity.to_json()?)?;

        let mut record = Record::new(
            entity.kind().record_type(),
            entity.id().to_string(),
            entity.zone().clone(),
        )
        .with_field(FIELD_PAYLOAD, FieldValue::Bytes(sealed))
        .with_field(FIELD_MODIFIED_AT, FieldValue::Timestamp(entity.modified_at()))
        .with_field(FIELD_SCHEMA, FieldValue::Integer(SCHEMA_VERSION));
        record.change_tag = change_tag;

        Ok(record)
    }

    /// Recovers the entity from a record.
    ///
    /// The decoded entity must be the one the record key names.
    pub fn decode(&self, record: &Record) -> SyncResult<SyncEntity> {
        let key = record.key();
        let expected = key.entity_ref()?;

        if let Some(schema) = record.integer(FIELD_SCHEMA) {
            if schema > SCHEMA_VERSION {
                return Err(SyncError::InvalidRecord(format!(
                    "{}/{} uses schema {} (newest known is {})",
                    key.record_type, key.record_name, schema, SCHEMA_VERSION
                )));
            }
        }

        let sealed = record.require_bytes(FIELD_PAYLOAD)?;
        let json = self.cipher.decrypt(sealed)?;
        let entity = SyncEntity::from_json(&json)?;

        if entity.entity_ref() != expected {
            return Err(SyncError::InvalidRecord(format!(
                "record {}/{} holds {}",
                key.record_type,
                key.record_name,
                entity.entity_ref()
            )));
        }

        Ok(entity)
    }

    /// Decodes a batch, logging and skipping records that fail.
    pub fn decode_lossy<'a, I>(&self, records: I) -> Vec<(SyncEntity, &'a Record)>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records
            .into_iter()
            .filter_map(|record| match self.decode(record) {
                Ok(entity) => Some((entity, record)),
                Err(e) => {
                    warn!(
                        record_type = %record.record_type,
                        record_name = %record.record_name,
                        error = %e,
                        "Skipping undecodable record"
                    );
                    None
                }
            })
            .collect()
    }
}
