//! # Wire Messages
//!
//! Two JSON protocols: one to a hosted record store, one between devices of
//! the same account.
//!
//! ```text
//!   record store (request/response paired by requestId, plus one push)
//!
//!     CreateZone { zone }                   ─► ZoneCreated { alreadyExisted }
//!     FetchChanges { zone, token?, limit }  ─► ChangesPage { page } | TokenExpired
//!     SaveRecord { record }                 ─► RecordSaved { record } | SaveConflict { server }
//!     DeleteRecord { key }                  ─► RecordDeleted
//!     Subscribe { zone, recordTypes }       ─► Subscribed { alreadyExisted }
//!                                           ◄─ ZoneChanged { zone }        (unsolicited)
//!
//!   peer link (pusher opens, receiver answers)
//!
//!     Hello { deviceId, accountId, protocolVersion } ─► Welcome | Error(ACCOUNT_MISMATCH)
//!     Changes { batchId, entities, deleted }         ─► Ack { batchId }
//! ```
//!
//! Every frame is `{ "type": <variant>, "payload": { ... } }` with camelCase
//! payload keys.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::ZoneChangesPage;
use tandem_core::{ChangeToken, EntityRef, Record, RecordKey, SyncEntity, ZoneId};

/// Sent in `Hello`; receivers refuse other versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// `code` values carried by `Error` frames.
pub mod codes {
    pub const ACCOUNT_MISMATCH: &str = "ACCOUNT_MISMATCH";
    pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
    pub const HANDSHAKE_REQUIRED: &str = "HANDSHAKE_REQUIRED";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const ZONE_NOT_FOUND: &str = "ZONE_NOT_FOUND";
    pub const INTERNAL: &str = "INTERNAL";
}

/// JSON text encoding shared by both frame enums.
pub trait JsonFrame: Serialize + DeserializeOwned {
    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl JsonFrame for StoreMessage {}
impl JsonFrame for PeerMessage {}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// =============================================================================
// Record store
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StoreMessage {
    // =========================================================================
    // Requests
    // =========================================================================
    #[serde(rename_all = "camelCase")]
    CreateZone { request_id: u64, zone: ZoneId },

    #[serde(rename_all = "camelCase")]
    FetchChanges {
        request_id: u64,
        zone: ZoneId,
        #[serde(default)]
        token: Option<ChangeToken>,
        limit: u32,
    },

    #[serde(rename_all = "camelCase")]
    SaveRecord { request_id: u64, record: Record },

    #[serde(rename_all = "camelCase")]
    DeleteRecord { request_id: u64, key: RecordKey },

    #[serde(rename_all = "camelCase")]
    Subscribe {
        request_id: u64,
        zone: ZoneId,
        record_types: Vec<String>,
    },

    // =========================================================================
    // Responses
    // =========================================================================
    #[serde(rename_all = "camelCase")]
    ZoneCreated { request_id: u64, already_existed: bool },

    #[serde(rename_all = "camelCase")]
    ChangesPage { request_id: u64, page: ZoneChangesPage },

    /// The token passed to `FetchChanges` is no longer valid.
    #[serde(rename_all = "camelCase")]
    TokenExpired { request_id: u64 },

    #[serde(rename_all = "camelCase")]
    RecordSaved { request_id: u64, record: Record },

    /// The save carried a stale change tag; `server` is the current record.
    #[serde(rename_all = "camelCase")]
    SaveConflict { request_id: u64, server: Record },

    #[serde(rename_all = "camelCase")]
    RecordDeleted { request_id: u64 },

    #[serde(rename_all = "camelCase")]
    Subscribed { request_id: u64, already_existed: bool },

    // =========================================================================
    // Server Push
    // =========================================================================
    /// Something in the zone changed. Carries no data.
    ZoneChanged { zone: ZoneId },

    // =========================================================================
    // Either direction
    // =========================================================================
    Ping { timestamp: String },

    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        code: String,
        message: String,
    },
}

impl StoreMessage {
    /// Variant name, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreMessage::CreateZone { .. } => "CreateZone",
            StoreMessage::FetchChanges { .. } => "FetchChanges",
            StoreMessage::SaveRecord { .. } => "SaveRecord",
            StoreMessage::DeleteRecord { .. } => "DeleteRecord",
            StoreMessage::Subscribe { .. } => "Subscribe",
            StoreMessage::ZoneCreated { .. } => "ZoneCreated",
            StoreMessage::ChangesPage { .. } => "ChangesPage",
            StoreMessage::TokenExpired { .. } => "TokenExpired",
            StoreMessage::RecordSaved { .. } => "RecordSaved",
            StoreMessage::SaveConflict { .. } => "SaveConflict",
            StoreMessage::RecordDeleted { .. } => "RecordDeleted",
            StoreMessage::Subscribed { .. } => "Subscribed",
            StoreMessage::ZoneChanged { .. } => "ZoneChanged",
            StoreMessage::Ping { .. } => "Ping",
            StoreMessage::Pong { .. } => "Pong",
            StoreMessage::Error { .. } => "Error",
        }
    }

    /// Correlation id, for requests and their responses.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            StoreMessage::CreateZone { request_id, .. }
            | StoreMessage::FetchChanges { request_id, .. }
            | StoreMessage::SaveRecord { request_id, .. }
            | StoreMessage::DeleteRecord { request_id, .. }
            | StoreMessage::Subscribe { request_id, .. }
            | StoreMessage::ZoneCreated { request_id, .. }
            | StoreMessage::ChangesPage { request_id, .. }
            | StoreMessage::TokenExpired { request_id }
            | StoreMessage::RecordSaved { request_id, .. }
            | StoreMessage::SaveConflict { request_id, .. }
            | StoreMessage::RecordDeleted { request_id }
            | StoreMessage::Subscribed { request_id, .. } => Some(*request_id),
            StoreMessage::Error { request_id, .. } => *request_id,
            StoreMessage::ZoneChanged { .. }
            | StoreMessage::Ping { .. }
            | StoreMessage::Pong { .. } => None,
        }
    }

    /// Answer to a keepalive `Ping`, echoing its stamp.
    pub fn pong(echo: &str) -> Self {
        StoreMessage::Pong {
            ping_timestamp: echo.to_owned(),
            pong_timestamp: now_stamp(),
        }
    }
}

// =============================================================================
// Peer link
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PeerMessage {
    Hello(PeerHello),

    #[serde(rename_all = "camelCase")]
    Welcome { device_id: String },

    /// Entities and deletions pushed by a peer.
    Changes(ChangeBatch),

    /// Sent once every entity in the batch has been applied.
    #[serde(rename_all = "camelCase")]
    Ack { batch_id: Uuid },

    Ping { timestamp: String },

    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },

    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHello {
    pub device_id: String,

    #[serde(default)]
    pub device_name: String,

    /// Account the device is signed into. Must match the receiver's.
    pub account_id: String,

    pub protocol_version: u32,
}

/// A batch of local changes delivered over a peer transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub batch_id: Uuid,

    /// Device the changes originated on.
    pub origin_device: String,

    #[serde(default)]
    pub entities: Vec<SyncEntity>,

    #[serde(default)]
    pub deleted: Vec<EntityRef>,
}

impl ChangeBatch {
    pub fn new(
        origin_device: impl Into<String>,
        entities: Vec<SyncEntity>,
        deleted: Vec<EntityRef>,
    ) -> Self {
        ChangeBatch {
            batch_id: Uuid::new_v4(),
            origin_device: origin_device.into(),
            entities,
            deleted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.deleted.len()
    }
}

impl PeerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Hello(_) => "Hello",
            PeerMessage::Welcome { .. } => "Welcome",
            PeerMessage::Changes(_) => "Changes",
            PeerMessage::Ack { .. } => "Ack",
            PeerMessage::Ping { .. } => "Ping",
            PeerMessage::Pong { .. } => "Pong",
            PeerMessage::Error { .. } => "Error",
        }
    }

    pub fn hello(device_id: &str, device_name: &str, account_id: &str) -> Self {
        PeerMessage::Hello(PeerHello {
            device_id: device_id.to_owned(),
            device_name: device_name.to_owned(),
            account_id: account_id.to_owned(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn pong(echo: &str) -> Self {
        PeerMessage::Pong {
            ping_timestamp: echo.to_owned(),
            pong_timestamp: now_stamp(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        PeerMessage::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_core::{FieldValue, Project};

    #[test]
    fn test_fetch_request_shape() {
        let fetch = StoreMessage::FetchChanges {
            request_id: 7,
            zone: ZoneId::default(),
            token: Some(ChangeToken::new(vec![0, 1, 2])),
            limit: 200,
        };
        let json = fetch.to_json().unwrap();
        assert!(json.contains("\"type\":\"FetchChanges\""));
        assert!(json.contains("\"requestId\":7"));

        let parsed = StoreMessage::from_json(&json).unwrap();
        assert_eq!(parsed, fetch);
        assert_eq!(parsed.request_id(), Some(7));
    }

    #[test]
    fn test_first_fetch_omits_token() {
        let json =
            r#"{"type":"FetchChanges","payload":{"requestId":1,"zone":"TandemZone","limit":10}}"#;
        match StoreMessage::from_json(json).unwrap() {
            StoreMessage::FetchChanges { token, .. } => assert!(token.is_none()),
            other => panic!("Expected FetchChanges, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_save_conflict_carries_server_record() {
        let server = Record::new("Project", Uuid::new_v4().to_string(), ZoneId::default())
            .with_field("schema", FieldValue::Integer(1));
        let msg = StoreMessage::SaveConflict { request_id: 3, server: server.clone() };

        let parsed = StoreMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, StoreMessage::SaveConflict { request_id: 3, server });
    }

    #[test]
    fn test_push_has_no_request_id() {
        let msg = StoreMessage::ZoneChanged { zone: ZoneId::default() };
        assert_eq!(msg.request_id(), None);
        assert_eq!(msg.type_name(), "ZoneChanged");
    }

    #[test]
    fn test_peer_batch() {
        let project = Project::new(ZoneId::default(), "Garden", Utc::now());
        let batch = ChangeBatch::new("dev-1", vec![project.into()], Vec::new());
        assert_eq!(batch.len(), 1);

        let json = PeerMessage::Changes(batch.clone()).to_json().unwrap();
        assert!(json.contains("\"type\":\"Changes\""));
        assert!(json.contains("Garden"));

        match PeerMessage::from_json(&json).unwrap() {
            PeerMessage::Changes(parsed) => assert_eq!(parsed, batch),
            other => panic!("Expected Changes, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_peer_error_frame() {
        let frame = PeerMessage::error(codes::ACCOUNT_MISMATCH, "wrong account").to_json().unwrap();
        assert_eq!(
            frame,
            r#"{"type":"Error","payload":{"code":"ACCOUNT_MISMATCH","message":"wrong account"}}"#
        );
    }
}
