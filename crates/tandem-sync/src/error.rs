//! # Sync Errors
//!
//! One error enum for the whole engine, grouped by where the failure starts.
//!
//! ```text
//!   setup            links              peer wire         record store
//!   ─────            ─────              ─────────         ────────────
//!   InvalidConfig    ConnectionFailed   InvalidMessage    ZoneNotFound
//!   MissingDeviceId  Disconnected       UnexpectedType    VersionConflict
//!   InvalidUrl       Timeout            Rejected          RemoteStore
//!   ConfigLoad/Save  WebSocketError     Encoding          InvalidRecord
//!                    Discovery
//!
//!   merge: ConflictUnresolved    local: DatabaseError, Crypto
//!   plumbing: Internal, ChannelError
//! ```
//!
//! Token expiry and "zone already exists" come back as values
//! ([`crate::remote::FetchOutcome::TokenExpired`],
//! [`crate::remote::ZoneCreation::AlreadyExists`]), not as errors.

use tandem_core::{CoreError, EntityRef, SyncEntity};
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Setup
    // =========================================================================
    #[error("sync configuration rejected: {0}")]
    InvalidConfig(String),

    /// No device id was stored or configured.
    #[error("this device has no id yet")]
    MissingDeviceId,

    #[error("bad store url: {0}")]
    InvalidUrl(String),

    #[error("could not read sync config: {0}")]
    ConfigLoadFailed(String),

    #[error("could not write sync config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Links
    // =========================================================================
    #[error("could not connect: {0}")]
    ConnectionFailed(String),

    #[error("link closed by the other side")]
    Disconnected,

    /// Seconds waited before giving up.
    #[error("gave up after {0}s")]
    Timeout(u64),

    #[error("websocket: {0}")]
    WebSocketError(String),

    /// mDNS daemon could not advertise or browse.
    #[error("peer discovery: {0}")]
    Discovery(String),

    // =========================================================================
    // Peer wire
    // =========================================================================
    #[error("malformed frame: {0}")]
    InvalidMessage(String),

    #[error("expected {expected} frame, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    /// Error frame sent by a peer.
    #[error("peer refused with {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("json encoding: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Record store
    // =========================================================================
    #[error("no such zone: {0}")]
    ZoneNotFound(String),

    /// Save lost to a newer server copy, which is carried here for merging.
    #[error("server has a newer {}", server.entity_ref())]
    VersionConflict { server: Box<SyncEntity> },

    #[error("record store: {0}")]
    RemoteStore(String),

    #[error("record does not map to an entity: {0}")]
    InvalidRecord(String),

    // =========================================================================
    // Merge
    // =========================================================================
    #[error("{entity} still conflicting after {attempts} attempts")]
    ConflictUnresolved { entity: EntityRef, attempts: u32 },

    // =========================================================================
    // Local
    // =========================================================================
    #[error("state database: {0}")]
    DatabaseError(String),

    #[error("payload cipher: {0}")]
    Crypto(String),

    // =========================================================================
    // Plumbing
    // =========================================================================
    #[error("internal: {0}")]
    Internal(String),

    /// A worker's command channel or reply slot went away.
    #[error("worker channel: {0}")]
    ChannelError(String),
}

// =============================================================================
// Conversions
// =============================================================================

impl From<tandem_db::DbError> for SyncError {
    fn from(err: tandem_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Serialization(detail) => SyncError::SerializationFailed(detail),
            other => SyncError::InvalidRecord(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as Ws;
        match err {
            Ws::ConnectionClosed | Ws::AlreadyClosed => SyncError::Disconnected,
            Ws::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            Ws::Tls(tls) => SyncError::ConnectionFailed(format!("tls: {}", tls)),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConnectionFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<mdns_sd::Error> for SyncError {
    fn from(err: mdns_sd::Error) -> Self {
        SyncError::Discovery(err.to_string())
    }
}

// =============================================================================
// Classification
// =============================================================================

impl SyncError {
    /// Worth trying again on the next flush or poll.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::RemoteStore(_)
                | SyncError::DatabaseError(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// The other end spoke something this build does not understand.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
                | SyncError::Rejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_core::{EntityKind, Project, ZoneId};
    use uuid::Uuid;

    #[test]
    fn test_link_failures_are_retryable() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(5).is_retryable());
        assert!(SyncError::RemoteStore("503".into()).is_retryable());

        assert!(!SyncError::MissingDeviceId.is_retryable());
        assert!(!SyncError::Crypto("bad tag".into()).is_retryable());
    }

    #[test]
    fn test_conflict_names_the_entity() {
        let server = SyncEntity::from(Project::new(ZoneId::default(), "p", Utc::now()));
        let err = SyncError::VersionConflict { server: Box::new(server) };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Project"));
    }

    #[test]
    fn test_unresolved_conflict_display() {
        let id = Uuid::new_v4();
        let err = SyncError::ConflictUnresolved {
            entity: EntityRef::new(EntityKind::Conversation, id, ZoneId::default()),
            attempts: 3,
        };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_categories_do_not_overlap() {
        let rejected = SyncError::Rejected {
            code: "account_mismatch".into(),
            message: "wrong account".into(),
        };
        assert!(rejected.is_protocol_error());
        assert!(!rejected.is_config_error());

        let url = SyncError::from(url::Url::parse("not a url").unwrap_err());
        assert!(url.is_config_error());
        assert!(!url.is_protocol_error());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: SyncError = CoreError::UnknownRecordType("Widget".into()).into();
        assert!(matches!(err, SyncError::InvalidRecord(_)));
    }
}
