//! # Error Types
//!
//! Domain errors for tandem-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tandem-core errors (this file)                                        │
//! │  └── CoreError        - Merge preconditions, record decoding           │
//! │                                                                         │
//! │  tandem-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tandem-sync errors (separate crate)                                   │
//! │  └── SyncError        - Network, protocol, conflict, config            │
//! │                                                                         │
//! │  Flow: CoreError → SyncError → SyncEvent::SyncFailed                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::types::EntityKind;

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two versions of different kinds were handed to the merger.
    #[error("Cannot merge {local} with {remote}")]
    KindMismatch { local: EntityKind, remote: EntityKind },

    /// Two versions of different entities were handed to the merger.
    #[error("Cannot merge entity {local} with entity {remote}")]
    IdentityMismatch { local: Uuid, remote: Uuid },

    /// A record carries a type this build does not know.
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    /// A record is missing a required field.
    #[error("{record_type} record is missing field '{field}'")]
    MissingField { record_type: String, field: String },

    /// A value could not be parsed.
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Entity JSON could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::KindMismatch {
            local: EntityKind::Project,
            remote: EntityKind::Settings,
        };
        assert_eq!(err.to_string(), "Cannot merge Project with Settings");

        let err = CoreError::MissingField {
            record_type: "Conversation".into(),
            field: "payload".into(),
        };
        assert_eq!(err.to_string(), "Conversation record is missing field 'payload'");
    }
}
