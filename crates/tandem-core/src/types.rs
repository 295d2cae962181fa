//! # Entity Types
//!
//! The synchronized entities and the bookkeeping types that travel with them.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncEntity (tagged union)                       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  Conversation   │   │  KnowledgeItem  │   │    Project      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id, zone       │   │  id, zone       │   │  id, zone       │       │
//! │  │  messages[]     │   │  title/content  │   │  name/summary   │       │
//! │  │  devices{}      │   │  created_at     │   │  last_modified  │       │
//! │  │  union-merge    │   │  LWW            │   │  LWW            │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                              │
//! │  │    Message      │   │    Settings     │                              │
//! │  │  ─────────────  │   │  ─────────────  │                              │
//! │  │  id, timestamp  │   │  values{}       │                              │
//! │  │  LWW            │   │  field-level    │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entities are plain values. Components pass them by copy; nothing here is
//! shared mutably across component boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceClass;
use crate::error::{CoreError, CoreResult};

/// Name of the zone used when none is configured.
pub const DEFAULT_ZONE_NAME: &str = "TandemZone";

// =============================================================================
// Zone
// =============================================================================

/// Named partition of the remote store holding one account's records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(name: impl Into<String>) -> Self {
        ZoneId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        ZoneId(DEFAULT_ZONE_NAME.to_string())
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Entity Kind / Reference
// =============================================================================

/// Discriminant of [`SyncEntity`], doubling as the remote record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Conversation,
    Message,
    KnowledgeItem,
    Project,
    Settings,
}

impl EntityKind {
    /// Every kind, in subscription order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Conversation,
        EntityKind::Message,
        EntityKind::KnowledgeItem,
        EntityKind::Project,
        EntityKind::Settings,
    ];

    /// Record type name used by the remote store.
    pub fn record_type(&self) -> &'static str {
        match self {
            EntityKind::Conversation => "Conversation",
            EntityKind::Message => "Message",
            EntityKind::KnowledgeItem => "KnowledgeItem",
            EntityKind::Project => "Project",
            EntityKind::Settings => "Settings",
        }
    }

    /// Inverse of [`EntityKind::record_type`].
    pub fn from_record_type(record_type: &str) -> Option<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.record_type() == record_type)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_type())
    }
}

/// Identifies one entity without carrying its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
    pub zone: ZoneId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: Uuid, zone: ZoneId) -> Self {
        EntityRef { kind, id, zone }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Message
// =============================================================================

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single message, either embedded in a conversation or synced on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Stable identifier (UUID v4).
    pub id: Uuid,

    /// Owning zone.
    pub zone: ZoneId,

    /// Conversation this message belongs to.
    pub conversation_id: Uuid,

    pub role: MessageRole,

    pub content: String,

    /// Write time. Messages inside a conversation are ordered by it.
    pub timestamp: DateTime<Utc>,

    /// Device that produced the message (provenance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Model that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Message {
    pub fn new(
        conversation: &Conversation,
        role: MessageRole,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Message {
            id: Uuid::new_v4(),
            zone: conversation.zone.clone(),
            conversation_id: conversation.id,
            role,
            content: content.into(),
            timestamp,
            device_id: None,
            model: None,
        }
    }

    /// Tags the message with the device that wrote it.
    pub fn from_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// A conversation and its full message history.
///
/// Invariant: `messages` are unique by id and sorted by `(timestamp, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub zone: ZoneId,
    pub title: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Devices that have written to this conversation.
    #[serde(default)]
    pub participating_devices: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(zone: ZoneId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Conversation {
            id: Uuid::new_v4(),
            zone,
            title: title.into(),
            model: None,
            messages: Vec::new(),
            tags: BTreeSet::new(),
            participating_devices: BTreeSet::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Appends a message, keeping the ordering invariant and provenance set.
    ///
    /// A message whose id is already present replaces the stored copy.
    pub fn append_message(&mut self, message: Message) {
        if let Some(device) = &message.device_id {
            self.participating_devices.insert(device.clone());
        }
        if message.timestamp > self.modified_at {
            self.modified_at = message.timestamp;
        }
        self.messages.retain(|m| m.id != message.id);
        self.messages.push(message);
        sort_messages(&mut self.messages);
    }

    /// Returns true if a message with this id is present.
    pub fn contains_message(&self, id: Uuid) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }
}

/// Sorts messages by `(timestamp, id)`.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
}

// =============================================================================
// Knowledge Item / Project
// =============================================================================

/// A knowledge-base entry.
///
/// Items are edited as atomic wholes: every edit writes a new revision and
/// stamps `created_at` with the revision time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub zone: ZoneId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source_device: Option<String>,
    /// Revision time.
    pub created_at: DateTime<Utc>,
}

impl KnowledgeItem {
    pub fn new(
        zone: ZoneId,
        title: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        KnowledgeItem {
            id: Uuid::new_v4(),
            zone,
            title: title.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            source_device: None,
            created_at: now,
        }
    }

    /// Writes a new revision of the content.
    pub fn revise(&mut self, content: impl Into<String>, now: DateTime<Utc>) {
        self.content = content.into();
        self.created_at = now;
    }
}

/// A project grouping conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub zone: ZoneId,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub conversation_ids: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Project {
    pub fn new(zone: ZoneId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Project {
            id: Uuid::new_v4(),
            zone,
            name: name.into(),
            summary: String::new(),
            conversation_ids: BTreeSet::new(),
            created_at: now,
            last_modified: now,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Key/value application settings.
///
/// There is one global settings entity per account plus, optionally, one per
/// device class. Ids are derived deterministically so every device addresses
/// the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub id: Uuid,
    pub zone: ZoneId,
    /// `None` for account-wide settings.
    #[serde(default)]
    pub device_class: Option<DeviceClass>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// When each key was last written. Records from older builds carry none,
    /// in which case `modified_at` stands in for every key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_stamps: BTreeMap<String, DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

impl Settings {
    /// Account-wide settings.
    pub fn global(zone: ZoneId, now: DateTime<Utc>) -> Self {
        Settings {
            id: Self::id_for(None),
            zone,
            device_class: None,
            values: BTreeMap::new(),
            field_stamps: BTreeMap::new(),
            modified_at: now,
        }
    }

    /// Settings shared only by devices of one class.
    pub fn for_class(zone: ZoneId, class: DeviceClass, now: DateTime<Utc>) -> Self {
        Settings {
            id: Self::id_for(Some(class)),
            zone,
            device_class: Some(class),
            values: BTreeMap::new(),
            field_stamps: BTreeMap::new(),
            modified_at: now,
        }
    }

    /// Deterministic id for a settings scope.
    pub fn id_for(class: Option<DeviceClass>) -> Uuid {
        let scope = class.map(|c| c.ordinal() as u128 + 1).unwrap_or(0);
        Uuid::from_u128(0x7a6e_6465_6d00_0000_0000_0000_0000_0000 | scope)
    }

    /// Sets one value, stamps the key and bumps `modified_at`.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value, now: DateTime<Utc>) {
        let key = key.into();
        self.field_stamps.insert(key.clone(), now);
        self.values.insert(key, value);
        if now > self.modified_at {
            self.modified_at = now;
        }
    }

    /// When `key` was last written.
    pub fn stamp_of(&self, key: &str) -> DateTime<Utc> {
        self.field_stamps.get(key).copied().unwrap_or(self.modified_at)
    }
}

// =============================================================================
// SyncEntity
// =============================================================================

/// Tagged union of every synchronized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum SyncEntity {
    Conversation(Conversation),
    Message(Message),
    KnowledgeItem(KnowledgeItem),
    Project(Project),
    Settings(Settings),
}

impl SyncEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            SyncEntity::Conversation(_) => EntityKind::Conversation,
            SyncEntity::Message(_) => EntityKind::Message,
            SyncEntity::KnowledgeItem(_) => EntityKind::KnowledgeItem,
            SyncEntity::Project(_) => EntityKind::Project,
            SyncEntity::Settings(_) => EntityKind::Settings,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            SyncEntity::Conversation(c) => c.id,
            SyncEntity::Message(m) => m.id,
            SyncEntity::KnowledgeItem(k) => k.id,
            SyncEntity::Project(p) => p.id,
            SyncEntity::Settings(s) => s.id,
        }
    }

    pub fn zone(&self) -> &ZoneId {
        match self {
            SyncEntity::Conversation(c) => &c.zone,
            SyncEntity::Message(m) => &m.zone,
            SyncEntity::KnowledgeItem(k) => &k.zone,
            SyncEntity::Project(p) => &p.zone,
            SyncEntity::Settings(s) => &s.zone,
        }
    }

    /// The timestamp the merge policy for this kind compares.
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            SyncEntity::Conversation(c) => c.modified_at,
            SyncEntity::Message(m) => m.timestamp,
            SyncEntity::KnowledgeItem(k) => k.created_at,
            SyncEntity::Project(p) => p.last_modified,
            SyncEntity::Settings(s) => s.modified_at,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id(), self.zone().clone())
    }

    pub fn to_json(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

impl From<Conversation> for SyncEntity {
    fn from(value: Conversation) -> Self {
        SyncEntity::Conversation(value)
    }
}

impl From<Message> for SyncEntity {
    fn from(value: Message) -> Self {
        SyncEntity::Message(value)
    }
}

impl From<KnowledgeItem> for SyncEntity {
    fn from(value: KnowledgeItem) -> Self {
        SyncEntity::KnowledgeItem(value)
    }
}

impl From<Project> for SyncEntity {
    fn from(value: Project) -> Self {
        SyncEntity::Project(value)
    }
}

impl From<Settings> for SyncEntity {
    fn from(value: Settings) -> Self {
        SyncEntity::Settings(value)
    }
}

// =============================================================================
// Change Token
// =============================================================================

/// Opaque, server-issued cursor over a zone's change log.
///
/// The bytes are never interpreted on the client; they are stored and
/// handed back verbatim. Absence of a token means "full history".
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(#[serde(with = "crate::record::base64_bytes")] Vec<u8>);

impl ChangeToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        ChangeToken(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken({} bytes)", self.0.len())
    }
}

// =============================================================================
// Pending Change
// =============================================================================

/// Kind of local mutation waiting to be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ChangeOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeOperation::Create),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            other => Err(CoreError::InvalidValue {
                field: "operation".into(),
                value: other.into(),
            }),
        }
    }
}

/// A local mutation not yet confirmed pushed.
///
/// ## Lifecycle
/// ```text
/// local write ──► enqueued ──► flushed in batch ──┬─► confirmed: removed
///                     ▲                           │
///                     └──── attempts += 1 ◄───────┴─► failed
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: Uuid,
    pub operation: ChangeOperation,
    pub entity_ref: EntityRef,
    /// Snapshot to push. `None` for deletions.
    #[serde(default)]
    pub entity: Option<SyncEntity>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingChange {
    pub fn create(entity: SyncEntity) -> Self {
        Self::upsert(ChangeOperation::Create, entity)
    }

    pub fn update(entity: SyncEntity) -> Self {
        Self::upsert(ChangeOperation::Update, entity)
    }

    pub fn delete(entity_ref: EntityRef) -> Self {
        PendingChange {
            id: Uuid::new_v4(),
            operation: ChangeOperation::Delete,
            entity_ref,
            entity: None,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    fn upsert(operation: ChangeOperation, entity: SyncEntity) -> Self {
        PendingChange {
            id: Uuid::new_v4(),
            operation,
            entity_ref: entity.entity_ref(),
            entity: Some(entity),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}
