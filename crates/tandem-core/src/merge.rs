//! # Conflict Resolution
//!
//! Pure functions reconciling two versions of the same entity.
//!
//! ## Strategy per Kind
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Conversation   union-merge                                             │
//! │                 messages keyed by id, later timestamp wins per id,      │
//! │                 sorted by timestamp; title/model from the later side;   │
//! │                 tags and devices unioned; created = min, modified = max │
//! │                                                                         │
//! │  Message        LWW on timestamp, tie → remote                          │
//! │  KnowledgeItem  LWW on created_at (revision time), tie → remote         │
//! │  Project        LWW on last_modified, tie → remote                      │
//! │                                                                         │
//! │  Settings       field-level apply: only when remote is newer than the   │
//! │                 last settings sync, only fields that differ;            │
//! │                 a rejected push keeps only keys written here later      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conversation merge is commutative and idempotent. Equal timestamps fall
//! back to a total order over the remaining fields, so both devices pick the
//! same winner without coordinating.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::device::DeviceClass;
use crate::error::{CoreError, CoreResult};
use crate::types::{
    sort_messages, Conversation, KnowledgeItem, Message, MessageRole, Project, Settings, SyncEntity,
};

// =============================================================================
// Merge Context / Outcome
// =============================================================================

/// Local facts the merger needs beyond the two versions.
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    /// When remote settings were last applied on this device.
    pub last_settings_sync: Option<DateTime<Utc>>,

    /// Class of this device; settings scoped to another class are ignored.
    pub local_device_class: Option<DeviceClass>,
}

/// Result of reconciling a local and a remote version.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: SyncEntity,

    /// The merged value differs from the local copy and must be written.
    pub local_changed: bool,

    /// The merged value differs from the remote copy and should be re-pushed.
    pub remote_stale: bool,

    /// Settings keys that changed locally. Empty for other kinds.
    pub changed_fields: Vec<String>,
}

// =============================================================================
// Conversation
// =============================================================================

type MessageOrderKey<'a> = (
    DateTime<Utc>,
    &'a str,
    Option<&'a str>,
    Option<&'a str>,
    MessageRole,
    Uuid,
    &'a str,
);

fn message_order_key(m: &Message) -> MessageOrderKey<'_> {
    (
        m.timestamp,
        m.content.as_str(),
        m.device_id.as_deref(),
        m.model.as_deref(),
        m.role,
        m.conversation_id,
        m.zone.as_str(),
    )
}

/// Picks between two copies of the same message inside a conversation.
fn pick_message<'a>(a: &'a Message, b: &'a Message) -> &'a Message {
    match message_order_key(a).cmp(&message_order_key(b)) {
        Ordering::Less => b,
        _ => a,
    }
}

/// Union-merges two versions of a conversation.
///
/// Both inputs must describe the same conversation id.
pub fn merge_conversations(local: &Conversation, remote: &Conversation) -> Conversation {
    let mut by_id: BTreeMap<Uuid, &Message> = BTreeMap::new();
    for message in local.messages.iter().chain(remote.messages.iter()) {
        by_id
            .entry(message.id)
            .and_modify(|kept| *kept = pick_message(kept, message))
            .or_insert(message);
    }
    let mut messages: Vec<Message> = by_id.into_values().cloned().collect();
    sort_messages(&mut messages);

    let (title, model) = match local.modified_at.cmp(&remote.modified_at) {
        Ordering::Greater => (&local.title, &local.model),
        Ordering::Less => (&remote.title, &remote.model),
        Ordering::Equal => std::cmp::max(
            (&local.title, &local.model),
            (&remote.title, &remote.model),
        ),
    };

    Conversation {
        id: local.id,
        zone: local.zone.clone(),
        title: title.clone(),
        model: model.clone(),
        messages,
        tags: local.tags.union(&remote.tags).cloned().collect(),
        participating_devices: local
            .participating_devices
            .union(&remote.participating_devices)
            .cloned()
            .collect(),
        created_at: local.created_at.min(remote.created_at),
        modified_at: local.modified_at.max(remote.modified_at),
    }
}

// =============================================================================
// Last-write-wins
// =============================================================================

/// Generic LWW: strictly newer local wins, anything else takes remote.
fn last_write_wins<T: Clone>(local: &T, remote: &T, stamp: impl Fn(&T) -> DateTime<Utc>) -> T {
    if stamp(local) > stamp(remote) {
        local.clone()
    } else {
        remote.clone()
    }
}

pub fn merge_messages(local: &Message, remote: &Message) -> Message {
    last_write_wins(local, remote, |m| m.timestamp)
}

pub fn merge_knowledge_items(local: &KnowledgeItem, remote: &KnowledgeItem) -> KnowledgeItem {
    last_write_wins(local, remote, |k| k.created_at)
}

pub fn merge_projects(local: &Project, remote: &Project) -> Project {
    last_write_wins(local, remote, |p| p.last_modified)
}

// =============================================================================
// Settings
// =============================================================================

/// Result of a field-level settings apply.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsApply {
    pub merged: Settings,
    pub changed_fields: Vec<String>,
}

/// Applies remote settings field by field.
///
/// Nothing is applied unless `remote.modified_at` is newer than
/// `last_sync`. Only keys whose value actually differs are written.
pub fn apply_remote_settings(
    local: &Settings,
    remote: &Settings,
    last_sync: Option<DateTime<Utc>>,
) -> SettingsApply {
    let mut merged = local.clone();
    let mut changed_fields = Vec::new();

    if last_sync.is_some_and(|synced| remote.modified_at <= synced) {
        return SettingsApply { merged, changed_fields };
    }

    for (key, value) in &remote.values {
        if local.values.get(key) != Some(value) {
            merged.values.insert(key.clone(), value.clone());
            merged.field_stamps.insert(key.clone(), remote.stamp_of(key));
            changed_fields.push(key.clone());
        }
    }
    if !changed_fields.is_empty() {
        merged.modified_at = local.modified_at.max(remote.modified_at);
    }

    SettingsApply { merged, changed_fields }
}

/// Replays local settings on top of the server's copy before a retried save.
///
/// Only keys written here after the server's write of the same key are
/// carried over, so fields another device changed in the meantime survive.
/// When anything is carried over the result is stamped strictly after the
/// server copy, otherwise the server copy comes back untouched.
pub fn rebase_settings(ours: &Settings, server: &Settings) -> Settings {
    let mut merged = server.clone();
    let mut replayed = false;

    for (key, value) in &ours.values {
        let ours_at = ours.stamp_of(key);
        let newer = match server.values.get(key) {
            None => true,
            Some(theirs) => theirs != value && ours_at > server.stamp_of(key),
        };
        if newer {
            merged.values.insert(key.clone(), value.clone());
            merged.field_stamps.insert(key.clone(), ours_at);
            replayed = true;
        }
    }

    if replayed {
        let after_server = server.modified_at + Duration::milliseconds(1);
        merged.modified_at = ours.modified_at.max(after_server);
    }
    merged
}

// =============================================================================
// Dispatch
// =============================================================================

fn check_identity(local: &SyncEntity, remote: &SyncEntity) -> CoreResult<()> {
    if local.kind() != remote.kind() {
        return Err(CoreError::KindMismatch {
            local: local.kind(),
            remote: remote.kind(),
        });
    }
    if local.id() != remote.id() {
        return Err(CoreError::IdentityMismatch {
            local: local.id(),
            remote: remote.id(),
        });
    }
    Ok(())
}

/// Reconciles an incoming remote version with the local copy.
pub fn merge_entities(
    local: &SyncEntity,
    remote: &SyncEntity,
    ctx: &MergeContext,
) -> CoreResult<MergeOutcome> {
    check_identity(local, remote)?;

    let (merged, changed_fields) = match (local, remote) {
        (SyncEntity::Conversation(l), SyncEntity::Conversation(r)) => {
            (SyncEntity::Conversation(merge_conversations(l, r)), Vec::new())
        }
        (SyncEntity::Message(l), SyncEntity::Message(r)) => {
            (SyncEntity::Message(merge_messages(l, r)), Vec::new())
        }
        (SyncEntity::KnowledgeItem(l), SyncEntity::KnowledgeItem(r)) => {
            (SyncEntity::KnowledgeItem(merge_knowledge_items(l, r)), Vec::new())
        }
        (SyncEntity::Project(l), SyncEntity::Project(r)) => {
            (SyncEntity::Project(merge_projects(l, r)), Vec::new())
        }
        (SyncEntity::Settings(l), SyncEntity::Settings(r)) => {
            if !settings_in_scope(r, ctx.local_device_class) {
                return Ok(MergeOutcome {
                    merged: local.clone(),
                    local_changed: false,
                    remote_stale: false,
                    changed_fields: Vec::new(),
                });
            }
            let applied = apply_remote_settings(l, r, ctx.last_settings_sync);
            let changed = !applied.changed_fields.is_empty();
            return Ok(MergeOutcome {
                merged: SyncEntity::Settings(applied.merged),
                local_changed: changed,
                remote_stale: false,
                changed_fields: applied.changed_fields,
            });
        }
        _ => unreachable!("kinds checked above"),
    };

    Ok(MergeOutcome {
        local_changed: merged != *local,
        remote_stale: merged != *remote,
        merged,
        changed_fields,
    })
}

/// Produces the version to retry after the store rejected `ours` in favour
/// of `server`.
pub fn resolve_push_conflict(
    ours: &SyncEntity,
    server: &SyncEntity,
    ctx: &MergeContext,
) -> CoreResult<SyncEntity> {
    check_identity(ours, server)?;
    match (ours, server) {
        (SyncEntity::Settings(o), SyncEntity::Settings(s)) => {
            Ok(SyncEntity::Settings(rebase_settings(o, s)))
        }
        _ => merge_entities(ours, server, ctx).map(|outcome| outcome.merged),
    }
}

/// Settings tagged for another device class are not applied here.
pub fn settings_in_scope(settings: &Settings, local_class: Option<DeviceClass>) -> bool {
    match (settings.device_class, local_class) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => true,
    }
}
