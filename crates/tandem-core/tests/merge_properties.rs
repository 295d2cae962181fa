//! Property-based tests for conversation and LWW merging
//!
//! Invariants checked for arbitrary histories:
//! - Union merge keeps every message exactly once, in timestamp order
//! - Merge is commutative and idempotent, including when both sides edited
//!   the same messages and scalars differently
//! - LWW always yields the version with the later timestamp
//!
//! Run with: cargo test -p tandem-core --test merge_properties

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use tandem_core::merge::{merge_conversations, merge_knowledge_items, merge_projects};
use tandem_core::{Conversation, KnowledgeItem, Message, MessageRole, Project, ZoneId};

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Builds a conversation holding one message per (offset, content) pair.
fn conversation_with(base: &Conversation, messages: &[(i64, String)]) -> Conversation {
    let mut convo = base.clone();
    for (offset, content) in messages {
        let at = epoch() + Duration::seconds(*offset);
        let message = Message::new(base, MessageRole::User, content.clone(), at);
        convo.append_message(message);
    }
    convo
}

fn message_strategy() -> impl Strategy<Value = Vec<(i64, String)>> {
    prop::collection::vec((0i64..10_000, "[a-z ]{1,12}"), 0..12)
}

/// One message as each side last saw it: (offset, content) per side.
type Diverged = ((i64, String), (i64, String));

fn diverged_strategy() -> impl Strategy<Value = Vec<Diverged>> {
    let side = || (0i64..50, "[a-z]{1,6}");
    prop::collection::vec((side(), side()), 1..8)
}

/// Builds both sides of a conversation whose messages share ids but carry
/// different timestamps and contents.
fn diverged_pair(
    edits: &[Diverged],
    left_scalars: (i64, &str),
    right_scalars: (i64, &str),
) -> (Conversation, Conversation) {
    let base = Conversation::new(ZoneId::default(), "p", epoch());
    let mut a = base.clone();
    let mut b = base.clone();
    for ((left_at, left_text), (right_at, right_text)) in edits {
        let at = epoch() + Duration::seconds(*left_at);
        let left = Message::new(&base, MessageRole::User, left_text.clone(), at);
        let mut right = left.clone();
        right.content = right_text.clone();
        right.timestamp = epoch() + Duration::seconds(*right_at);
        a.append_message(left);
        b.append_message(right);
    }
    a.title = left_scalars.1.to_string();
    a.modified_at = epoch() + Duration::seconds(left_scalars.0);
    b.title = right_scalars.1.to_string();
    b.modified_at = epoch() + Duration::seconds(right_scalars.0);
    (a, b)
}

proptest! {
    /// Invariant: disjoint histories merge to their union, sorted
    #[test]
    fn union_of_disjoint_histories(left in message_strategy(), right in message_strategy()) {
        let base = Conversation::new(ZoneId::default(), "p", epoch());
        let a = conversation_with(&base, &left);
        let b = conversation_with(&base, &right);

        let merged = merge_conversations(&a, &b);
        prop_assert_eq!(merged.messages.len(), left.len() + right.len());

        let ids: BTreeSet<_> = merged.messages.iter().map(|m| m.id).collect();
        prop_assert_eq!(ids.len(), merged.messages.len());
        prop_assert!(merged.messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    /// Invariant: merge(a, b) == merge(b, a)
    #[test]
    fn commutative(
        shared in message_strategy(),
        left in message_strategy(),
        right in message_strategy(),
    ) {
        let base = Conversation::new(ZoneId::default(), "p", epoch());
        let common = conversation_with(&base, &shared);
        let a = conversation_with(&common, &left);
        let b = conversation_with(&common, &right);

        prop_assert_eq!(merge_conversations(&a, &b), merge_conversations(&b, &a));
    }

    /// Invariant: same id edited on both sides still merges commutatively,
    /// and the copy with the later timestamp survives
    #[test]
    fn commutative_over_diverged_edits(
        edits in diverged_strategy(),
        left_scalars in (0i64..100, "[A-Z][a-z]{0,6}"),
        right_scalars in (0i64..100, "[A-Z][a-z]{0,6}"),
    ) {
        let (a, b) = diverged_pair(
            &edits,
            (left_scalars.0, &left_scalars.1),
            (right_scalars.0, &right_scalars.1),
        );

        let ab = merge_conversations(&a, &b);
        prop_assert_eq!(&ab, &merge_conversations(&b, &a));
        prop_assert_eq!(ab.messages.len(), edits.len());

        for left in &a.messages {
            let kept = ab.messages.iter().find(|m| m.id == left.id);
            let other = b.messages.iter().find(|m| m.id == left.id);
            let (Some(kept), Some(other)) = (kept, other) else {
                return Err(TestCaseError::fail("message id lost in merge"));
            };
            if left.timestamp > other.timestamp {
                prop_assert_eq!(kept, left);
            } else if left.timestamp < other.timestamp {
                prop_assert_eq!(kept, other);
            }
        }

        if a.modified_at != b.modified_at {
            let later = if a.modified_at > b.modified_at { &a } else { &b };
            prop_assert_eq!(&ab.title, &later.title);
        }
        prop_assert_eq!(ab.modified_at, a.modified_at.max(b.modified_at));
    }

    /// Invariant: merge(a, a) == a and merge(merge(a, b), b) == merge(a, b)
    #[test]
    fn idempotent(left in message_strategy(), right in message_strategy()) {
        let base = Conversation::new(ZoneId::default(), "p", epoch());
        let a = conversation_with(&base, &left);
        let b = conversation_with(&base, &right);

        prop_assert_eq!(merge_conversations(&a, &a), a.clone());
        let once = merge_conversations(&a, &b);
        prop_assert_eq!(merge_conversations(&once, &b), once.clone());
    }

    /// Invariant: LWW picks the later stamp, remote on a tie
    #[test]
    fn later_timestamp_wins(local_offset in 0i64..1_000, remote_offset in 0i64..1_000) {
        let mut local = Project::new(ZoneId::default(), "local", epoch());
        let mut remote = local.clone();
        remote.name = "remote".into();
        local.last_modified = epoch() + Duration::seconds(local_offset);
        remote.last_modified = epoch() + Duration::seconds(remote_offset);

        let expected = if local_offset > remote_offset { "local" } else { "remote" };
        prop_assert_eq!(merge_projects(&local, &remote).name, expected);

        let mut item = KnowledgeItem::new(ZoneId::default(), "t", "local", epoch());
        let mut other = item.clone();
        item.revise("local", epoch() + Duration::seconds(local_offset));
        other.revise("remote", epoch() + Duration::seconds(remote_offset));
        prop_assert_eq!(merge_knowledge_items(&item, &other).content, expected);
    }
}

/// Two devices edit offline, then exchange in either order.
#[test]
fn two_device_offline_session_converges() {
    let base = Conversation::new(ZoneId::default(), "Weekend", epoch());

    let mut laptop = base.clone();
    laptop.append_message(
        Message::new(&base, MessageRole::User, "book train", epoch() + Duration::seconds(10))
            .from_device("laptop"),
    );
    laptop.tags.insert("travel".into());

    let mut phone = base.clone();
    phone.append_message(
        Message::new(&base, MessageRole::User, "pack bags", epoch() + Duration::seconds(5))
            .from_device("phone"),
    );
    phone.title = "Weekend trip".into();
    phone.modified_at = epoch() + Duration::seconds(20);

    let on_laptop = merge_conversations(&laptop, &phone);
    let on_phone = merge_conversations(&phone, &laptop);

    assert_eq!(on_laptop, on_phone);
    assert_eq!(on_laptop.title, "Weekend trip");
    let contents: Vec<_> = on_laptop.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["pack bags", "book train"]);
    assert_eq!(
        on_laptop.participating_devices.iter().cloned().collect::<Vec<_>>(),
        vec!["laptop".to_string(), "phone".to_string()]
    );
    assert!(on_laptop.tags.contains("travel"));
}
