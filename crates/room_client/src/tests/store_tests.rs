use super::*;
use crate::types::MessageBody;
use chrono::TimeZone;
use proptest::prelude::*;
use shared::domain::Participant;

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, second).unwrap()
}

fn remote(id: &str, second: u32) -> Message {
    Message {
        id: MessageId::from(id),
        author_id: UserId::from("bob"),
        author_name: "Bob".into(),
        body: MessageBody::Text(format!("text of {id}")),
        created_at: at(second),
        origin: Origin::Remote,
        local_ref: None,
    }
}

fn pending(seq: u64, text: &str) -> (LocalRef, Message) {
    let local_ref = LocalRef::new(seq);
    let message = Message::local_pending(
        local_ref,
        &Participant::new("alice", "Alice"),
        MessageBody::Text(text.into()),
        at(59),
    );
    (local_ref, message)
}

fn server_copy(id: &str, second: u32, text: &str) -> Message {
    Message {
        id: MessageId::from(id),
        author_id: UserId::from("alice"),
        author_name: "Alice".into(),
        body: MessageBody::Text(text.into()),
        created_at: at(second),
        origin: Origin::Remote,
        local_ref: None,
    }
}

fn ids(store: &MessageStore) -> Vec<String> {
    store.iter().map(|m| m.id.to_string()).collect()
}

fn store() -> MessageStore {
    MessageStore::new(UserId::from("alice"))
}

#[test]
fn duplicate_message_new_is_ignored() {
    let mut store = store();
    assert!(store.apply_new(remote("m1", 1)));
    assert!(!store.apply_new(remote("m1", 1)));
    assert_eq!(ids(&store), vec!["m1"]);
}

#[test]
fn settled_messages_order_by_timestamp_then_id() {
    let mut store = store();
    store.apply_new(remote("b", 5));
    store.apply_new(remote("a", 5));
    store.apply_new(remote("z", 1));
    assert_eq!(ids(&store), vec!["z", "a", "b"]);
}

#[test]
fn delete_is_idempotent_and_absent_ids_are_a_no_op() {
    let mut store = store();
    store.apply_new(remote("m7", 1));
    assert!(!store.apply_deleted(&MessageId::from("nope")));
    assert!(store.apply_deleted(&MessageId::from("m7")));
    assert!(!store.apply_deleted(&MessageId::from("m7")));
    assert!(store.is_empty());
}

#[test]
fn tombstoned_id_is_not_resurrected_by_late_broadcast_or_history() {
    let mut store = store();
    store.apply_new(remote("m7", 1));
    assert!(store.apply_deleted(&MessageId::from("m7")));
    assert!(!store.apply_new(remote("m7", 1)));
    store.apply_history(vec![remote("m6", 0), remote("m7", 1)]);
    assert_eq!(ids(&store), vec!["m6"]);
}

#[test]
fn history_replaces_settled_entries_but_keeps_local_ones() {
    let mut store = store();
    store.apply_new(remote("old", 1));
    let (_, local) = pending(1, "draft");
    store.append_local_pending(local);

    assert!(store.apply_history(vec![remote("h0", 2), remote("h1", 3)]));
    assert_eq!(store.len(), 3);
    let ids = ids(&store);
    assert_eq!(&ids[..2], ["h0", "h1"]);
    assert!(ids[2].starts_with("local-"));

    assert!(!store.apply_history(vec![remote("h0", 2), remote("h1", 3)]));
}

#[test]
fn history_keeps_confirmed_copy_of_known_message() {
    let mut store = store();
    let (local_ref, local) = pending(1, "hi");
    store.append_local_pending(local);
    store.mark_confirmed(local_ref, server_copy("s1", 4, "hi"));

    assert!(!store.apply_history(vec![server_copy("s1", 4, "hi")]));
    let kept = store.get(&MessageId::from("s1")).expect("kept");
    assert_eq!(kept.origin, Origin::Confirmed);
    assert_eq!(kept.local_ref, Some(local_ref));
}

#[test]
fn pending_messages_follow_settled_ones_in_submission_order() {
    let mut store = store();
    let (first, m1) = pending(1, "first");
    let (second, m2) = pending(2, "second");
    store.append_local_pending(m1);
    store.append_local_pending(m2);
    store.apply_new(remote("r1", 30));

    // second acknowledged before first: first stays pending after the settled block
    assert!(store.mark_confirmed(second, server_copy("s2", 40, "second")));
    let order: Vec<_> = store.iter().map(|m| (m.id.to_string(), m.origin)).collect();
    assert_eq!(order[0], ("r1".to_string(), Origin::Remote));
    assert_eq!(order[1], ("s2".to_string(), Origin::Confirmed));
    assert_eq!(order[2].1, Origin::LocalPending);
    assert_eq!(store.pending_refs(), vec![first]);
}

#[test]
fn ack_after_broadcast_echo_does_not_duplicate() {
    let mut store = store();
    let (local_ref, local) = pending(1, "hello");
    store.append_local_pending(local);
    store.apply_new(server_copy("s1", 3, "hello"));
    assert_eq!(store.len(), 2);

    assert!(store.mark_confirmed(local_ref, server_copy("s1", 3, "hello")));
    assert_eq!(ids(&store), vec!["s1"]);
    assert!(!store.mark_confirmed(local_ref, server_copy("s1", 3, "hello")));
    assert!(!store.apply_new(server_copy("s1", 3, "hello")));
    assert_eq!(store.len(), 1);
}

#[test]
fn failed_message_stays_visible_and_can_be_retried_or_discarded() {
    let mut store = store();
    let (local_ref, local) = pending(1, "oops");
    store.append_local_pending(local);

    assert!(store.mark_failed(local_ref));
    assert!(!store.mark_failed(local_ref));
    assert_eq!(store.len(), 1);
    assert!(store.pending_refs().is_empty());

    assert!(store.mark_pending(local_ref));
    assert!(store.discard(local_ref).is_none(), "pending entries are not discardable");
    store.mark_failed(local_ref);
    assert!(store.discard(local_ref).is_some());
    assert!(store.is_empty());
}

#[test]
fn own_message_detection_compares_author_ids() {
    let store = store();
    assert!(store.is_own(&server_copy("s1", 1, "mine")));
    assert!(!store.is_own(&remote("r1", 1)));
}

#[test]
fn confirming_a_deleted_echo_drops_the_local_entry() {
    let mut store = store();
    let (local_ref, local) = pending(1, "gone");
    store.append_local_pending(local);
    store.apply_new(server_copy("s1", 1, "gone"));
    assert!(store.apply_deleted(&MessageId::from("s1")));

    assert!(store.mark_confirmed(local_ref, server_copy("s1", 1, "gone")));
    assert!(store.is_empty());
}

#[test]
fn deleting_an_unseen_id_leaves_no_tombstone() {
    let mut store = store();
    assert!(!store.apply_deleted(&MessageId::from("m9")));
    assert!(store.tombstones.is_empty());

    assert!(store.apply_new(remote("m9", 4)));
    assert_eq!(ids(&store), vec!["m9"]);
}

#[derive(Debug, Clone)]
enum Delivery {
    New(u8),
    History(Vec<u8>),
}

fn delivery() -> impl Strategy<Value = Delivery> {
    prop_oneof![
        (0u8..12).prop_map(Delivery::New),
        prop::collection::vec(0u8..12, 0..10).prop_map(Delivery::History),
    ]
}

proptest! {
    #[test]
    fn store_length_matches_distinct_ids(deliveries in prop::collection::vec(delivery(), 1..40)) {
        let mut store = store();
        let mut expected = std::collections::BTreeSet::new();
        for delivery in deliveries {
            match delivery {
                Delivery::New(n) => {
                    store.apply_new(remote(&format!("m{n}"), u32::from(n)));
                    expected.insert(n);
                }
                Delivery::History(batch) => {
                    store.apply_history(
                        batch.iter().map(|n| remote(&format!("m{n}"), u32::from(*n))).collect(),
                    );
                    expected = batch.into_iter().collect();
                }
            }
        }
        prop_assert_eq!(store.len(), expected.len());
    }
}
