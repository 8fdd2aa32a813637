use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, UserId};

use crate::types::{LocalRef, Message, Origin};

type SettledKey = (DateTime<Utc>, MessageId);

#[derive(Debug, Clone)]
pub struct MessageStore {
    owner: UserId,
    settled: BTreeMap<SettledKey, Message>,
    settled_index: HashMap<MessageId, DateTime<Utc>>,
    local: BTreeMap<u64, Message>,
    tombstones: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            settled: BTreeMap::new(),
            settled_index: HashMap::new(),
            local: BTreeMap::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn apply_history(&mut self, batch: Vec<Message>) -> bool {
        let mut settled = BTreeMap::new();
        let mut settled_index = HashMap::new();
        for message in batch {
            if self.tombstones.contains(&message.id) || settled_index.contains_key(&message.id) {
                continue;
            }
            let message = match self.settled_index.get(&message.id) {
                Some(at) => match self.settled.get(&(*at, message.id.clone())) {
                    Some(existing) => existing.clone(),
                    None => message,
                },
                None => message,
            };
            settled_index.insert(message.id.clone(), message.created_at);
            settled.insert((message.created_at, message.id.clone()), message);
        }

        let changed = settled != self.settled;
        self.settled = settled;
        self.settled_index = settled_index;
        changed
    }

    pub fn apply_new(&mut self, message: Message) -> bool {
        if self.tombstones.contains(&message.id) || self.settled_index.contains_key(&message.id) {
            return false;
        }
        self.insert_settled(message);
        true
    }

    pub fn apply_deleted(&mut self, id: &MessageId) -> bool {
        if self.remove_settled(id).is_none() {
            return false;
        }
        self.tombstones.insert(id.clone());
        true
    }

    pub fn append_local_pending(&mut self, message: Message) -> bool {
        let Some(local_ref) = message.local_ref else {
            return false;
        };
        if self.local.contains_key(&local_ref.seq) {
            return false;
        }
        self.local.insert(local_ref.seq, message);
        true
    }

    /// Settles a local message with the fields the server acknowledged. If the
    /// broadcast echo of the same message already arrived, the echo is taken
    /// over instead of duplicated.
    pub fn mark_confirmed(&mut self, local_ref: LocalRef, server: Message) -> bool {
        if self.local_entry(local_ref).is_none() {
            return false;
        }
        self.local.remove(&local_ref.seq);

        if self.tombstones.contains(&server.id) {
            return true;
        }
        let confirmed = match self.remove_settled(&server.id) {
            Some(echo) => echo,
            None => server,
        };
        self.insert_settled(Message {
            origin: Origin::Confirmed,
            local_ref: Some(local_ref),
            ..confirmed
        });
        true
    }

    pub fn mark_failed(&mut self, local_ref: LocalRef) -> bool {
        self.set_local_origin(local_ref, Origin::LocalPending, Origin::Failed)
    }

    pub fn mark_pending(&mut self, local_ref: LocalRef) -> bool {
        self.set_local_origin(local_ref, Origin::Failed, Origin::LocalPending)
    }

    pub fn discard(&mut self, local_ref: LocalRef) -> Option<Message> {
        match self.local_entry(local_ref) {
            Some(message) if message.origin == Origin::Failed => self.local.remove(&local_ref.seq),
            _ => None,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if let Some(at) = self.settled_index.get(id) {
            return self.settled.get(&(*at, id.clone()));
        }
        self.local.values().find(|message| &message.id == id)
    }

    pub fn local_entry(&self, local_ref: LocalRef) -> Option<&Message> {
        self.local
            .get(&local_ref.seq)
            .filter(|message| message.local_ref == Some(local_ref))
    }

    pub fn pending_refs(&self) -> Vec<LocalRef> {
        self.local
            .values()
            .filter(|message| message.origin == Origin::LocalPending)
            .filter_map(|message| message.local_ref)
            .collect()
    }

    pub fn is_own(&self, message: &Message) -> bool {
        message.is_authored_by(&self.owner)
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.settled.values().chain(self.local.values())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.settled.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_settled(&mut self, message: Message) {
        self.settled_index
            .insert(message.id.clone(), message.created_at);
        self.settled
            .insert((message.created_at, message.id.clone()), message);
    }

    fn remove_settled(&mut self, id: &MessageId) -> Option<Message> {
        let at = self.settled_index.remove(id)?;
        self.settled.remove(&(at, id.clone()))
    }

    fn set_local_origin(&mut self, local_ref: LocalRef, from: Origin, to: Origin) -> bool {
        match self.local.get_mut(&local_ref.seq) {
            Some(message) if message.local_ref == Some(local_ref) && message.origin == from => {
                message.origin = to;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
