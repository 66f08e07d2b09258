//! Room membership index: document ↔ user subscriptions.
//!
//! DESIGN
//! ======
//! Two mirrored maps give O(1) lookup in both directions. They are only
//! mutated through the paired methods below, so a pair present in one map
//! is always present in the other, and empty sets are pruned on removal.
//! The connection registry owns the only instance and wraps it in its lock.

use std::collections::{HashMap, HashSet};

use crate::ids::{DocumentId, UserId};

#[derive(Debug, Default)]
pub struct RoomIndex {
    by_document: HashMap<DocumentId, HashSet<UserId>>,
    by_user: HashMap<UserId, HashSet<DocumentId>>,
}

impl RoomIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the pair. Returns false if it was already present.
    pub fn join(&mut self, user_id: &UserId, document_id: &DocumentId) -> bool {
        let added = self
            .by_document
            .entry(document_id.clone())
            .or_default()
            .insert(user_id.clone());
        self.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(document_id.clone());
        added
    }

    /// Remove the pair. Returns false if it was not present.
    pub fn leave(&mut self, user_id: &UserId, document_id: &DocumentId) -> bool {
        let removed = remove_pair(&mut self.by_document, document_id, user_id);
        remove_pair(&mut self.by_user, user_id, document_id);
        removed
    }

    /// Remove every pair for a user and return the rooms they were in.
    pub fn remove_user(&mut self, user_id: &UserId) -> Vec<DocumentId> {
        let Some(rooms) = self.by_user.remove(user_id) else {
            return Vec::new();
        };
        for document_id in &rooms {
            remove_pair(&mut self.by_document, document_id, user_id);
        }
        let mut rooms: Vec<_> = rooms.into_iter().collect();
        rooms.sort();
        rooms
    }

    #[must_use]
    pub fn members_of(&self, document_id: &DocumentId) -> HashSet<UserId> {
        self.by_document.get(document_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn rooms_of(&self, user_id: &UserId) -> HashSet<DocumentId> {
        self.by_user.get(user_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        self.by_document
            .get(document_id)
            .is_some_and(|members| members.contains(user_id))
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.by_document.len()
    }
}

fn remove_pair<K, V>(map: &mut HashMap<K, HashSet<V>>, key: &K, value: &V) -> bool
where
    K: std::hash::Hash + Eq,
    V: std::hash::Hash + Eq,
{
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}
