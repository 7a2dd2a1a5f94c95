//! Per-conversation view model.
//!
//! A [`Snapshot`] owns the flat message map plus the derived tree and
//! chronological index. Every structural change ends with
//! [`Snapshot::rebuild`], which re-derives both from scratch and drops
//! deleted messages the tree no longer places, so the flat map and the tree
//! always cover exactly the same ids.

use std::collections::{BTreeMap, HashMap};
use threadsync_types::{
    Conversation, ConversationId, EncryptedPayload, Message, MessageId, Timestamp,
};

use crate::chrono::ChronoIndex;
use crate::tree::{ThreadNode, ThreadTree};

/// Backward-paging cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    /// The server holds messages older than the loaded window.
    pub has_more: bool,
    /// Oldest confirmed message the loaded window reaches back to.
    pub oldest_loaded_id: Option<MessageId>,
}

/// The current view of one conversation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Conversation metadata.
    pub conversation: Conversation,
    /// Paging cursor.
    pub pagination: Pagination,
    pub(crate) messages: HashMap<MessageId, Message>,
    tree: ThreadTree,
    chrono: ChronoIndex,
    floor: Option<(Timestamp, MessageId)>,
    undecryptable: BTreeMap<MessageId, EncryptedPayload>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            pagination: Pagination::default(),
            messages: HashMap::new(),
            tree: ThreadTree::default(),
            chrono: ChronoIndex::default(),
            floor: None,
            undecryptable: BTreeMap::new(),
        }
    }

    /// A snapshot holding one freshly fetched page.
    pub fn from_messages(conversation: Conversation, messages: Vec<Message>, has_more: bool) -> Self {
        let mut snapshot = Self::new(conversation);
        for message in messages {
            snapshot.lower_floor(&message);
            snapshot.messages.insert(message.id.clone(), message);
        }
        snapshot.pagination.has_more = has_more;
        snapshot.rebuild();
        snapshot
    }

    /// Re-derive the tree and chronological index after a structural change.
    pub fn rebuild(&mut self) {
        self.tree = ThreadTree::build(self.messages.values());
        let tree = &self.tree;
        self.messages.retain(|id, _| tree.contains(id));
        self.chrono = ChronoIndex::assign(&mut self.messages);
        self.undecryptable
            .retain(|id, _| self.messages.contains_key(id));

        let oldest_confirmed = self
            .chrono
            .ids()
            .iter()
            .filter_map(|id| self.messages.get(id))
            .find(|m| !m.is_pending())
            .cloned();
        if let Some(message) = oldest_confirmed {
            self.lower_floor(&message);
        }
        self.pagination.oldest_loaded_id = self.floor.as_ref().map(|(_, id)| id.clone());
    }

    /// Move the paging cursor back to `message` if it is older.
    ///
    /// The cursor never moves forward, so pruning a deleted oldest message
    /// does not make the next page re-fetch what was already seen.
    pub(crate) fn lower_floor(&mut self, message: &Message) {
        if message.is_pending() {
            return;
        }
        let candidate = (message.created_at, message.id.clone());
        match &self.floor {
            Some(current) if *current <= candidate => {}
            _ => self.floor = Some(candidate),
        }
    }

    /// Conversation id.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation.id
    }

    /// Flat message map.
    pub fn messages(&self) -> &HashMap<MessageId, Message> {
        &self.messages
    }

    /// Look up one message.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// True if `id` is loaded.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Number of loaded messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Reply tree.
    pub fn tree(&self) -> &ThreadTree {
        &self.tree
    }

    /// Materialized reply tree.
    pub fn thread(&self) -> Vec<ThreadNode> {
        self.tree.nodes()
    }

    /// Chronological index.
    pub fn chrono(&self) -> &ChronoIndex {
        &self.chrono
    }

    /// Messages oldest first.
    pub fn chronological(&self) -> Vec<&Message> {
        self.chrono
            .ids()
            .iter()
            .filter_map(|id| self.messages.get(id))
            .collect()
    }

    /// Optimistic messages still awaiting confirmation.
    pub fn pending(&self) -> Vec<&Message> {
        self.chronological()
            .into_iter()
            .filter(|m| m.is_pending())
            .collect()
    }

    /// Record a payload that failed to decrypt so it can be retried.
    pub fn mark_undecryptable(&mut self, id: MessageId, payload: EncryptedPayload) {
        self.undecryptable.insert(id, payload);
    }

    /// Payloads awaiting a decryption retry.
    pub fn undecryptable(&self) -> &BTreeMap<MessageId, EncryptedPayload> {
        &self.undecryptable
    }

    /// Replace the placeholder of a message whose payload now decrypts.
    ///
    /// Returns false if the message is no longer loaded.
    pub fn resolve_undecryptable(&mut self, id: &MessageId, content: String) -> bool {
        self.undecryptable.remove(id);
        match self.messages.get_mut(id) {
            Some(message) => {
                message.content = content;
                message.decrypt_failed = false;
                true
            }
            None => false,
        }
    }
}

/// Explicit keyed cache of snapshots, one per conversation.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<ConversationId, Snapshot>,
}

impl SnapshotStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for `id`.
    pub fn get(&self, id: &ConversationId) -> Option<&Snapshot> {
        self.snapshots.get(id)
    }

    /// Mutable snapshot for `id`.
    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Snapshot> {
        self.snapshots.get_mut(id)
    }

    /// Insert or wholesale-replace the snapshot of its conversation.
    ///
    /// Returns the replaced snapshot.
    pub fn insert(&mut self, snapshot: Snapshot) -> Option<Snapshot> {
        self.snapshots
            .insert(snapshot.conversation_id().clone(), snapshot)
    }

    /// Discard the snapshot for `id`.
    pub fn remove(&mut self, id: &ConversationId) -> Option<Snapshot> {
        self.snapshots.remove(id)
    }

    /// True if a snapshot is cached for `id`.
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.snapshots.contains_key(id)
    }

    /// Cached conversation ids.
    pub fn conversation_ids(&self) -> Vec<&ConversationId> {
        self.snapshots.keys().collect()
    }

    /// Every cached snapshot, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Snapshot> {
        self.snapshots.values_mut()
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{conversation, deleted, msg, pending, snapshot};

    #[test]
    fn from_messages_derives_tree_and_index() {
        let snap = snapshot(
            vec![
                msg("1", None, 10),
                msg("2", Some("1"), 20),
                msg("3", Some("99"), 15),
            ],
            true,
        );
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.tree().root_ids().len(), 2);
        assert_eq!(snap.get(&MessageId::new("2")).unwrap().chrono_index, 2);
        assert_eq!(snap.pagination.oldest_loaded_id, Some(MessageId::new("1")));
        assert!(snap.pagination.has_more);
    }

    #[test]
    fn rebuild_drops_unplaced_tombstones() {
        let snap = snapshot(vec![msg("1", None, 10), deleted("2", Some("1"), 20)], false);
        assert!(!snap.contains(&MessageId::new("2")));
        assert_eq!(snap.len(), snap.tree().len());
    }

    #[test]
    fn cursor_skips_pending_messages() {
        let snap = snapshot(vec![pending("draft", None, 1), msg("1", None, 10)], false);
        assert_eq!(snap.pagination.oldest_loaded_id, Some(MessageId::new("1")));
        assert_eq!(snap.pending().len(), 1);
    }

    #[test]
    fn cursor_never_moves_forward() {
        let snap = snapshot(vec![deleted("0", None, 1), msg("1", None, 10)], true);
        assert!(!snap.contains(&MessageId::new("0")));
        assert_eq!(snap.pagination.oldest_loaded_id, Some(MessageId::new("0")));
    }

    #[test]
    fn chronological_is_oldest_first() {
        let snap = snapshot(vec![msg("b", None, 2), msg("a", None, 1)], false);
        let order: Vec<&str> = snap.chronological().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn resolve_undecryptable_clears_flag() {
        let mut broken = msg("1", None, 1);
        broken.decrypt_failed = true;
        let mut snap = snapshot(vec![broken], false);
        snap.mark_undecryptable(
            MessageId::new("1"),
            EncryptedPayload {
                ciphertext: "AA==".into(),
                nonce: "AA==".into(),
                key_version: 1,
            },
        );

        assert!(snap.resolve_undecryptable(&MessageId::new("1"), "hello".into()));
        let message = snap.get(&MessageId::new("1")).unwrap();
        assert_eq!(message.content, "hello");
        assert!(!message.decrypt_failed);
        assert!(snap.undecryptable().is_empty());
    }

    #[test]
    fn store_replaces_wholesale() {
        let mut store = SnapshotStore::new();
        assert!(store.insert(snapshot(vec![msg("1", None, 1)], false)).is_none());
        let replaced = store.insert(Snapshot::new(conversation()));
        assert_eq!(replaced.map(|s| s.len()), Some(1));
        assert_eq!(store.len(), 1);
        assert!(store.get(&conversation().id).unwrap().is_empty());
    }
}
