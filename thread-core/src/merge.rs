//! Delta reconciliation.
//!
//! Each function applies one change to a [`Snapshot`] and reports what
//! happened. Nothing here fails: a change that does not fit the snapshot is
//! reported as [`MergeOutcome::Ignored`] and leaves it untouched.

use threadsync_types::{Message, MessageId, SetChange, Timestamp, UserId};

use crate::snapshot::Snapshot;

/// One decrypted change to a conversation's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// A message was posted.
    Created(Message),
    /// A message body was replaced.
    Edited {
        /// Target message.
        id: MessageId,
        /// New plaintext, or the undecryptable placeholder.
        content: String,
        /// Time of the edit.
        edited_at: Timestamp,
        /// The new body could not be decrypted.
        decrypt_failed: bool,
    },
    /// A message was deleted.
    Deleted(MessageId),
    /// A reaction was added or removed.
    Reaction {
        /// Target message.
        id: MessageId,
        /// Reaction emoji.
        emoji: String,
        /// Reacting user.
        user_id: UserId,
        /// Added or removed.
        change: SetChange,
    },
    /// A read receipt was added or removed.
    ReadReceipt {
        /// Target message.
        id: MessageId,
        /// Reader.
        user_id: UserId,
        /// Added or removed.
        change: SetChange,
    },
}

/// Why a delta left the snapshot untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The target message is not loaded.
    UnknownMessage,
    /// The message belongs to another conversation.
    WrongConversation,
    /// The target is already a tombstone.
    AlreadyDeleted,
    /// The edit is older than the current content.
    StaleEdit,
}

/// Result of applying one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new message was added.
    Inserted,
    /// The change was already reflected.
    Duplicate,
    /// A server message replaced the pending local message `local_id`.
    Confirmed {
        /// Id of the replaced optimistic message.
        local_id: MessageId,
    },
    /// A message changed in place.
    Updated,
    /// A deleted message stays as a tombstone for its replies.
    Tombstoned,
    /// A deleted message left the snapshot.
    Removed,
    /// Nothing changed.
    Ignored(IgnoreReason),
}

impl MergeOutcome {
    /// True if the snapshot changed.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Duplicate | Self::Ignored(_))
    }

    /// True if the tree shape may have changed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Inserted | Self::Confirmed { .. } | Self::Tombstoned | Self::Removed
        )
    }
}

/// Apply one delta.
pub fn apply(snapshot: &mut Snapshot, delta: Delta) -> MergeOutcome {
    match delta {
        Delta::Created(message) => insert(snapshot, message),
        Delta::Edited {
            id,
            content,
            edited_at,
            decrypt_failed,
        } => edit(snapshot, &id, content, edited_at, decrypt_failed),
        Delta::Deleted(id) => delete(snapshot, &id),
        Delta::Reaction {
            id,
            emoji,
            user_id,
            change,
        } => {
            let Some(message) = live_message(snapshot, &id) else {
                return ignored(snapshot, &id);
            };
            let changed = match change {
                SetChange::Added => message.reactions.entry(emoji).or_default().insert(user_id),
                SetChange::Removed => {
                    let removed = message
                        .reactions
                        .get_mut(&emoji)
                        .is_some_and(|users| users.remove(&user_id));
                    if message.reactions.get(&emoji).is_some_and(|u| u.is_empty()) {
                        message.reactions.remove(&emoji);
                    }
                    removed
                }
            };
            updated_if(changed)
        }
        Delta::ReadReceipt {
            id,
            user_id,
            change,
        } => {
            let Some(message) = live_message(snapshot, &id) else {
                return ignored(snapshot, &id);
            };
            let changed = match change {
                SetChange::Added => message.read_by.insert(user_id),
                SetChange::Removed => message.read_by.remove(&user_id),
            };
            updated_if(changed)
        }
    }
}

fn insert(snapshot: &mut Snapshot, message: Message) -> MergeOutcome {
    if message.conversation_id != *snapshot.conversation_id() {
        return MergeOutcome::Ignored(IgnoreReason::WrongConversation);
    }
    if snapshot.messages.contains_key(&message.id) {
        return MergeOutcome::Duplicate;
    }
    let matched = if message.is_pending() {
        None
    } else {
        find_pending_match(snapshot, &message)
    };
    match matched {
        Some(local_id) => {
            snapshot.messages.remove(&local_id);
            reparent(snapshot, &local_id, &message.id);
            snapshot.messages.insert(message.id.clone(), message);
            snapshot.rebuild();
            MergeOutcome::Confirmed { local_id }
        }
        None => {
            snapshot.messages.insert(message.id.clone(), message);
            snapshot.rebuild();
            MergeOutcome::Inserted
        }
    }
}

fn edit(
    snapshot: &mut Snapshot,
    id: &MessageId,
    content: String,
    edited_at: Timestamp,
    decrypt_failed: bool,
) -> MergeOutcome {
    let Some(message) = live_message(snapshot, id) else {
        return ignored(snapshot, id);
    };
    if message.edited_at.is_some_and(|current| current > edited_at) {
        return MergeOutcome::Ignored(IgnoreReason::StaleEdit);
    }
    if message.edited_at == Some(edited_at) && message.content == content {
        return MergeOutcome::Duplicate;
    }
    message.content = content;
    message.edited_at = Some(edited_at);
    message.decrypt_failed = decrypt_failed;
    MergeOutcome::Updated
}

fn delete(snapshot: &mut Snapshot, id: &MessageId) -> MergeOutcome {
    if live_message(snapshot, id).is_none() {
        return ignored(snapshot, id);
    }
    let outcome = if snapshot.tree().children_of(id).is_empty() {
        snapshot.messages.remove(id);
        MergeOutcome::Removed
    } else {
        if let Some(message) = snapshot.messages.get_mut(id) {
            message.deleted = true;
            message.content.clear();
        }
        MergeOutcome::Tombstoned
    };
    snapshot.rebuild();
    outcome
}

/// Merge a page of older history in one pass.
///
/// Already-loaded ids are skipped. Returns how many messages were new.
pub fn merge_page(snapshot: &mut Snapshot, messages: Vec<Message>) -> usize {
    let mut inserted = 0;
    for message in messages {
        if message.conversation_id != *snapshot.conversation_id() {
            continue;
        }
        snapshot.lower_floor(&message);
        if !snapshot.messages.contains_key(&message.id) {
            snapshot.messages.insert(message.id.clone(), message);
            inserted += 1;
        }
    }
    snapshot.rebuild();
    inserted
}

/// Replace the optimistic message `local_id` with the server's copy.
///
/// Converges whether the server response or the channel echo arrives first.
pub fn confirm_pending(
    snapshot: &mut Snapshot,
    local_id: &MessageId,
    confirmed: Message,
) -> MergeOutcome {
    let had_local = snapshot.messages.remove(local_id).is_some();
    if had_local {
        reparent(snapshot, local_id, &confirmed.id);
    }
    let outcome = match (had_local, snapshot.messages.contains_key(&confirmed.id)) {
        (true, _) => MergeOutcome::Confirmed {
            local_id: local_id.clone(),
        },
        (false, true) => MergeOutcome::Duplicate,
        (false, false) => MergeOutcome::Inserted,
    };
    snapshot
        .messages
        .entry(confirmed.id.clone())
        .or_insert(confirmed);
    snapshot.rebuild();
    outcome
}

/// Drop an optimistic message whose send failed.
pub fn discard_local(snapshot: &mut Snapshot, local_id: &MessageId) -> bool {
    let removed = snapshot
        .messages
        .get(local_id)
        .is_some_and(Message::is_pending);
    if removed {
        snapshot.messages.remove(local_id);
        snapshot.rebuild();
    }
    removed
}

/// Put back a copy of a message taken before a failed optimistic change.
pub fn restore(snapshot: &mut Snapshot, message: Message) -> MergeOutcome {
    let outcome = match snapshot.messages.get(&message.id) {
        Some(current) if *current == message => MergeOutcome::Duplicate,
        Some(_) => MergeOutcome::Updated,
        None => MergeOutcome::Inserted,
    };
    snapshot.messages.insert(message.id.clone(), message);
    snapshot.rebuild();
    outcome
}

/// Copy still-pending optimistic messages from `previous` into a freshly
/// loaded snapshot, unless the fresh page already contains their echo.
///
/// Returns how many were carried over.
pub fn carry_pending(previous: &Snapshot, fresh: &mut Snapshot) -> usize {
    let mut carried = 0;
    for local in previous.pending() {
        if fresh.messages.contains_key(&local.id) || find_confirmed_match(fresh, local) {
            continue;
        }
        fresh.messages.insert(local.id.clone(), local.clone());
        carried += 1;
    }
    if carried > 0 {
        fresh.rebuild();
    }
    carried
}

/// Find the pending message a server message confirms.
///
/// Matches on the send token when the server echoes it, otherwise on
/// author, parent and content. The oldest candidate wins.
fn find_pending_match(snapshot: &Snapshot, incoming: &Message) -> Option<MessageId> {
    snapshot
        .pending()
        .into_iter()
        .find(|local| same_send(local, incoming))
        .map(|local| local.id.clone())
}

fn find_confirmed_match(snapshot: &Snapshot, local: &Message) -> bool {
    snapshot
        .messages
        .values()
        .any(|m| !m.is_pending() && same_send(local, m))
}

fn same_send(local: &Message, confirmed: &Message) -> bool {
    match confirmed.client_id {
        Some(client_id) => local.client_id == Some(client_id),
        None => {
            local.author_id == confirmed.author_id
                && local.parent_id == confirmed.parent_id
                && local.content == confirmed.content
        }
    }
}

fn reparent(snapshot: &mut Snapshot, from: &MessageId, to: &MessageId) {
    for message in snapshot.messages.values_mut() {
        if message.parent_id.as_ref() == Some(from) {
            message.parent_id = Some(to.clone());
        }
    }
}

fn live_message<'a>(snapshot: &'a mut Snapshot, id: &MessageId) -> Option<&'a mut Message> {
    snapshot.messages.get_mut(id).filter(|m| !m.deleted)
}

fn ignored(snapshot: &Snapshot, id: &MessageId) -> MergeOutcome {
    if snapshot.messages.contains_key(id) {
        MergeOutcome::Ignored(IgnoreReason::AlreadyDeleted)
    } else {
        MergeOutcome::Ignored(IgnoreReason::UnknownMessage)
    }
}

fn updated_if(changed: bool) -> MergeOutcome {
    if changed {
        MergeOutcome::Updated
    } else {
        MergeOutcome::Duplicate
    }
}
