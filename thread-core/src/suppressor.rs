//! Echo suppression for the viewer's own round trips.
//!
//! A lease is keyed by message id and action kind. It is held for the whole
//! round trip and lingers for a settle window after release, during which
//! the matching channel echo is swallowed. Events for other messages, or of
//! another kind, are never affected.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use threadsync_types::{ChannelEvent, MessageId};

/// Kind of local action that causes a server round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Posting a message.
    Send,
    /// Editing a message.
    Edit,
    /// Deleting a message.
    Delete,
    /// Toggling a reaction.
    React,
    /// Marking a message read.
    MarkRead,
}

impl ActionKind {
    /// The action kind whose echo `event` would be.
    pub fn for_event(event: &ChannelEvent) -> Option<Self> {
        match event {
            ChannelEvent::Created { .. } => Some(Self::Send),
            ChannelEvent::Edited { .. } => Some(Self::Edit),
            ChannelEvent::Deleted { .. } => Some(Self::Delete),
            ChannelEvent::ReactionChanged { .. } => Some(Self::React),
            ChannelEvent::ReadReceiptChanged { .. } => Some(Self::MarkRead),
            _ => None,
        }
    }
}

/// Proof of a held lease. Hand it back to [`ActionSuppressor::release`].
#[must_use = "a lease that is never released suppresses echoes forever"]
#[derive(Debug, PartialEq, Eq)]
pub struct LeaseToken {
    id: MessageId,
    kind: ActionKind,
}

impl LeaseToken {
    /// Leased message.
    pub fn message_id(&self) -> &MessageId {
        &self.id
    }

    /// Leased action.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holders: u32,
    settle_until: Option<Instant>,
}

impl Lease {
    fn active(&self, now: Instant) -> bool {
        self.holders > 0 || self.settle_until.is_some_and(|until| now < until)
    }
}

/// Table of outstanding leases.
#[derive(Debug, Clone)]
pub struct ActionSuppressor {
    settle: Duration,
    leases: HashMap<(MessageId, ActionKind), Lease>,
}

impl ActionSuppressor {
    /// Create a suppressor with the given settle window.
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            leases: HashMap::new(),
        }
    }

    /// Take a lease before starting a round trip.
    pub fn acquire(&mut self, id: MessageId, kind: ActionKind) -> LeaseToken {
        let lease = self.leases.entry((id.clone(), kind)).or_insert(Lease {
            holders: 0,
            settle_until: None,
        });
        lease.holders += 1;
        lease.settle_until = None;
        LeaseToken { id, kind }
    }

    /// Hand back a lease once its round trip completed.
    ///
    /// The lease keeps suppressing for the settle window.
    pub fn release(&mut self, token: LeaseToken, now: Instant) {
        if let Some(lease) = self.leases.get_mut(&(token.id, token.kind)) {
            lease.holders = lease.holders.saturating_sub(1);
            if lease.holders == 0 {
                lease.settle_until = Some(now + self.settle);
            }
        }
    }

    /// Open a settle-only lease for an id that became known at completion,
    /// such as the server id of a sent message.
    pub fn settle(&mut self, id: MessageId, kind: ActionKind, now: Instant) {
        let lease = self.leases.entry((id, kind)).or_insert(Lease {
            holders: 0,
            settle_until: None,
        });
        if lease.holders == 0 {
            lease.settle_until = Some(now + self.settle);
        }
    }

    /// True if an echo of `kind` on `id` should be swallowed at `now`.
    pub fn suppresses(&mut self, id: &MessageId, kind: ActionKind, now: Instant) -> bool {
        self.purge(now);
        self.leases
            .get(&(id.clone(), kind))
            .is_some_and(|lease| lease.active(now))
    }

    /// True if a round trip on `id` of `kind` is in flight.
    pub fn is_held(&self, id: &MessageId, kind: ActionKind) -> bool {
        self.leases
            .get(&(id.clone(), kind))
            .is_some_and(|lease| lease.holders > 0)
    }

    /// Drop leases whose settle window has passed.
    pub fn purge(&mut self, now: Instant) {
        self.leases.retain(|_, lease| lease.active(now));
    }

    /// Number of tracked leases.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// True if no lease is tracked.
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadsync_types::{ConversationId, SetChange, UserId};

    const SETTLE: Duration = Duration::from_millis(500);

    fn id(s: &str) -> MessageId {
        MessageId::new(s)
    }

    #[test]
    fn held_lease_suppresses_matching_echo_only() {
        let now = Instant::now();
        let mut sup = ActionSuppressor::new(SETTLE);
        let _token = sup.acquire(id("m1"), ActionKind::Edit);

        assert!(sup.suppresses(&id("m1"), ActionKind::Edit, now));
        assert!(!sup.suppresses(&id("m1"), ActionKind::Delete, now));
        assert!(!sup.suppresses(&id("m2"), ActionKind::Edit, now));
    }

    #[test]
    fn lease_lingers_for_settle_window() {
        let start = Instant::now();
        let mut sup = ActionSuppressor::new(SETTLE);
        let token = sup.acquire(id("m1"), ActionKind::React);
        sup.release(token, start);

        assert!(sup.suppresses(&id("m1"), ActionKind::React, start + SETTLE / 2));
        assert!(!sup.suppresses(&id("m1"), ActionKind::React, start + SETTLE));
        assert!(sup.is_empty());
    }

    #[test]
    fn overlapping_holders_keep_lease_alive() {
        let start = Instant::now();
        let mut sup = ActionSuppressor::new(SETTLE);
        let first = sup.acquire(id("m1"), ActionKind::React);
        let second = sup.acquire(id("m1"), ActionKind::React);

        sup.release(first, start);
        assert!(sup.is_held(&id("m1"), ActionKind::React));
        assert!(sup.suppresses(&id("m1"), ActionKind::React, start + SETTLE * 4));

        sup.release(second, start + SETTLE * 4);
        assert!(!sup.is_held(&id("m1"), ActionKind::React));
        assert!(!sup.suppresses(&id("m1"), ActionKind::React, start + SETTLE * 6));
    }

    #[test]
    fn settle_only_lease_for_confirmed_send() {
        let now = Instant::now();
        let mut sup = ActionSuppressor::new(SETTLE);
        sup.settle(id("srv-1"), ActionKind::Send, now);

        assert!(sup.suppresses(&id("srv-1"), ActionKind::Send, now));
        assert!(!sup.is_held(&id("srv-1"), ActionKind::Send));
    }

    #[test]
    fn kind_for_event() {
        let event = ChannelEvent::ReadReceiptChanged {
            conversation_id: ConversationId::new("c"),
            message_id: id("m1"),
            user_id: UserId::new("ada"),
            change: SetChange::Added,
        };
        assert_eq!(ActionKind::for_event(&event), Some(ActionKind::MarkRead));

        let directory = ChannelEvent::ConversationDeleted {
            conversation_id: ConversationId::new("c"),
        };
        assert_eq!(ActionKind::for_event(&directory), None);
    }
}
