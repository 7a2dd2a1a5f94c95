//! Chronological index over the loaded messages.
//!
//! Ordinals are dense (`0..len`) and follow `(created_at, id)`. The index is
//! recomputed whenever the loaded set changes, so inserting an older message
//! shifts every later ordinal by one.

use std::collections::HashMap;
use threadsync_types::{Message, MessageId};

use crate::tree::chrono_key;

/// Dense ordinal assignment by creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChronoIndex {
    order: Vec<MessageId>,
    positions: HashMap<MessageId, usize>,
}

impl ChronoIndex {
    /// Compute the index over `messages`.
    pub fn build<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut sorted: Vec<&Message> = messages.into_iter().collect();
        sorted.sort_by(|a, b| chrono_key(a).cmp(&chrono_key(b)));
        sorted.dedup_by(|a, b| a.id == b.id);

        let order: Vec<MessageId> = sorted.into_iter().map(|m| m.id.clone()).collect();
        let positions = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self { order, positions }
    }

    /// Compute the index and write each ordinal into `chrono_index`.
    pub fn assign(messages: &mut HashMap<MessageId, Message>) -> Self {
        let index = Self::build(messages.values());
        for (id, message) in messages.iter_mut() {
            if let Some(&pos) = index.positions.get(id) {
                message.chrono_index = pos;
            }
        }
        index
    }

    /// Ordinal of `id`.
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Id at ordinal `index`.
    pub fn id_at(&self, index: usize) -> Option<&MessageId> {
        self.order.get(index)
    }

    /// Ids from oldest to newest.
    pub fn ids(&self) -> &[MessageId] {
        &self.order
    }

    /// Oldest loaded id.
    pub fn oldest(&self) -> Option<&MessageId> {
        self.order.first()
    }

    /// Newest loaded id.
    pub fn newest(&self) -> Option<&MessageId> {
        self.order.last()
    }

    /// Number of indexed messages.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
