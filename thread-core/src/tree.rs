//! Reply-tree reconstruction.
//!
//! [`ThreadTree::build`] turns a flat set of loaded messages into an ordered
//! forest. The build is pure: the same input always yields the same tree.
//!
//! Rules:
//! - A message is a root when it has no parent, names itself as parent, or
//!   its parent is not in the loaded set (orphan promotion).
//! - Siblings, roots included, are ordered by `(created_at, id)`.
//! - A deleted message stays only while it has a surviving descendant.
//! - A parent cycle cannot hide messages: the earliest member of the cycle
//!   becomes a root.

use std::collections::{HashMap, HashSet};
use threadsync_types::{Message, MessageId};

/// Ordering key shared by siblings and the chronological index.
pub(crate) fn chrono_key(message: &Message) -> (u64, &MessageId) {
    (message.created_at, &message.id)
}

/// A node of the materialized tree, with its replies in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNode {
    /// Message id.
    pub id: MessageId,
    /// Replies in sibling order.
    pub children: Vec<ThreadNode>,
}

/// Ordered reply forest over the loaded messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadTree {
    roots: Vec<MessageId>,
    children: HashMap<MessageId, Vec<MessageId>>,
    parents: HashMap<MessageId, MessageId>,
    order: Vec<MessageId>,
}

impl ThreadTree {
    /// Build the tree over `messages`.
    pub fn build<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut sorted: Vec<&Message> = messages.into_iter().collect();
        sorted.sort_by(|a, b| chrono_key(a).cmp(&chrono_key(b)));
        sorted.dedup_by(|a, b| a.id == b.id);

        let n = sorted.len();
        let index: HashMap<&MessageId, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, m)| (&m.id, i))
            .collect();

        // Indices follow sibling order, so pushing in index order keeps
        // every child list sorted.
        let mut parent: Vec<Option<usize>> = sorted
            .iter()
            .enumerate()
            .map(|(i, m)| {
                m.parent_id
                    .as_ref()
                    .and_then(|p| index.get(p).copied())
                    .filter(|&p| p != i)
            })
            .collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, p) in parent.iter().enumerate() {
            if let Some(p) = p {
                children[*p].push(i);
            }
        }

        let mut roots: Vec<usize> = (0..n).filter(|&i| parent[i].is_none()).collect();
        let mut visited = vec![false; n];
        for &root in &roots {
            mark_reachable(root, &children, &mut visited);
        }

        // Whatever is still unvisited hangs off a cycle.
        for start in 0..n {
            if visited[start] {
                continue;
            }
            let mut on_path = HashSet::new();
            let mut cur = start;
            while on_path.insert(cur) {
                match parent[cur] {
                    Some(p) => cur = p,
                    None => break,
                }
            }
            let mut head = cur;
            let mut walk = parent[cur];
            while let Some(w) = walk {
                if w == cur {
                    break;
                }
                head = head.min(w);
                walk = parent[w];
            }
            if let Some(p) = parent[head].take() {
                children[p].retain(|&c| c != head);
            }
            roots.push(head);
            mark_reachable(head, &children, &mut visited);
        }
        roots.sort_unstable();

        let pre_order = pre_order(&roots, &children);

        // Children precede parents in reverse pre-order.
        let mut kept = vec![false; n];
        for &i in pre_order.iter().rev() {
            kept[i] = !sorted[i].deleted || children[i].iter().any(|&c| kept[c]);
        }

        let id = |i: usize| sorted[i].id.clone();
        let mut tree = ThreadTree {
            roots: roots.iter().copied().filter(|&r| kept[r]).map(id).collect(),
            ..Default::default()
        };
        for &i in pre_order.iter().filter(|&&i| kept[i]) {
            tree.order.push(id(i));
            let replies: Vec<MessageId> = children[i]
                .iter()
                .copied()
                .filter(|&c| kept[c])
                .map(id)
                .collect();
            for reply in &replies {
                tree.parents.insert(reply.clone(), id(i));
            }
            if !replies.is_empty() {
                tree.children.insert(id(i), replies);
            }
        }
        tree
    }

    /// Root ids in sibling order.
    pub fn root_ids(&self) -> &[MessageId] {
        &self.roots
    }

    /// Replies to `id` in sibling order. Empty for leaves and unknown ids.
    pub fn children_of(&self, id: &MessageId) -> &[MessageId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tree parent of `id`. `None` for roots, including promoted orphans.
    pub fn parent_of(&self, id: &MessageId) -> Option<&MessageId> {
        self.parents.get(id)
    }

    /// True if `id` is placed in the tree.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.parents.contains_key(id) || self.roots.contains(id)
    }

    /// Number of placed messages.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is placed.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every placed id in depth-first pre-order (a thread reading order).
    pub fn depth_first(&self) -> &[MessageId] {
        &self.order
    }

    /// Nesting depth of `id`; roots are at depth 0.
    pub fn depth(&self, id: &MessageId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        let mut depth = 0;
        let mut cur = id;
        while let Some(p) = self.parents.get(cur) {
            depth += 1;
            cur = p;
        }
        Some(depth)
    }

    /// Materialize the forest as nested nodes.
    pub fn nodes(&self) -> Vec<ThreadNode> {
        self.roots.iter().map(|id| self.node(id)).collect()
    }

    fn node(&self, id: &MessageId) -> ThreadNode {
        ThreadNode {
            id: id.clone(),
            children: self
                .children_of(id)
                .iter()
                .map(|child| self.node(child))
                .collect(),
        }
    }
}

fn mark_reachable(from: usize, children: &[Vec<usize>], visited: &mut [bool]) {
    let mut stack = vec![from];
    while let Some(i) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        stack.extend(children[i].iter().copied());
    }
}

fn pre_order(roots: &[usize], children: &[Vec<usize>]) -> Vec<usize> {
    let mut out = Vec::with_capacity(children.len());
    let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
    while let Some(i) = stack.pop() {
        out.push(i);
        stack.extend(children[i].iter().rev().copied());
    }
    out
}
