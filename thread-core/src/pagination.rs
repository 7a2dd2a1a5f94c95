//! Backward paging ("load older").
//!
//! At most one page is in flight per conversation view. The controller
//! hands out the request, and on completion merges the page and updates
//! `has_more`. Scroll preservation is the caller's job: capture with
//! [`crate::ScrollAnchor::capture_for_prepend`] right before
//! [`PaginationController::complete`].

use thiserror::Error;
use threadsync_types::{FetchRequest, Message, MessageId};

use crate::merge;
use crate::snapshot::Snapshot;

/// Why no page was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageSkip {
    /// A page is already in flight
    #[error("a page is already in flight")]
    InFlight,
    /// The server has no older messages
    #[error("no older messages")]
    Exhausted,
}

/// Result of merging one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMerge {
    /// Messages in the page.
    pub received: usize,
    /// Messages that were not loaded before.
    pub inserted: usize,
    /// More pages remain.
    pub has_more: bool,
    /// The paging cursor moved back.
    pub cursor_moved: bool,
}

/// `has_more` after a page: a short page ends paging even if the server
/// still claims more.
pub fn page_has_more(received: usize, limit: u32, server_has_more: bool) -> bool {
    server_has_more && received >= limit as usize
}

/// Single-flight pager for one conversation view.
#[derive(Debug, Clone)]
pub struct PaginationController {
    page_size: u32,
    in_flight: Option<FetchRequest>,
}

impl PaginationController {
    /// Create a pager requesting `page_size` messages per page.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            in_flight: None,
        }
    }

    /// Claim the next page.
    pub fn begin(&mut self, snapshot: &Snapshot) -> Result<FetchRequest, PageSkip> {
        if self.in_flight.is_some() {
            return Err(PageSkip::InFlight);
        }
        if !snapshot.pagination.has_more {
            return Err(PageSkip::Exhausted);
        }
        let request = match &snapshot.pagination.oldest_loaded_id {
            Some(oldest) => FetchRequest::older(oldest.clone(), self.page_size),
            None => FetchRequest::latest(self.page_size),
        };
        self.in_flight = Some(request.clone());
        Ok(request)
    }

    /// Merge the page fetched for the in-flight request.
    pub fn complete(
        &mut self,
        snapshot: &mut Snapshot,
        messages: Vec<Message>,
        server_has_more: bool,
    ) -> PageMerge {
        let limit = self
            .in_flight
            .take()
            .map_or(self.page_size, |request| request.limit);
        let cursor_before: Option<MessageId> = snapshot.pagination.oldest_loaded_id.clone();

        let received = messages.len();
        let inserted = merge::merge_page(snapshot, messages);
        let has_more = page_has_more(received, limit, server_has_more);
        snapshot.pagination.has_more = has_more;

        PageMerge {
            received,
            inserted,
            has_more,
            cursor_moved: snapshot.pagination.oldest_loaded_id != cursor_before,
        }
    }

    /// Release the in-flight claim after a failed or discarded fetch.
    pub fn abort(&mut self) {
        self.in_flight = None;
    }

    /// True while a page is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Messages requested per page.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{msg, snapshot};

    #[test]
    fn second_begin_while_in_flight_is_skipped() {
        let snap = snapshot(vec![msg("10", None, 100)], true);
        let mut pager = PaginationController::new(2);

        let request = pager.begin(&snap).unwrap();
        assert_eq!(request, FetchRequest::older(MessageId::new("10"), 2));
        assert_eq!(pager.begin(&snap), Err(PageSkip::InFlight));
    }

    #[test]
    fn exhausted_snapshot_is_skipped() {
        let snap = snapshot(vec![msg("10", None, 100)], false);
        let mut pager = PaginationController::new(2);
        assert_eq!(pager.begin(&snap), Err(PageSkip::Exhausted));
        assert!(!pager.is_in_flight());
    }

    #[test]
    fn full_page_keeps_paging() {
        let mut snap = snapshot(vec![msg("10", None, 100)], true);
        let mut pager = PaginationController::new(2);
        pager.begin(&snap).unwrap();

        let merged = pager.complete(
            &mut snap,
            vec![msg("8", None, 80), msg("9", None, 90)],
            true,
        );
        assert_eq!(
            merged,
            PageMerge {
                received: 2,
                inserted: 2,
                has_more: true,
                cursor_moved: true,
            }
        );
        assert_eq!(snap.pagination.oldest_loaded_id, Some(MessageId::new("8")));
        assert!(!pager.is_in_flight());
    }

    #[test]
    fn short_page_ends_paging() {
        let mut snap = snapshot(vec![msg("10", None, 100)], true);
        let mut pager = PaginationController::new(5);
        pager.begin(&snap).unwrap();

        let merged = pager.complete(&mut snap, vec![msg("9", None, 90)], true);
        assert!(!merged.has_more);
        assert!(!snap.pagination.has_more);
        assert_eq!(pager.begin(&snap), Err(PageSkip::Exhausted));
    }

    #[test]
    fn abort_releases_claim() {
        let snap = snapshot(vec![msg("10", None, 100)], true);
        let mut pager = PaginationController::new(2);
        pager.begin(&snap).unwrap();
        pager.abort();
        assert!(pager.begin(&snap).is_ok());
    }

    #[test]
    fn has_more_rule() {
        assert!(page_has_more(50, 50, true));
        assert!(!page_has_more(49, 50, true));
        assert!(!page_has_more(50, 50, false));
    }
}
