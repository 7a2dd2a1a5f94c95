//! SyncEngine - the main interface for threadsync.
//!
//! This module provides [`SyncEngine`], which keeps the view of one active
//! conversation consistent across the initial REST snapshot, realtime channel
//! events, optimistic local mutations and backward paging.
//!
//! # Architecture
//!
//! The engine owns the snapshot store and the per-view controllers from
//! `threadsync-core` behind a single async mutex. The lock is never held
//! across a network call: every operation snapshots what it needs, releases
//! the lock, awaits the server, then re-locks and checks the generation
//! counter before touching state.
//!
//! ```text
//! Application → SyncEngine → RestApi ──────▶ Server
//!                  ↓   ↑
//!          threadsync-core   ChannelPump ◀── realtime channel
//! ```
//!
//! # Example
//!
//! ```ignore
//! use threadsync_client::{EngineConfig, Keyring, MockApi, SyncEngine};
//!
//! let engine = SyncEngine::new(EngineConfig::default(), viewer, MockApi::new(), Keyring::new());
//! engine.load_snapshot(&conversation).await?;
//! engine.optimistic_send("hello", None).await?;
//! let visible = engine.visible_messages(&conversation).await;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use threadsync_core::{
    merge, page_has_more, ActionKind, ActionSuppressor, Activity, Delta, LifecycleAction,
    LifecycleEvent, MergeOutcome, PageMerge, PageSkip, PaginationController, PlaybackController,
    ScrollAnchor, ScrollSurface, Snapshot, SnapshotStore, SyncState,
};
use threadsync_types::{
    ChannelEvent, ClientId, Conversation, ConversationId, EncryptedPayload, EncryptionState,
    FetchRequest, Message, MessageBody, MessageId, OutgoingMessage, SetChange, SyncError,
    Timestamp, UserId, WireMessage, UNDECRYPTABLE_PLACEHOLDER,
};

use crate::api::{ApiError, RestApi};
use crate::channel::FrameSink;
use crate::config::EngineConfig;
use crate::crypto::{CryptoError, MessageCipher};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A server round trip failed; the last good state is kept.
    #[error("network error: {0}")]
    TransientNetwork(#[from] ApiError),

    /// A message body could not be encrypted for sending.
    #[error("encryption error: {0}")]
    Encryption(#[from] CryptoError),

    /// No conversation is loaded.
    #[error("no conversation is loaded")]
    NotLoaded,

    /// The message is not loaded or already deleted.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),

    /// The message has not been confirmed by the server yet.
    #[error("message {0} is not confirmed yet")]
    PendingMessage(MessageId),
}

impl EngineError {
    /// True for errors the viewer should be told about.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Encryption(_))
    }
}

/// What happened to one realtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Applied to a snapshot.
    Merged(MergeOutcome),
    /// Conversation metadata or the directory changed.
    Applied,
    /// Held until the running load settles.
    Queued,
    /// Echo of the viewer's own action.
    Suppressed,
    /// The conversation view cannot take events in its current phase.
    Rejected,
    /// The conversation is not loaded.
    Ignored,
    /// The frame could not be parsed.
    Dropped,
}

/// Result of [`SyncEngine::load_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The snapshot was replaced.
    Loaded {
        /// Messages in the new snapshot.
        messages: usize,
        /// Unconfirmed local messages kept from the previous snapshot.
        carried: usize,
        /// Older history remains on the server.
        has_more: bool,
    },
    /// A newer load or a conversation switch made this response stale.
    Superseded,
}

/// Result of [`SyncEngine::load_older`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// A page was merged.
    Merged(PageMerge),
    /// No request was made.
    Skipped(PageSkip),
    /// The view changed while the page was in flight.
    Superseded,
}

/// Result of [`SyncEngine::seek_playback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Replay ended; everything is visible.
    Stopped,
    /// Messages up to `position` are visible.
    Revealed {
        /// Requested position.
        position: usize,
        /// Message the view was asked to center.
        target: Option<MessageId>,
        /// The surface centered the target.
        centered: bool,
    },
    /// Another seek is still paging history.
    Busy,
    /// The view changed while history was paging.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchoring {
    /// The viewer caused the change; let the view follow it.
    None,
    /// Keep the exact offset.
    Preserve,
    /// Older content goes above the viewport.
    Prepend,
}

struct ConversationView {
    conversation_id: ConversationId,
    state: SyncState,
    queued: VecDeque<ChannelEvent>,
    pagination: PaginationController,
    playback: PlaybackController,
    anchor: ScrollAnchor,
}

impl ConversationView {
    fn new(conversation_id: ConversationId, cached: bool, page_size: u32) -> Self {
        let state = if cached {
            SyncState::Ready(Activity::default())
        } else {
            SyncState::Unloaded
        };
        Self {
            conversation_id,
            state,
            queued: VecDeque::new(),
            pagination: PaginationController::new(page_size),
            playback: PlaybackController::new(),
            anchor: ScrollAnchor::new(),
        }
    }

    fn transition(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        let state = std::mem::take(&mut self.state);
        let (next, actions) = state.on_event(event);
        self.state = next;
        actions
    }

    fn is_mounted(&self) -> bool {
        self.state != SyncState::Unmounted
    }
}

struct EngineInner {
    store: SnapshotStore,
    generation: u64,
    view: Option<ConversationView>,
    directory: BTreeMap<ConversationId, Conversation>,
    suppressor: ActionSuppressor,
    surface: Option<Box<dyn ScrollSurface + Send>>,
    notice: Option<String>,
}

impl EngineInner {
    fn active_conversation(&self) -> Option<ConversationId> {
        self.view
            .as_ref()
            .filter(|v| v.is_mounted())
            .map(|v| v.conversation_id.clone())
    }

    fn loaded_conversation(&self) -> Result<ConversationId, EngineError> {
        self.active_conversation()
            .filter(|id| self.store.contains(id))
            .ok_or(EngineError::NotLoaded)
    }

    fn active_view(&mut self, conversation: &ConversationId) -> Option<&mut ConversationView> {
        self.view
            .as_mut()
            .filter(|v| v.is_mounted() && v.conversation_id == *conversation)
    }

    fn lifecycle(
        &mut self,
        conversation: &ConversationId,
        event: LifecycleEvent,
    ) -> Vec<LifecycleAction> {
        self.active_view(conversation)
            .map(|view| view.transition(event))
            .unwrap_or_default()
    }

    /// Apply `f` to a stored snapshot, re-rendering the surface if the
    /// snapshot is on screen and anchoring the scroll position around it.
    fn mutate<R>(
        &mut self,
        conversation: &ConversationId,
        anchoring: Anchoring,
        f: impl FnOnce(&mut Snapshot, Option<&mut ConversationView>) -> R,
    ) -> Option<R> {
        let Self {
            store,
            view,
            surface,
            ..
        } = self;
        let snapshot = store.get_mut(conversation)?;
        let mut view = view
            .as_mut()
            .filter(|v| v.is_mounted() && v.conversation_id == *conversation);
        let mut surface = if view.is_some() {
            surface.as_deref_mut()
        } else {
            None
        };

        if let (Some(view), Some(surface)) = (view.as_deref_mut(), surface.as_deref()) {
            match anchoring {
                Anchoring::Preserve => view.anchor.capture(surface),
                Anchoring::Prepend => view.anchor.capture_for_prepend(surface),
                Anchoring::None => {}
            }
        }

        let result = f(snapshot, view.as_deref_mut());

        if let Some(surface) = surface.as_deref_mut() {
            surface.render(snapshot);
            if let Some(view) = view {
                view.anchor.restore(surface);
            }
        }
        Some(result)
    }

    /// Store a freshly loaded snapshot, replacing any previous one.
    fn install(&mut self, snapshot: Snapshot) {
        let conversation = snapshot.conversation_id().clone();
        let Self {
            store,
            view,
            surface,
            ..
        } = self;
        let view = view
            .as_mut()
            .filter(|v| v.is_mounted() && v.conversation_id == conversation);
        match (view, surface.as_deref_mut()) {
            (Some(view), Some(surface)) => {
                view.anchor.capture(&*surface);
                store.insert(snapshot);
                if let Some(snapshot) = store.get(&conversation) {
                    surface.render(snapshot);
                }
                view.anchor.restore(surface);
            }
            _ => {
                store.insert(snapshot);
            }
        }
    }

    fn render_active(&mut self) {
        let Self {
            store,
            view,
            surface,
            ..
        } = self;
        let Some(view) = view.as_ref().filter(|v| v.is_mounted()) else {
            return;
        };
        if let (Some(snapshot), Some(surface)) =
            (store.get(&view.conversation_id), surface.as_deref_mut())
        {
            surface.render(snapshot);
        }
    }

    fn update_conversation(&mut self, id: &ConversationId, f: impl Fn(&mut Conversation)) {
        if let Some(conversation) = self.directory.get_mut(id) {
            f(conversation);
        }
        if let Some(snapshot) = self.store.get_mut(id) {
            f(&mut snapshot.conversation);
        }
    }
}

/// Clock for lease timing. Follows tokio's clock so paused-time tests work.
fn lease_clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn wall_clock_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

fn failure_of(
    id: &MessageId,
    body: &MessageBody,
    failed: bool,
) -> Option<(MessageId, EncryptedPayload)> {
    match body {
        MessageBody::Encrypted(payload) if failed => Some((id.clone(), payload.clone())),
        _ => None,
    }
}

/// A message the viewer may edit, delete or react to.
fn actionable<'a>(snapshot: &'a Snapshot, id: &MessageId) -> Result<&'a Message, EngineError> {
    match snapshot.get(id) {
        Some(message) if message.deleted => Err(EngineError::UnknownMessage(id.clone())),
        Some(message) if message.is_pending() => Err(EngineError::PendingMessage(id.clone())),
        Some(message) => Ok(message),
        None => Err(EngineError::UnknownMessage(id.clone())),
    }
}

/// The sync engine.
///
/// Owns the snapshot store and drives one conversation view at a time.
/// Snapshots of previously viewed conversations stay cached and keep
/// receiving realtime events.
pub struct SyncEngine<A: RestApi, C: MessageCipher> {
    config: EngineConfig,
    viewer: UserId,
    api: A,
    cipher: C,
    inner: Mutex<EngineInner>,
}

impl<A: RestApi, C: MessageCipher> SyncEngine<A, C> {
    /// Create an engine with an empty snapshot store.
    pub fn new(config: EngineConfig, viewer: UserId, api: A, cipher: C) -> Self {
        Self::with_store(config, viewer, api, cipher, SnapshotStore::new())
    }

    /// Create an engine around an existing snapshot store.
    pub fn with_store(
        config: EngineConfig,
        viewer: UserId,
        api: A,
        cipher: C,
        store: SnapshotStore,
    ) -> Self {
        let directory = store
            .conversation_ids()
            .into_iter()
            .filter_map(|id| store.get(id))
            .map(|snapshot| (snapshot.conversation.id.clone(), snapshot.conversation.clone()))
            .collect();
        let suppressor = ActionSuppressor::new(config.settle_window());
        Self {
            inner: Mutex::new(EngineInner {
                store,
                generation: 0,
                view: None,
                directory,
                suppressor,
                surface: None,
                notice: None,
            }),
            config,
            viewer,
            api,
            cipher,
        }
    }

    /// The user this engine acts for.
    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    /// The REST client.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// The message cipher.
    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ===========================================
    // Loading
    // ===========================================

    /// Load (or reload) the newest page of a conversation and make it the
    /// active view.
    ///
    /// On failure the last good snapshot stays visible and a notice is set.
    pub async fn load_snapshot(
        &self,
        conversation: &ConversationId,
    ) -> Result<LoadOutcome, EngineError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            inner.generation += 1;
            if inner.active_conversation().as_ref() != Some(conversation) {
                tracing::debug!(conversation = %conversation, "switching conversation view");
                let cached = inner.store.contains(conversation);
                inner.view = Some(ConversationView::new(
                    conversation.clone(),
                    cached,
                    self.config.sync.page_size,
                ));
                inner.render_active();
            }
            inner.lifecycle(conversation, LifecycleEvent::LoadRequested);
            inner.generation
        };
        tracing::info!(conversation = %conversation, generation, "loading snapshot");

        let limit = self.config.sync.page_size;
        let result = self
            .api
            .fetch_snapshot(conversation, FetchRequest::latest(limit))
            .await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.generation != generation {
            let stale = SyncError::StaleResponse {
                got: generation,
                current: inner.generation,
            };
            tracing::debug!(conversation = %conversation, "discarding snapshot: {}", stale);
            return Ok(LoadOutcome::Superseded);
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(conversation = %conversation, "snapshot load failed: {}", e);
                if let Some(view) = inner.active_view(conversation) {
                    // An older page discarded during the load left its claim behind.
                    view.pagination.abort();
                }
                let actions = inner.lifecycle(
                    conversation,
                    LifecycleEvent::LoadFailed {
                        error: format!("Could not refresh messages: {e}"),
                    },
                );
                self.run_actions(inner, conversation, actions);
                return Err(e.into());
            }
        };

        let received = page.messages.len();
        let mut metadata = page
            .conversation
            .or_else(|| inner.directory.get(conversation).cloned())
            .unwrap_or_else(|| Conversation::new(conversation.clone()));
        if !page.participants.is_empty() {
            metadata.participants = page.participants.into_iter().collect();
        }
        inner
            .directory
            .insert(conversation.clone(), metadata.clone());

        let (messages, failures) = self.decode_page(conversation, page.messages);
        let has_more = page_has_more(received, limit, page.has_more);
        let mut fresh = Snapshot::from_messages(metadata, messages, has_more);
        for (id, payload) in failures {
            if fresh.contains(&id) {
                fresh.mark_undecryptable(id, payload);
            }
        }
        let carried = inner
            .store
            .get(conversation)
            .map_or(0, |previous| merge::carry_pending(previous, &mut fresh));
        let loaded = fresh.len();
        inner.install(fresh);

        if let Some(view) = inner.active_view(conversation) {
            // A reload supersedes any older page in flight.
            view.pagination.abort();
        }
        let actions = inner.lifecycle(conversation, LifecycleEvent::LoadSucceeded);
        self.run_actions(inner, conversation, actions);

        tracing::info!(
            conversation = %conversation,
            messages = loaded,
            carried,
            has_more,
            "snapshot loaded"
        );
        Ok(LoadOutcome::Loaded {
            messages: loaded,
            carried,
            has_more,
        })
    }

    /// Fetch and merge the page just older than the loaded window.
    ///
    /// A call while another page is in flight does nothing.
    pub async fn load_older(
        &self,
        conversation: &ConversationId,
    ) -> Result<PageOutcome, EngineError> {
        let (generation, request) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let generation = inner.generation;
            let EngineInner { store, view, .. } = inner;
            let view = view
                .as_mut()
                .filter(|v| v.is_mounted() && v.conversation_id == *conversation)
                .ok_or(EngineError::NotLoaded)?;
            let snapshot = store.get(conversation).ok_or(EngineError::NotLoaded)?;

            let request = match view.pagination.begin(snapshot) {
                Ok(request) => request,
                Err(skip) => {
                    if skip == PageSkip::InFlight {
                        tracing::debug!("{}", SyncError::Reentrant("load_older"));
                    }
                    return Ok(PageOutcome::Skipped(skip));
                }
            };
            let actions = view.transition(LifecycleEvent::OlderRequested);
            if !actions.contains(&LifecycleAction::FetchOlder) {
                // A full load is running and will replace the window anyway.
                view.pagination.abort();
                return Ok(PageOutcome::Skipped(PageSkip::InFlight));
            }
            (generation, request)
        };
        tracing::debug!(
            conversation = %conversation,
            before = ?request.before,
            limit = request.limit,
            "loading older messages"
        );

        let result = self.api.fetch_snapshot(conversation, request).await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.generation != generation {
            let stale = SyncError::StaleResponse {
                got: generation,
                current: inner.generation,
            };
            tracing::debug!(conversation = %conversation, "discarding older page: {}", stale);
            return Ok(PageOutcome::Superseded);
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                if let Some(view) = inner.active_view(conversation) {
                    view.pagination.abort();
                    view.transition(LifecycleEvent::OlderSettled);
                }
                tracing::warn!(conversation = %conversation, "older page failed: {}", e);
                inner.notice = Some(format!("Could not load older messages: {e}"));
                return Err(e.into());
            }
        };

        let server_has_more = page.has_more;
        let (messages, failures) = self.decode_page(conversation, page.messages);
        let merged = inner
            .mutate(conversation, Anchoring::Prepend, |snapshot, view| {
                let merged = view.map(|view| {
                    let merged = view
                        .pagination
                        .complete(snapshot, messages, server_has_more);
                    view.transition(LifecycleEvent::OlderSettled);
                    merged
                });
                for (id, payload) in failures {
                    if snapshot.contains(&id) {
                        snapshot.mark_undecryptable(id, payload);
                    }
                }
                merged
            })
            .flatten();

        match merged {
            Some(merged) => {
                tracing::debug!(
                    conversation = %conversation,
                    received = merged.received,
                    inserted = merged.inserted,
                    has_more = merged.has_more,
                    "older page merged"
                );
                Ok(PageOutcome::Merged(merged))
            }
            None => Ok(PageOutcome::Superseded),
        }
    }

    /// Carry out lifecycle actions that are not interpreted by the caller.
    fn run_actions(
        &self,
        inner: &mut EngineInner,
        conversation: &ConversationId,
        actions: Vec<LifecycleAction>,
    ) {
        for action in actions {
            match action {
                LifecycleAction::ShowNotice(text) => inner.notice = Some(text),
                LifecycleAction::ClearNotice => inner.notice = None,
                LifecycleAction::RetainLastGood => {
                    tracing::info!(conversation = %conversation, "keeping last good snapshot")
                }
                LifecycleAction::ReplayQueued => {
                    let queued = inner
                        .active_view(conversation)
                        .map(|view| std::mem::take(&mut view.queued))
                        .unwrap_or_default();
                    if !queued.is_empty() {
                        tracing::debug!(
                            conversation = %conversation,
                            count = queued.len(),
                            "replaying queued events"
                        );
                    }
                    for event in queued {
                        self.route_event(inner, event);
                    }
                }
                LifecycleAction::DiscardSnapshot => {
                    inner.store.remove(conversation);
                }
                LifecycleAction::Fetch
                | LifecycleAction::FetchOlder
                | LifecycleAction::Apply
                | LifecycleAction::Queue
                | LifecycleAction::Reject => {}
            }
        }
    }

    // ===========================================
    // Realtime events
    // ===========================================

    /// Apply one realtime event.
    pub async fn apply_realtime_event(&self, event: ChannelEvent) -> EventDisposition {
        let mut guard = self.inner.lock().await;
        self.route_event(&mut guard, event)
    }

    /// Parse and apply one raw channel frame. Malformed frames are dropped.
    pub async fn apply_raw_event(&self, frame: &str) -> EventDisposition {
        match ChannelEvent::from_json(frame) {
            Ok(event) => self.apply_realtime_event(event).await,
            Err(e) => {
                tracing::warn!("dropping frame: {}", e);
                EventDisposition::Dropped
            }
        }
    }

    fn route_event(&self, inner: &mut EngineInner, event: ChannelEvent) -> EventDisposition {
        if self.apply_directory_event(inner, &event) {
            return EventDisposition::Applied;
        }

        let conversation = event.conversation_id().clone();
        if let (Some(kind), Some(id)) = (ActionKind::for_event(&event), event.message_id()) {
            if self.is_own(&event) && inner.suppressor.suppresses(id, kind, lease_clock()) {
                tracing::debug!(
                    conversation = %conversation,
                    message_id = %id,
                    kind = event.kind(),
                    "suppressed echo of own action"
                );
                return EventDisposition::Suppressed;
            }
        }

        let routed = inner
            .view
            .as_mut()
            .filter(|v| v.conversation_id == conversation)
            .map(|v| v.transition(LifecycleEvent::RealtimeEvent));
        match routed.as_deref() {
            Some([LifecycleAction::Apply, ..]) => self.merge_event(inner, event),
            Some([LifecycleAction::Queue, ..]) => {
                tracing::debug!(conversation = %conversation, kind = event.kind(), "queued event during load");
                if let Some(view) = inner.view.as_mut() {
                    view.queued.push_back(event);
                }
                EventDisposition::Queued
            }
            Some(_) => {
                tracing::debug!(conversation = %conversation, kind = event.kind(), "rejected event");
                EventDisposition::Rejected
            }
            None if inner.store.contains(&conversation) => self.merge_event(inner, event),
            None => {
                tracing::debug!(conversation = %conversation, kind = event.kind(), "event for conversation that is not loaded");
                EventDisposition::Ignored
            }
        }
    }

    /// Whether `event` may be the echo of the viewer's own action.
    ///
    /// Edit and delete events carry no actor, so they always count as own.
    /// While the viewer holds an edit or delete lease on a message, the same
    /// change made from another device is swallowed until the lease settles.
    fn is_own(&self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::Created { message } => message.author_id == self.viewer,
            ChannelEvent::ReactionChanged { user_id, .. }
            | ChannelEvent::ReadReceiptChanged { user_id, .. } => *user_id == self.viewer,
            _ => true,
        }
    }

    fn apply_directory_event(&self, inner: &mut EngineInner, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::ConversationCreated { conversation } => {
                inner
                    .directory
                    .insert(conversation.id.clone(), conversation.clone());
            }
            ChannelEvent::ConversationDeleted { conversation_id } => {
                inner.directory.remove(conversation_id);
                if inner.active_conversation().as_ref() == Some(conversation_id) {
                    tracing::info!(conversation = %conversation_id, "active conversation deleted");
                    self.unmount_view(inner);
                } else {
                    inner.store.remove(conversation_id);
                }
            }
            ChannelEvent::ParticipantAdded {
                conversation_id,
                user_id,
            } => inner.update_conversation(conversation_id, |c| {
                c.participants.insert(user_id.clone());
            }),
            ChannelEvent::ParticipantRemoved {
                conversation_id,
                user_id,
            } => inner.update_conversation(conversation_id, |c| {
                c.participants.remove(user_id);
            }),
            ChannelEvent::KeyRotated {
                conversation_id,
                key_version,
            } => {
                tracing::info!(conversation = %conversation_id, key_version, "conversation key rotated");
                inner.update_conversation(conversation_id, |c| {
                    c.encryption = EncryptionState::Encrypted {
                        key_version: *key_version,
                    };
                });
            }
            _ => return false,
        }
        true
    }

    fn merge_event(&self, inner: &mut EngineInner, event: ChannelEvent) -> EventDisposition {
        let conversation = event.conversation_id().clone();
        let kind = event.kind();
        let Some((delta, failure)) = self.delta_for(event) else {
            return EventDisposition::Ignored;
        };
        let outcome = inner.mutate(&conversation, Anchoring::Preserve, |snapshot, _| {
            let outcome = merge::apply(snapshot, delta);
            if let Some((id, payload)) = failure {
                if snapshot.contains(&id) {
                    snapshot.mark_undecryptable(id, payload);
                }
            }
            outcome
        });
        match outcome {
            Some(outcome) => {
                tracing::trace!(conversation = %conversation, kind, ?outcome, "merged event");
                EventDisposition::Merged(outcome)
            }
            None => EventDisposition::Ignored,
        }
    }

    fn delta_for(&self, event: ChannelEvent) -> Option<(Delta, Option<(MessageId, EncryptedPayload)>)> {
        match event {
            ChannelEvent::Created { message } => {
                let (content, failed) =
                    self.decode_body(&message.conversation_id, &message.id, &message.body);
                let failure = failure_of(&message.id, &message.body, failed);
                Some((
                    Delta::Created(Message::from_wire(message, content, failed)),
                    failure,
                ))
            }
            ChannelEvent::Edited {
                conversation_id,
                message_id,
                body,
                edited_at,
            } => {
                let (content, failed) = self.decode_body(&conversation_id, &message_id, &body);
                let failure = failure_of(&message_id, &body, failed);
                Some((
                    Delta::Edited {
                        id: message_id,
                        content,
                        edited_at,
                        decrypt_failed: failed,
                    },
                    failure,
                ))
            }
            ChannelEvent::Deleted { message_id, .. } => Some((Delta::Deleted(message_id), None)),
            ChannelEvent::ReactionChanged {
                message_id,
                emoji,
                user_id,
                change,
                ..
            } => Some((
                Delta::Reaction {
                    id: message_id,
                    emoji,
                    user_id,
                    change,
                },
                None,
            )),
            ChannelEvent::ReadReceiptChanged {
                message_id,
                user_id,
                change,
                ..
            } => Some((
                Delta::ReadReceipt {
                    id: message_id,
                    user_id,
                    change,
                },
                None,
            )),
            _ => None,
        }
    }

    // ===========================================
    // Decryption
    // ===========================================

    /// Plaintext of a body, or the placeholder if it cannot be decrypted.
    fn decode_body(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        body: &MessageBody,
    ) -> (String, bool) {
        match body {
            MessageBody::Plain(text) => (text.clone(), false),
            MessageBody::Encrypted(payload) => match self.cipher.decrypt(conversation, payload) {
                Ok(text) => (text, false),
                Err(e) => {
                    let error = SyncError::Decryption {
                        message_id: id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(conversation = %conversation, "{}", error);
                    (UNDECRYPTABLE_PLACEHOLDER.to_string(), true)
                }
            },
        }
    }

    fn decode_page(
        &self,
        conversation: &ConversationId,
        wires: Vec<WireMessage>,
    ) -> (Vec<Message>, Vec<(MessageId, EncryptedPayload)>) {
        let mut messages = Vec::with_capacity(wires.len());
        let mut failures = Vec::new();
        for wire in wires {
            let (content, failed) = self.decode_body(conversation, &wire.id, &wire.body);
            failures.extend(failure_of(&wire.id, &wire.body, failed));
            messages.push(Message::from_wire(wire, content, failed));
        }
        (messages, failures)
    }

    fn encode_body(
        &self,
        conversation: &Conversation,
        content: &str,
    ) -> Result<MessageBody, CryptoError> {
        if conversation.encryption.is_encrypted() {
            Ok(MessageBody::Encrypted(
                self.cipher.encrypt(&conversation.id, content)?,
            ))
        } else {
            Ok(MessageBody::Plain(content.to_string()))
        }
    }

    /// Retry every payload that failed to decrypt, typically after a new key
    /// was installed. Returns how many messages now show their content.
    pub async fn retry_decryption(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut resolved = 0;
        for snapshot in inner.store.iter_mut() {
            let conversation = snapshot.conversation_id().clone();
            let pending: Vec<(MessageId, EncryptedPayload)> = snapshot
                .undecryptable()
                .iter()
                .map(|(id, payload)| (id.clone(), payload.clone()))
                .collect();
            for (id, payload) in pending {
                if let Ok(text) = self.cipher.decrypt(&conversation, &payload) {
                    if snapshot.resolve_undecryptable(&id, text) {
                        resolved += 1;
                    }
                }
            }
        }
        if resolved > 0 {
            tracing::info!(resolved, "decryption retry resolved messages");
            inner.render_active();
        }
        resolved
    }

    // ===========================================
    // Optimistic actions
    // ===========================================

    /// Show a message immediately and post it.
    ///
    /// Returns the server id. On failure the optimistic copy is removed.
    pub async fn optimistic_send(
        &self,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> Result<MessageId, EngineError> {
        let (conversation, local_id, outgoing) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let metadata = inner
                .store
                .get(&conversation)
                .map(|snapshot| snapshot.conversation.clone())
                .ok_or(EngineError::NotLoaded)?;
            let body = match self.encode_body(&metadata, content) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(conversation = %conversation, "cannot encrypt message: {}", e);
                    inner.notice = Some(format!("Message could not be encrypted: {e}"));
                    return Err(e.into());
                }
            };

            let client_id = ClientId::new();
            let local = Message::local(
                conversation.clone(),
                client_id,
                self.viewer.clone(),
                parent_id.clone(),
                content.to_string(),
                wall_clock_millis(),
            );
            let local_id = local.id.clone();
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(snapshot, Delta::Created(local))
            });
            inner.lifecycle(&conversation, LifecycleEvent::MutationStarted);

            let outgoing = OutgoingMessage {
                conversation_id: conversation.clone(),
                parent_id,
                body,
                client_id,
            };
            (conversation, local_id, outgoing)
        };
        tracing::debug!(conversation = %conversation, local_id = %local_id, "sending message");

        let result = self.api.send_message(outgoing).await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.lifecycle(&conversation, LifecycleEvent::MutationSettled);
        match result {
            Ok(wire) => {
                let server_id = wire.id.clone();
                inner
                    .suppressor
                    .settle(server_id.clone(), ActionKind::Send, lease_clock());
                let confirmed = Message::from_wire(wire, content.to_string(), false);
                let outcome = inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    merge::confirm_pending(snapshot, &local_id, confirmed)
                });
                tracing::debug!(message_id = %server_id, ?outcome, "send confirmed");
                Ok(server_id)
            }
            Err(e) => {
                inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    merge::discard_local(snapshot, &local_id)
                });
                tracing::warn!(conversation = %conversation, "send failed: {}", e);
                inner.notice = Some(format!("Message could not be sent: {e}"));
                Err(e.into())
            }
        }
    }

    /// Replace a message's content immediately and submit the edit.
    pub async fn optimistic_edit(&self, id: &MessageId, content: &str) -> Result<(), EngineError> {
        let (conversation, before, token, body, edited_at) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let snapshot = inner
                .store
                .get(&conversation)
                .ok_or(EngineError::NotLoaded)?;
            let before = actionable(snapshot, id)?.clone();
            let body = self.encode_body(&snapshot.conversation, content)?;
            let edited_at = wall_clock_millis().max(before.edited_at.unwrap_or_default());

            let token = inner.suppressor.acquire(id.clone(), ActionKind::Edit);
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(
                    snapshot,
                    Delta::Edited {
                        id: id.clone(),
                        content: content.to_string(),
                        edited_at,
                        decrypt_failed: false,
                    },
                )
            });
            inner.lifecycle(&conversation, LifecycleEvent::MutationStarted);
            (conversation, before, token, body, edited_at)
        };

        let result = self.api.edit_message(&conversation, id, body).await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.suppressor.release(token, lease_clock());
        inner.lifecycle(&conversation, LifecycleEvent::MutationSettled);
        let still_ours = |snapshot: &Snapshot| {
            snapshot
                .get(id)
                .filter(|m| !m.deleted && m.edited_at == Some(edited_at))
                .cloned()
        };
        match result {
            Ok(server_edited_at) => {
                inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    if let Some(current) = still_ours(&*snapshot) {
                        merge::restore(
                            snapshot,
                            Message {
                                edited_at: Some(server_edited_at),
                                ..current
                            },
                        );
                    }
                });
                Ok(())
            }
            Err(e) => {
                inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    if still_ours(&*snapshot).is_some() {
                        merge::restore(snapshot, before);
                    }
                });
                tracing::warn!(message_id = %id, "edit failed: {}", e);
                inner.notice = Some(format!("Edit could not be saved: {e}"));
                Err(e.into())
            }
        }
    }

    /// Delete a message immediately and submit the deletion.
    pub async fn optimistic_delete(&self, id: &MessageId) -> Result<(), EngineError> {
        let (conversation, chain, token) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let snapshot = inner
                .store
                .get(&conversation)
                .ok_or(EngineError::NotLoaded)?;
            actionable(snapshot, id)?;

            // The target plus the tombstoned ancestors the delete may collect.
            let mut chain: Vec<Message> = Vec::new();
            let mut next = snapshot.get(id);
            while let Some(message) = next {
                if chain.iter().any(|m| m.id == message.id) {
                    break;
                }
                chain.push(message.clone());
                next = message
                    .parent_id
                    .as_ref()
                    .and_then(|parent| snapshot.get(parent))
                    .filter(|parent| parent.deleted);
            }

            let token = inner.suppressor.acquire(id.clone(), ActionKind::Delete);
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(snapshot, Delta::Deleted(id.clone()))
            });
            inner.lifecycle(&conversation, LifecycleEvent::MutationStarted);
            (conversation, chain, token)
        };

        let result = self.api.delete_message(&conversation, id).await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.suppressor.release(token, lease_clock());
        inner.lifecycle(&conversation, LifecycleEvent::MutationSettled);
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    for message in chain {
                        let gone = snapshot.get(&message.id).map_or(true, |m| m.deleted);
                        if gone {
                            merge::restore(snapshot, message);
                        }
                    }
                });
                tracing::warn!(message_id = %id, "delete failed: {}", e);
                inner.notice = Some(format!("Message could not be deleted: {e}"));
                Err(e.into())
            }
        }
    }

    /// Toggle the viewer's `emoji` reaction. Returns the change applied.
    pub async fn optimistic_react(
        &self,
        id: &MessageId,
        emoji: &str,
    ) -> Result<SetChange, EngineError> {
        let (conversation, change, token) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let snapshot = inner
                .store
                .get(&conversation)
                .ok_or(EngineError::NotLoaded)?;
            let change = if actionable(snapshot, id)?.has_reaction(emoji, &self.viewer) {
                SetChange::Removed
            } else {
                SetChange::Added
            };

            let token = inner.suppressor.acquire(id.clone(), ActionKind::React);
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(snapshot, self.reaction(id, emoji, change))
            });
            inner.lifecycle(&conversation, LifecycleEvent::MutationStarted);
            (conversation, change, token)
        };

        let result = self
            .api
            .set_reaction(&conversation, id, emoji, change)
            .await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.suppressor.release(token, lease_clock());
        inner.lifecycle(&conversation, LifecycleEvent::MutationSettled);
        match result {
            Ok(()) => Ok(change),
            Err(e) => {
                let undo = match change {
                    SetChange::Added => SetChange::Removed,
                    SetChange::Removed => SetChange::Added,
                };
                inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                    merge::apply(snapshot, self.reaction(id, emoji, undo))
                });
                tracing::warn!(message_id = %id, "reaction failed: {}", e);
                inner.notice = Some(format!("Reaction could not be saved: {e}"));
                Err(e.into())
            }
        }
    }

    fn reaction(&self, id: &MessageId, emoji: &str, change: SetChange) -> Delta {
        Delta::Reaction {
            id: id.clone(),
            emoji: emoji.to_string(),
            user_id: self.viewer.clone(),
            change,
        }
    }

    /// Mark a message read by the viewer.
    pub async fn mark_read(&self, id: &MessageId) -> Result<(), EngineError> {
        let (conversation, token) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let snapshot = inner
                .store
                .get(&conversation)
                .ok_or(EngineError::NotLoaded)?;
            if actionable(snapshot, id)?.read_by.contains(&self.viewer) {
                return Ok(());
            }

            let token = inner.suppressor.acquire(id.clone(), ActionKind::MarkRead);
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(
                    snapshot,
                    Delta::ReadReceipt {
                        id: id.clone(),
                        user_id: self.viewer.clone(),
                        change: SetChange::Added,
                    },
                )
            });
            inner.lifecycle(&conversation, LifecycleEvent::MutationStarted);
            (conversation, token)
        };

        let result = self.api.mark_read(&conversation, id).await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.suppressor.release(token, lease_clock());
        inner.lifecycle(&conversation, LifecycleEvent::MutationSettled);
        if let Err(e) = result {
            inner.mutate(&conversation, Anchoring::None, |snapshot, _| {
                merge::apply(
                    snapshot,
                    Delta::ReadReceipt {
                        id: id.clone(),
                        user_id: self.viewer.clone(),
                        change: SetChange::Removed,
                    },
                )
            });
            tracing::warn!(message_id = %id, "mark read failed: {}", e);
            inner.notice = Some(format!("Could not mark message read: {e}"));
            return Err(e.into());
        }
        Ok(())
    }

    // ===========================================
    // Playback
    // ===========================================

    /// Reveal messages up to chronological `target`, or leave replay with
    /// `None`.
    ///
    /// Older history is paged in completely first, so positions refer to the
    /// whole conversation.
    pub async fn seek_playback(&self, target: Option<usize>) -> Result<SeekOutcome, EngineError> {
        let (conversation, index) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation()?;
            let Some(index) = target else {
                if let Some(view) = inner.active_view(&conversation) {
                    view.playback.stop();
                    view.transition(LifecycleEvent::PlaybackStopped);
                }
                inner.render_active();
                return Ok(SeekOutcome::Stopped);
            };
            let view = inner
                .active_view(&conversation)
                .ok_or(EngineError::NotLoaded)?;
            if !view.playback.begin_preload() {
                tracing::debug!("{}", SyncError::Reentrant("seek_playback"));
                return Ok(SeekOutcome::Busy);
            }
            (conversation, index)
        };

        let preloaded = self.preload_history(&conversation).await;
        {
            let mut guard = self.inner.lock().await;
            if let Some(view) = guard.active_view(&conversation) {
                view.playback.finish_preload();
            }
        }
        if !preloaded? {
            return Ok(SeekOutcome::Superseded);
        }

        let target_id = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let EngineInner { store, view, .. } = &mut *inner;
            let (Some(view), Some(snapshot)) = (
                view.as_mut()
                    .filter(|v| v.is_mounted() && v.conversation_id == conversation),
                store.get(&conversation),
            ) else {
                return Ok(SeekOutcome::Superseded);
            };
            let target_id = view.playback.seek(Some(index), snapshot.chrono());
            view.transition(LifecycleEvent::PlaybackStarted);
            inner.render_active();
            target_id
        };

        let centered = match &target_id {
            Some(id) => self.center(&conversation, id).await,
            None => false,
        };
        tracing::debug!(conversation = %conversation, position = index, centered, "playback seek");
        Ok(SeekOutcome::Revealed {
            position: index,
            target: target_id,
            centered,
        })
    }

    /// Reveal the next message. Starts replay at the oldest message.
    ///
    /// Starting replay pages in the complete history first, like
    /// [`seek_playback`](Self::seek_playback).
    pub async fn step_playback(&self) -> Option<MessageId> {
        let (conversation, starting) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let conversation = inner.loaded_conversation().ok()?;
            let view = inner.active_view(&conversation)?;
            let starting = !view.playback.is_active();
            if starting && !view.playback.begin_preload() {
                tracing::debug!("{}", SyncError::Reentrant("step_playback"));
                return None;
            }
            (conversation, starting)
        };

        if starting {
            let preloaded = self.preload_history(&conversation).await;
            {
                let mut guard = self.inner.lock().await;
                if let Some(view) = guard.active_view(&conversation) {
                    view.playback.finish_preload();
                }
            }
            match preloaded {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    tracing::warn!(conversation = %conversation, "playback preload failed: {}", e);
                    return None;
                }
            }
        }

        let next = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let EngineInner { store, view, .. } = &mut *inner;
            let view = view
                .as_mut()
                .filter(|v| v.is_mounted() && v.conversation_id == conversation)?;
            let snapshot = store.get(&conversation)?;
            let was_active = view.playback.is_active();
            let next = view.playback.step(snapshot.chrono())?;
            if !was_active {
                view.transition(LifecycleEvent::PlaybackStarted);
            }
            inner.render_active();
            next
        };

        let centered = self.center(&conversation, &next).await;
        tracing::debug!(conversation = %conversation, message_id = %next, centered, "playback step");
        Some(next)
    }

    /// Page backward until the server has nothing older.
    ///
    /// Returns false if the view changed meanwhile.
    async fn preload_history(&self, conversation: &ConversationId) -> Result<bool, EngineError> {
        loop {
            match self.load_older(conversation).await? {
                PageOutcome::Merged(page) if page.has_more && page.cursor_moved => {}
                PageOutcome::Merged(_) | PageOutcome::Skipped(PageSkip::Exhausted) => {
                    return Ok(true)
                }
                PageOutcome::Skipped(PageSkip::InFlight) => {
                    tokio::time::sleep(self.config.center_retry_delay()).await
                }
                PageOutcome::Superseded => return Ok(false),
            }
        }
    }

    /// Center `id`, retrying once if its row was not rendered yet.
    async fn center(&self, conversation: &ConversationId, id: &MessageId) -> bool {
        match self.try_center(conversation, id).await {
            Some(true) => return true,
            None => return false,
            Some(false) => {}
        }
        tokio::time::sleep(self.config.center_retry_delay()).await;
        self.try_center(conversation, id).await.unwrap_or(false)
    }

    /// `None` when there is nothing to center in.
    async fn try_center(&self, conversation: &ConversationId, id: &MessageId) -> Option<bool> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.active_conversation().as_ref() != Some(conversation) {
            return None;
        }
        inner
            .surface
            .as_deref_mut()
            .map(|surface| surface.center_on(id))
    }

    // ===========================================
    // View access
    // ===========================================

    /// A copy of the snapshot of a conversation.
    pub async fn get_snapshot(&self, conversation: &ConversationId) -> Option<Snapshot> {
        let inner = self.inner.lock().await;
        inner.store.get(conversation).cloned()
    }

    /// Messages currently revealed, oldest first.
    pub async fn visible_messages(&self, conversation: &ConversationId) -> Vec<Message> {
        let inner = self.inner.lock().await;
        let Some(snapshot) = inner.store.get(conversation) else {
            return Vec::new();
        };
        let visible = match inner
            .view
            .as_ref()
            .filter(|v| v.is_mounted() && v.conversation_id == *conversation)
        {
            Some(view) => view.playback.visible(snapshot),
            None => snapshot.chronological(),
        };
        visible.into_iter().cloned().collect()
    }

    /// Lifecycle phase of the conversation view, if it is the current one.
    pub async fn sync_state(&self, conversation: &ConversationId) -> Option<SyncState> {
        let inner = self.inner.lock().await;
        inner
            .view
            .as_ref()
            .filter(|v| v.conversation_id == *conversation)
            .map(|v| v.state.clone())
    }

    /// Current replay position.
    pub async fn playback_position(&self) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner
            .view
            .as_ref()
            .filter(|v| v.is_mounted())
            .and_then(|v| v.playback.position())
    }

    /// Known conversations.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let inner = self.inner.lock().await;
        inner.directory.values().cloned().collect()
    }

    /// Pending non-blocking error notice.
    pub async fn notice(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.notice.clone()
    }

    /// Clear the error notice.
    pub async fn dismiss_notice(&self) {
        let mut inner = self.inner.lock().await;
        inner.notice = None;
    }

    /// Attach the message list view. It is rendered right away.
    pub async fn attach_surface(&self, surface: Box<dyn ScrollSurface + Send>) {
        let mut inner = self.inner.lock().await;
        inner.surface = Some(surface);
        inner.render_active();
    }

    /// Detach the message list view.
    pub async fn detach_surface(&self) -> Option<Box<dyn ScrollSurface + Send>> {
        let mut inner = self.inner.lock().await;
        inner.surface.take()
    }

    /// Tear down the current view. Its snapshot is discarded and responses
    /// still in flight are ignored.
    pub async fn unmount(&self) {
        let mut guard = self.inner.lock().await;
        self.unmount_view(&mut guard);
    }

    fn unmount_view(&self, inner: &mut EngineInner) {
        inner.generation += 1;
        let Some(view) = inner.view.as_mut().filter(|v| v.is_mounted()) else {
            return;
        };
        let conversation = view.conversation_id.clone();
        view.queued.clear();
        view.playback.stop();
        let actions = view.transition(LifecycleEvent::Unmount);
        self.run_actions(inner, &conversation, actions);
        tracing::info!(conversation = %conversation, "conversation view unmounted");
    }
}

#[async_trait]
impl<A: RestApi, C: MessageCipher> FrameSink for SyncEngine<A, C> {
    async fn deliver(&self, frame: String) {
        let disposition = self.apply_raw_event(&frame).await;
        tracing::trace!(?disposition, "channel frame handled");
    }
}
