//! Conversation fixtures.
//!
//! A fixture is a JSON file holding one conversation, its server-side
//! history and an optional list of channel events to apply after loading.
//! It is served from an in-memory server so the real engine can load it.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use threadsync_client::{EngineConfig, Keyring, MockApi, PageOutcome, SyncEngine};
use threadsync_core::Snapshot;
use threadsync_types::{ChannelEvent, Conversation, ConversationId, UserId, WireMessage};

/// A conversation fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    /// User the engine acts for.
    #[serde(default = "default_viewer")]
    pub viewer: UserId,
    /// Conversation metadata.
    pub conversation: Conversation,
    /// Server-side history.
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    /// Channel events delivered after the snapshot loads.
    #[serde(default)]
    pub events: Vec<ChannelEvent>,
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = include_str!("../fixtures/design-review.json");

fn default_viewer() -> UserId {
    UserId::new("me")
}

/// An engine with the fixture conversation loaded.
pub struct Session {
    /// The engine.
    pub engine: SyncEngine<MockApi, Keyring>,
    /// Loaded conversation.
    pub conversation: ConversationId,
    /// Events from the fixture, not yet applied.
    pub events: Vec<ChannelEvent>,
}

impl Fixture {
    /// Read a fixture file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid fixture {}", path.display()))
    }

    /// Parse fixture JSON.
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serve the fixture and load the newest page of its conversation.
    pub async fn open(self, config: EngineConfig) -> Result<Session> {
        let api = MockApi::new();
        api.set_actor(self.viewer.clone());
        let conversation = self.conversation.id.clone();
        api.seed(self.conversation, self.messages);

        let engine = SyncEngine::new(config, self.viewer, api, Keyring::new());
        engine
            .load_snapshot(&conversation)
            .await
            .context("Failed to load conversation")?;

        Ok(Session {
            engine,
            conversation,
            events: self.events,
        })
    }
}

impl Session {
    /// Page backward until the whole history is loaded. Returns the number
    /// of pages merged.
    pub async fn load_history(&self) -> Result<usize> {
        let mut pages = 0;
        loop {
            match self.engine.load_older(&self.conversation).await? {
                PageOutcome::Merged(page) => {
                    pages += 1;
                    if !page.has_more || !page.cursor_moved {
                        break;
                    }
                }
                PageOutcome::Skipped(_) | PageOutcome::Superseded => break,
            }
        }
        tracing::debug!(conversation = %self.conversation, pages, "history loaded");
        Ok(pages)
    }

    /// Current snapshot of the conversation.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.engine
            .get_snapshot(&self.conversation)
            .await
            .context("Conversation is not loaded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paged(page_size: u32) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.sync.page_size = page_size;
        config
    }

    #[test]
    fn sample_fixture_parses() {
        let fixture = Fixture::parse(SAMPLE).unwrap();
        assert_eq!(fixture.viewer, UserId::new("dana"));
        assert_eq!(fixture.conversation.title, "Design review");
        assert_eq!(fixture.messages.len(), 6);
        assert_eq!(fixture.events.len(), 3);
    }

    #[test]
    fn viewer_defaults_to_me() {
        let fixture = Fixture::parse(r#"{"conversation": {"id": "c"}}"#).unwrap();
        assert_eq!(fixture.viewer, UserId::new("me"));
        assert!(fixture.messages.is_empty());
    }

    #[tokio::test]
    async fn load_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = Fixture::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let fixture = Fixture::load(&path).await.unwrap();
        assert_eq!(fixture.conversation.id, ConversationId::new("design-review"));
    }

    #[tokio::test]
    async fn history_is_paged_in_completely() {
        let session = Fixture::parse(SAMPLE)
            .unwrap()
            .open(paged(2))
            .await
            .unwrap();
        assert_eq!(session.snapshot().await.unwrap().len(), 2);

        let pages = session.load_history().await.unwrap();
        assert_eq!(pages, 2);
        assert_eq!(session.snapshot().await.unwrap().len(), 6);
    }
}
