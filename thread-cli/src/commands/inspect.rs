//! Print the reconstructed thread of a fixture.

use anyhow::Result;
use std::path::Path;
use threadsync_client::EngineConfig;
use threadsync_core::Snapshot;
use threadsync_types::Message;

use crate::fixture::{Fixture, Session};

/// Run the inspect command.
pub async fn run(fixture: &Path, config: EngineConfig) -> Result<()> {
    let session = Fixture::load(fixture).await?.open(config).await?;
    for line in inspect(session).await? {
        println!("{}", line);
    }
    Ok(())
}

/// Load the whole history, apply the fixture's events and render the thread.
pub async fn inspect(mut session: Session) -> Result<Vec<String>> {
    session.load_history().await?;

    let mut lines = Vec::new();
    for event in std::mem::take(&mut session.events) {
        let kind = event.kind();
        let disposition = session.engine.apply_realtime_event(event).await;
        lines.push(format!("event {}: {:?}", kind, disposition));
    }
    if !lines.is_empty() {
        lines.push(String::new());
    }

    let snapshot = session.snapshot().await?;
    lines.extend(render_thread(&snapshot));
    Ok(lines)
}

/// Render a snapshot as an indented reply tree.
pub fn render_thread(snapshot: &Snapshot) -> Vec<String> {
    let conversation = &snapshot.conversation;
    let mut lines = vec![
        format!("=== {} ({}) ===", conversation.title, conversation.id),
        format!(
            "{} messages, {} participants",
            snapshot.len(),
            conversation.participants.len()
        ),
        String::new(),
    ];

    let tree = snapshot.tree();
    for id in tree.depth_first() {
        let (Some(message), Some(depth)) = (snapshot.get(id), tree.depth(id)) else {
            continue;
        };
        lines.push(format!("{}- {}", "  ".repeat(depth), describe(message)));
    }
    lines
}

fn describe(message: &Message) -> String {
    if message.deleted {
        return format!("[{}] (deleted)", message.chrono_index);
    }
    let mut line = format!(
        "[{}] {}: {}",
        message.chrono_index, message.author_id, message.content
    );
    if message.edited_at.is_some() {
        line.push_str(" (edited)");
    }
    for (emoji, users) in message.visible_reactions() {
        line.push_str(&format!(" {} x{}", emoji, users.len()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::SAMPLE;

    async fn sample_session(page_size: u32) -> Session {
        let mut config = EngineConfig::default();
        config.sync.page_size = page_size;
        Fixture::parse(SAMPLE).unwrap().open(config).await.unwrap()
    }

    #[tokio::test]
    async fn renders_depth_first_thread() {
        let lines = inspect(sample_session(2).await).await.unwrap();
        let thread: Vec<&String> = lines
            .iter()
            .skip_while(|l| !l.starts_with("==="))
            .skip(3)
            .collect();

        assert_eq!(
            thread,
            vec![
                "- [0] ana: Draft of the sync doc is up",
                "  - [1] bo: Reading it now, looks good (edited)",
                "    - [3] ana: Section 4 is the interesting part",
                "  - [4] dana: Left comments inline (edited)",
                "- [2] dana: Can we move the review to Thursday? +1 x2",
                "  - [6] bo: Thursday works",
                "- [5] bo: Replying to a thread that was cleaned up",
            ]
        );
    }

    #[tokio::test]
    async fn reports_event_dispositions() {
        let lines = inspect(sample_session(50).await).await.unwrap();
        assert_eq!(lines[0], "event created: Merged(Inserted)");
        assert_eq!(lines[1], "event edited: Merged(Updated)");
        assert_eq!(lines[2], "event participant-added: Applied");
        assert!(lines.contains(&"7 messages, 4 participants".to_string()));
    }

    #[tokio::test]
    async fn tombstone_keeps_reply_context() {
        let session = sample_session(50).await;
        session
            .engine
            .optimistic_delete(&threadsync_types::MessageId::new("m2"))
            .await
            .unwrap();

        let lines = render_thread(&session.snapshot().await.unwrap());
        assert!(lines.contains(&"  - [1] (deleted)".to_string()));
        assert!(lines.contains(&"    - [3] ana: Section 4 is the interesting part".to_string()));
    }
}
