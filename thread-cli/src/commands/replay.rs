//! Replay a fixture one message at a time.

use anyhow::{Context, Result};
use std::path::Path;
use threadsync_client::{EngineConfig, SeekOutcome};

use crate::fixture::{Fixture, Session};

/// Run the replay command.
pub async fn run(fixture: &Path, upto: Option<usize>, config: EngineConfig) -> Result<()> {
    let session = Fixture::load(fixture).await?.open(config).await?;
    for line in replay(&session, upto).await? {
        println!("{}", line);
    }
    Ok(())
}

/// Step through playback positions `0..=upto` (or the whole history) and
/// describe what each one reveals.
pub async fn replay(session: &Session, upto: Option<usize>) -> Result<Vec<String>> {
    let engine = &session.engine;
    let conversation = &session.conversation;

    // The first seek pages in the complete history.
    engine.seek_playback(Some(0)).await?;
    let total = session
        .snapshot()
        .await
        .context("Conversation disappeared during replay")?
        .len();
    let Some(newest) = total.checked_sub(1) else {
        engine.seek_playback(None).await?;
        return Ok(vec!["(no messages)".to_string()]);
    };
    let last = upto.unwrap_or(newest).min(newest);

    let mut lines = Vec::with_capacity(last + 1);
    for position in 0..=last {
        let target = match engine.seek_playback(Some(position)).await? {
            SeekOutcome::Revealed {
                target: Some(target),
                ..
            } => target,
            other => {
                tracing::warn!(position, ?other, "seek revealed nothing");
                break;
            }
        };
        let visible = engine.visible_messages(conversation).await;
        let Some(message) = visible.iter().find(|m| m.id == target) else {
            continue;
        };
        let content = if message.deleted {
            "(deleted)"
        } else {
            message.content.as_str()
        };
        lines.push(format!(
            "[{}] {} visible | {}: {}",
            position,
            visible.len(),
            message.author_id,
            content
        ));
    }

    engine.seek_playback(None).await?;
    Ok(lines)
}
