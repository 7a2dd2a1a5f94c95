//! Error taxonomy for threadsync.

use thiserror::Error;

use crate::ids::MessageId;

/// Internal failures of the synchronization pipeline.
///
/// None of these is fatal: each is handled where it occurs and only
/// network and send-time encryption failures reach the user.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A channel frame could not be parsed
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A message body could not be decrypted
    #[error("failed to decrypt message {message_id}: {reason}")]
    Decryption {
        /// The affected message.
        message_id: MessageId,
        /// Cipher failure detail.
        reason: String,
    },

    /// A response belongs to a superseded request
    #[error("stale response: generation {got}, current {current}")]
    StaleResponse {
        /// Generation the request was issued under.
        got: u64,
        /// Generation at the time the response arrived.
        current: u64,
    },

    /// An operation was requested while the same operation is in flight
    #[error("{0} already in progress")]
    Reentrant(&'static str),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::StaleResponse { got: 2, current: 3 };
        assert_eq!(err.to_string(), "stale response: generation 2, current 3");
        assert_eq!(
            SyncError::Reentrant("load older").to_string(),
            "load older already in progress"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
