//! Message body encryption for end-to-end encrypted conversations.
//!
//! The engine only sees the [`MessageCipher`] trait. [`Keyring`] is the
//! bundled implementation:
//! - XChaCha20-Poly1305 with random 192-bit nonces
//! - One key per conversation and key version, derived via HKDF-SHA256
//! - The conversation id is bound as associated data, so a ciphertext
//!   replayed into another conversation fails to open
//!
//! # Security Notes
//!
//! - Key material is zeroized on drop and never printed
//! - Old key versions stay in the keyring so history keeps decrypting
//!   after a rotation

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use threadsync_types::{ConversationId, EncryptedPayload};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No key for this conversation or key version.
    #[error("no key for conversation {conversation} version {version:?}")]
    MissingKey {
        /// Conversation the key was looked up for.
        conversation: ConversationId,
        /// Requested version; `None` means the latest.
        version: Option<u32>,
    },

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Payload is not valid base64 or UTF-8, or the nonce has the wrong size.
    #[error("invalid payload encoding: {0}")]
    InvalidEncoding(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Random number generation failed.
    #[error("random number generation failed: {0}")]
    Random(String),

    /// The keyring lock was poisoned by a panicking writer.
    #[error("keyring unavailable")]
    KeyringPoisoned,
}

/// Encrypts and decrypts message bodies for a conversation.
pub trait MessageCipher: Send + Sync {
    /// Seal `plaintext` with the conversation's current key.
    fn encrypt(
        &self,
        conversation: &ConversationId,
        plaintext: &str,
    ) -> Result<EncryptedPayload, CryptoError>;

    /// Open a payload sealed with any known key version.
    fn decrypt(
        &self,
        conversation: &ConversationId,
        payload: &EncryptedPayload,
    ) -> Result<String, CryptoError>;
}

/// A 256-bit message key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; KEY_SIZE]);

impl MessageKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a random key.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Derive the key for `version` of a conversation from a shared secret.
    pub fn derive(
        secret: &[u8],
        conversation: &ConversationId,
        version: u32,
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(conversation.as_str().as_bytes()), secret);
        let info = format!("threadsync-message-key-v{version}");
        let mut bytes = [0u8; KEY_SIZE];
        hkdf.expand(info.as_bytes(), &mut bytes)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(bytes))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKey([REDACTED])")
    }
}

/// Versioned per-conversation keys.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: RwLock<HashMap<ConversationId, BTreeMap<u32, MessageKey>>>,
}

impl Keyring {
    /// Create an empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `key` as `version` for a conversation.
    pub fn insert(
        &self,
        conversation: ConversationId,
        version: u32,
        key: MessageKey,
    ) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::KeyringPoisoned)?;
        keys.entry(conversation).or_default().insert(version, key);
        Ok(())
    }

    /// Derive and install `version` for a conversation from a shared secret.
    pub fn derive(
        &self,
        conversation: ConversationId,
        version: u32,
        secret: &[u8],
    ) -> Result<(), CryptoError> {
        let key = MessageKey::derive(secret, &conversation, version)?;
        self.insert(conversation, version, key)
    }

    /// Newest installed version for a conversation.
    pub fn current_version(&self, conversation: &ConversationId) -> Option<u32> {
        let keys = self.keys.read().ok()?;
        keys.get(conversation)?.keys().next_back().copied()
    }

    /// Forget every key of a conversation.
    pub fn remove(&self, conversation: &ConversationId) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::KeyringPoisoned)?;
        keys.remove(conversation);
        Ok(())
    }
}

impl MessageCipher for Keyring {
    fn encrypt(
        &self,
        conversation: &ConversationId,
        plaintext: &str,
    ) -> Result<EncryptedPayload, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::KeyringPoisoned)?;
        let (version, key) = keys
            .get(conversation)
            .and_then(|versions| versions.iter().next_back())
            .ok_or_else(|| CryptoError::MissingKey {
                conversation: conversation.clone(),
                version: None,
            })?;

        // Generate random 192-bit nonce
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|e| CryptoError::Random(e.to_string()))?;

        let ciphertext = key
            .cipher()?
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: conversation.as_str().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce_bytes),
            key_version: *version,
        })
    }

    fn decrypt(
        &self,
        conversation: &ConversationId,
        payload: &EncryptedPayload,
    ) -> Result<String, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::KeyringPoisoned)?;
        let key = keys
            .get(conversation)
            .and_then(|versions| versions.get(&payload.key_version))
            .ok_or_else(|| CryptoError::MissingKey {
                conversation: conversation.clone(),
                version: Some(payload.key_version),
            })?;

        let nonce = STANDARD
            .decode(&payload.nonce)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidEncoding(format!(
                "nonce is {} bytes, expected {NONCE_SIZE}",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&payload.ciphertext)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;

        let plaintext = key
            .cipher()?
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: conversation.as_str().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
    }
}

impl<T: MessageCipher + ?Sized> MessageCipher for Arc<T> {
    fn encrypt(
        &self,
        conversation: &ConversationId,
        plaintext: &str,
    ) -> Result<EncryptedPayload, CryptoError> {
        (**self).encrypt(conversation, plaintext)
    }

    fn decrypt(
        &self,
        conversation: &ConversationId,
        payload: &EncryptedPayload,
    ) -> Result<String, CryptoError> {
        (**self).decrypt(conversation, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> ConversationId {
        ConversationId::new(id)
    }

    fn keyring_with(conversation: &str, version: u32) -> Keyring {
        let keyring = Keyring::new();
        keyring
            .derive(conv(conversation), version, b"shared secret")
            .unwrap();
        keyring
    }

    // ===========================================
    // XChaCha20-Poly1305 Tests (192-bit nonces)
    // ===========================================

    #[test]
    fn round_trips_with_192_bit_nonce() {
        let keyring = keyring_with("c", 1);
        let payload = keyring.encrypt(&conv("c"), "hello thread").unwrap();

        assert_eq!(STANDARD.decode(&payload.nonce).unwrap().len(), 24);
        assert_eq!(payload.key_version, 1);
        assert_eq!(keyring.decrypt(&conv("c"), &payload).unwrap(), "hello thread");
    }

    #[test]
    fn random_nonces_differ() {
        let keyring = keyring_with("c", 1);
        let a = keyring.encrypt(&conv("c"), "same").unwrap();
        let b = keyring.encrypt(&conv("c"), "same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn ciphertext_is_bound_to_conversation() {
        let keyring = Keyring::new();
        let key = MessageKey::random().unwrap();
        keyring.insert(conv("a"), 1, key.clone()).unwrap();
        keyring.insert(conv("b"), 1, key).unwrap();

        let payload = keyring.encrypt(&conv("a"), "secret").unwrap();
        assert!(matches!(
            keyring.decrypt(&conv("b"), &payload),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let keyring = keyring_with("c", 1);
        let mut payload = keyring.encrypt(&conv("c"), "secret").unwrap();
        let mut bytes = STANDARD.decode(&payload.ciphertext).unwrap();
        bytes[0] ^= 0xFF;
        payload.ciphertext = STANDARD.encode(bytes);

        assert!(matches!(
            keyring.decrypt(&conv("c"), &payload),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn bad_nonce_is_invalid_encoding() {
        let keyring = keyring_with("c", 1);
        let mut payload = keyring.encrypt(&conv("c"), "secret").unwrap();
        payload.nonce = STANDARD.encode([0u8; 12]);
        assert!(matches!(
            keyring.decrypt(&conv("c"), &payload),
            Err(CryptoError::InvalidEncoding(_))
        ));
    }

    // ===========================================
    // Key versions
    // ===========================================

    #[test]
    fn encrypts_with_newest_version_and_opens_old_ones() {
        let keyring = keyring_with("c", 1);
        let old = keyring.encrypt(&conv("c"), "before rotation").unwrap();

        keyring.derive(conv("c"), 2, b"shared secret").unwrap();
        let new = keyring.encrypt(&conv("c"), "after rotation").unwrap();

        assert_eq!(new.key_version, 2);
        assert_eq!(keyring.current_version(&conv("c")), Some(2));
        assert_eq!(keyring.decrypt(&conv("c"), &old).unwrap(), "before rotation");
    }

    #[test]
    fn missing_key_is_reported() {
        let keyring = Keyring::new();
        assert!(matches!(
            keyring.encrypt(&conv("c"), "x"),
            Err(CryptoError::MissingKey { version: None, .. })
        ));
    }

    #[test]
    fn derivation_is_deterministic_per_version() {
        let a = Keyring::new();
        let b = Keyring::new();
        a.derive(conv("c"), 3, b"secret").unwrap();
        b.derive(conv("c"), 3, b"secret").unwrap();

        let payload = a.encrypt(&conv("c"), "shared").unwrap();
        assert_eq!(b.decrypt(&conv("c"), &payload).unwrap(), "shared");
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = MessageKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "MessageKey([REDACTED])");
    }
}
