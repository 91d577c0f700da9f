//! PIN fallback, offered once a subject is locked out of face verification.

use async_trait::async_trait;
use facegate_core::{BoxError, FallbackVerifier};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::store::{FacegateStore, StoreError};

const SALT_LEN: usize = 16;
const PIN_LEN: std::ops::RangeInclusive<usize> = 4..=12;

#[derive(Error, Debug)]
pub enum PinError {
    #[error("PIN must be 4 to 12 digits")]
    InvalidFormat,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Salted SHA-256 PIN hashes kept in the daemon store.
#[derive(Clone)]
pub struct PinVerifier {
    store: FacegateStore,
}

impl PinVerifier {
    pub fn new(store: FacegateStore) -> Self {
        Self { store }
    }

    pub async fn set_pin(&self, subject: &str, pin: &str) -> Result<(), PinError> {
        if !PIN_LEN.contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PinError::InvalidFormat);
        }
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = hash_pin(&salt, pin);
        self.store.set_pin_hash(subject, salt, hash).await?;
        tracing::info!(subject, "fallback PIN updated");
        Ok(())
    }

    /// False when no PIN is set.
    pub async fn verify(&self, subject: &str, pin: &str) -> Result<bool, PinError> {
        let Some((salt, expected)) = self.store.pin_hash(subject).await? else {
            tracing::warn!(subject, "fallback attempted but no PIN is set");
            return Ok(false);
        };
        let hash = hash_pin(&salt, pin);
        Ok(hash.as_slice().ct_eq(expected.as_slice()).into())
    }
}

#[async_trait]
impl FallbackVerifier for PinVerifier {
    async fn verify_fallback(&self, subject_id: &str, credential: &str) -> Result<bool, BoxError> {
        Ok(self.verify(subject_id, credential).await?)
    }
}

fn hash_pin(salt: &[u8], pin: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    async fn verifier() -> PinVerifier {
        let store = FacegateStore::open(Path::new(":memory:"), 128).await.unwrap();
        PinVerifier::new(store)
    }

    #[tokio::test]
    async fn test_set_and_verify() {
        let pins = verifier().await;
        pins.set_pin("alice", "4821").await.unwrap();
        assert!(pins.verify("alice", "4821").await.unwrap());
        assert!(!pins.verify("alice", "4822").await.unwrap());
        assert!(!pins.verify("bob", "4821").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_replaces_pin() {
        let pins = verifier().await;
        pins.set_pin("alice", "4821").await.unwrap();
        pins.set_pin("alice", "907711").await.unwrap();
        assert!(!pins.verify("alice", "4821").await.unwrap());
        assert!(pins.verify_fallback("alice", "907711").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_bad_format() {
        let pins = verifier().await;
        for pin in ["123", "12a4", "1234567890123", ""] {
            assert!(matches!(
                pins.set_pin("alice", pin).await,
                Err(PinError::InvalidFormat)
            ));
        }
    }

    #[test]
    fn test_same_pin_different_salt() {
        assert_ne!(hash_pin(b"salt-one", "1234"), hash_pin(b"salt-two", "1234"));
    }

    #[tokio::test]
    async fn test_truncated_stored_hash_never_matches() {
        let pins = verifier().await;
        let salt = b"0123456789abcdef".to_vec();
        let mut hash = hash_pin(&salt, "4821");
        hash.truncate(16);
        pins.store.set_pin_hash("alice", salt, hash).await.unwrap();
        assert!(!pins.verify("alice", "4821").await.unwrap());
    }
}
