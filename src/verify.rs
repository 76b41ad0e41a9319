//! Verification and decryption capabilities.
//!
//! Signature checking and key exchange live outside this crate. The
//! subscriptions only need a verdict per message and, for delivery, the
//! plaintext content.

use crate::types::{Message, MessageId};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default number of memoized verdicts.
pub const DEFAULT_VERIFICATION_CACHE_SIZE: usize = 10_000;

/// Result of verifying a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Authenticity check failed. The message does not count as received.
    Invalid(String),
    /// Payload could not be decoded. The message counts as received.
    Malformed(String),
}

/// Checks message authenticity and well-formedness.
pub trait Verifier: Send + Sync {
    fn verify(&self, message: &Message) -> Verdict;
}

/// Verifier that trusts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl Verifier for AcceptAll {
    fn verify(&self, _message: &Message) -> Verdict {
        Verdict::Valid
    }
}

/// Memoizes verdicts so a message seen by several subscriptions, or replayed
/// after being seen live, is verified once. Verdicts are keyed by content, so
/// a rejected copy of a ref never decides the fate of another copy.
pub struct VerificationCache {
    verifier: Arc<dyn Verifier>,
    cache: Mutex<LruCache<MessageId, Verdict>>,
}

impl VerificationCache {
    pub fn new(verifier: Arc<dyn Verifier>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            verifier,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn verify(&self, message: &Message) -> Verdict {
        let id = message.id();
        if let Some(verdict) = self.cache.lock().get(&id) {
            return verdict.clone();
        }
        // Not holding the lock while the verifier runs.
        let verdict = self.verifier.verify(message);
        self.cache.lock().put(id, verdict.clone());
        verdict
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why content could not be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptError {
    /// The group key for this publisher is not available yet.
    KeyMissing,
    Failed(String),
}

/// Turns a verified message into application content.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, message: &Message) -> std::result::Result<Value, DecryptError>;
}

/// Decryptor for plaintext streams: parses the payload as JSON and reports
/// encrypted messages as missing a key.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextDecryptor;

impl Decryptor for PlaintextDecryptor {
    fn decrypt(&self, message: &Message) -> std::result::Result<Value, DecryptError> {
        if message.encrypted {
            return Err(DecryptError::KeyMissing);
        }
        serde_json::from_slice(&message.payload).map_err(|e| DecryptError::Failed(e.to_string()))
    }
}
