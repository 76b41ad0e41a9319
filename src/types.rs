//! Core types shared by the ordering engine and the subscriptions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Position of a message inside its chain.
///
/// Refs order lexicographically by `(timestamp, sequence_number)`; the
/// derived `Ord` relies on the field order below.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Publisher-assigned timestamp (milliseconds since Unix epoch).
    pub timestamp: i64,
    /// Tie-breaker for messages sharing a timestamp.
    pub sequence_number: u64,
}

impl MessageRef {
    pub fn new(timestamp: i64, sequence_number: u64) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }

    /// The ref one sequence number past this one.
    ///
    /// Used as the lower bound of a gap-fill request; the real first missing
    /// ref is not knowable at this layer.
    pub fn next(self) -> Self {
        Self {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number.saturating_add(1),
        }
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}:{})", self.timestamp, self.sequence_number)
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence_number)
    }
}

/// A stream partition, the unit the transport subscribes to.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPartition {
    pub stream_id: String,
    pub partition: u32,
}

impl StreamPartition {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Debug for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({}#{})", self.stream_id, self.partition)
    }
}

impl fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// One causally ordered chain of messages from a single publisher.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl ChainKey {
    pub fn new(publisher_id: impl Into<String>, msg_chain_id: impl Into<String>) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
        }
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chain({}/{})", self.publisher_id, self.msg_chain_id)
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.publisher_id, self.msg_chain_id)
    }
}

/// A decoded message as handed over by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub stream: StreamPartition,
    pub publisher_id: String,
    pub msg_chain_id: String,
    pub msg_ref: MessageRef,
    /// Ref of the preceding message on the same chain, `None` for the first.
    pub prev_ref: Option<MessageRef>,
    /// Opaque content, plain or encrypted.
    pub payload: Vec<u8>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl Message {
    /// Build an unsigned plaintext message.
    pub fn new(
        stream: StreamPartition,
        chain: &ChainKey,
        msg_ref: MessageRef,
        prev_ref: Option<MessageRef>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            stream,
            publisher_id: chain.publisher_id.clone(),
            msg_chain_id: chain.msg_chain_id.clone(),
            msg_ref,
            prev_ref,
            payload,
            encrypted: false,
            signature: None,
        }
    }

    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(self.publisher_id.clone(), self.msg_chain_id.clone())
    }

    /// Identity used to memoize verification results. Two copies of the
    /// same ref with different content have different ids.
    pub fn id(&self) -> MessageId {
        MessageId {
            stream: self.stream.clone(),
            chain: self.chain_key(),
            msg_ref: self.msg_ref,
            digest: ContentDigest::of(self),
        }
    }
}

/// SHA-256 over the verifiable content of a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    /// Digest of predecessor link, payload, encryption flag and signature.
    /// Lengths are prefixed so no two field splits hash alike.
    pub fn of(message: &Message) -> Self {
        let mut hasher = Sha256::new();
        match message.prev_ref {
            Some(prev) => {
                hasher.update([1]);
                hasher.update(prev.timestamp.to_le_bytes());
                hasher.update(prev.sequence_number.to_le_bytes());
            }
            None => hasher.update([0]),
        }
        hasher.update((message.payload.len() as u64).to_le_bytes());
        hasher.update(&message.payload);
        hasher.update([message.encrypted as u8]);
        match &message.signature {
            Some(signature) => {
                hasher.update([1]);
                hasher.update((signature.len() as u64).to_le_bytes());
                hasher.update(signature);
            }
            None => hasher.update([0]),
        }
        ContentDigest(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..12])
    }
}

/// Identity of one copy of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub stream: StreamPartition,
    pub chain: ChainKey,
    pub msg_ref: MessageRef,
    pub digest: ContentDigest,
}

/// Identifier correlating a resend request with its replies.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to replay from history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResendOptions {
    /// The last `count` messages of the stream partition.
    Last { count: u64 },
    /// Everything from `from` onwards, optionally for one publisher only.
    From {
        from: MessageRef,
        publisher_id: Option<String>,
    },
    /// An inclusive range on one chain. Gap fills use this form.
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher_id: String,
        msg_chain_id: String,
    },
}
