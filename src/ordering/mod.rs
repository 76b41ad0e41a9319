//! Message ordering across the chains of one subscription.
//!
//! Every `(publisher, msg chain)` pair gets its own [`OrderedChainBuffer`],
//! created on first sight. Chains are independent: a gap on one never holds
//! back another.

mod chain;

pub use chain::{
    GapAction, GapRequest, OrderedChainBuffer, OrderingConfig, DEFAULT_MAX_GAP_REQUESTS,
};

use crate::types::{ChainKey, Message, MessageRef};
use std::collections::HashMap;
use std::time::Instant;

/// Per-chain ordering state for one subscription.
pub struct MessageOrdering {
    config: OrderingConfig,
    chains: HashMap<ChainKey, OrderedChainBuffer>,
}

impl MessageOrdering {
    pub fn new(config: OrderingConfig) -> Self {
        Self {
            config,
            chains: HashMap::new(),
        }
    }

    /// Add a message, returning whatever became deliverable on its chain.
    pub fn add(&mut self, msg: Message, now: Instant) -> Vec<Message> {
        if !self.config.order_messages {
            return vec![msg];
        }
        let key = msg.chain_key();
        self.chain_mut(key).add(msg, now)
    }

    /// Record a message that could not be decoded.
    pub fn add_error(&mut self, msg: &Message, now: Instant) -> Vec<Message> {
        if !self.config.order_messages {
            return Vec::new();
        }
        self.chain_mut(msg.chain_key()).add_error(msg, now)
    }

    /// Seed a chain with a ref that was delivered elsewhere.
    pub fn mark_delivered(
        &mut self,
        chain: ChainKey,
        msg_ref: MessageRef,
        now: Instant,
    ) -> Vec<Message> {
        self.chain_mut(chain).mark_delivered(msg_ref, now)
    }

    /// Fire due gap timers on all chains.
    pub fn tick(&mut self, now: Instant) -> Vec<GapAction> {
        self.chains
            .values_mut()
            .filter_map(|chain| chain.tick(now))
            .collect()
    }

    /// Last delivered ref of every chain that delivered anything.
    pub fn last_delivered(&self) -> HashMap<ChainKey, MessageRef> {
        self.chains
            .iter()
            .filter_map(|(key, chain)| chain.last_delivered().map(|r| (key.clone(), r)))
            .collect()
    }

    /// Drain buffered out-of-order messages from every chain.
    pub fn take_pending(&mut self) -> Vec<Message> {
        let mut keys: Vec<_> = self.chains.keys().cloned().collect();
        keys.sort();
        let mut pending = Vec::new();
        for key in keys {
            if let Some(chain) = self.chains.get_mut(&key) {
                pending.extend(chain.take_pending());
            }
        }
        pending
    }

    /// Cancel every gap timer and drop pending messages.
    pub fn clear(&mut self) {
        for chain in self.chains.values_mut() {
            chain.clear();
        }
    }

    pub fn chain(&self, key: &ChainKey) -> Option<&OrderedChainBuffer> {
        self.chains.get(key)
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    fn chain_mut(&mut self, key: ChainKey) -> &mut OrderedChainBuffer {
        let config = &self.config;
        self.chains
            .entry(key)
            .or_insert_with_key(|key| OrderedChainBuffer::new(key.clone(), config.clone()))
    }
}
