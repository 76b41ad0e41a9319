//! Reordering buffer for a single message chain.

use crate::types::{ChainKey, Message, MessageRef};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default number of gap-fill requests before a chain is given up.
pub const DEFAULT_MAX_GAP_REQUESTS: u32 = 10;

/// Ordering and gap-fill settings.
#[derive(Clone, Debug)]
pub struct OrderingConfig {
    /// Restore chain order and fill gaps. When false messages pass straight
    /// through.
    /// Default: true
    pub order_messages: bool,

    /// Delay between detecting a gap and the first gap-fill request.
    /// Default: 5s
    pub gap_fill_timeout: Duration,

    /// Delay between subsequent gap-fill requests for the same gap.
    /// Default: 5s
    pub retry_resend_after: Duration,

    /// Gap-fill requests issued before the chain is failed.
    /// Default: 10
    pub max_gap_requests: u32,

    /// Require the first message of a chain to have no predecessor.
    /// When false, whatever arrives first on an empty chain is delivered,
    /// which is what a subscriber joining a running chain needs.
    /// Default: false
    pub strict_chain_start: bool,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            order_messages: true,
            gap_fill_timeout: Duration::from_secs(5),
            retry_resend_after: Duration::from_secs(5),
            max_gap_requests: DEFAULT_MAX_GAP_REQUESTS,
            strict_chain_start: false,
        }
    }
}

/// A range a chain needs replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GapRequest {
    pub chain: ChainKey,
    pub from: MessageRef,
    pub to: MessageRef,
}

/// Outcome of a gap timer firing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GapAction {
    /// Ask for `from..=to` to be replayed.
    Request(GapRequest),
    /// Retries exhausted; the chain has been abandoned.
    Failed(GapRequest),
    /// The blocked head declares no predecessor, so there is nothing to
    /// ask for. It was released with whatever followed it.
    Released(Vec<Message>),
}

/// A buffered entry. Placeholders stand for messages that failed decoding:
/// they advance the chain but are never delivered.
enum Slot {
    Message(Message),
    Placeholder { prev_ref: Option<MessageRef> },
}

impl Slot {
    fn prev_ref(&self) -> Option<MessageRef> {
        match self {
            Slot::Message(msg) => msg.prev_ref,
            Slot::Placeholder { prev_ref } => *prev_ref,
        }
    }
}

struct GapTimer {
    deadline: Instant,
    requests: u32,
}

/// Restores total order for one chain and tracks its gap.
pub struct OrderedChainBuffer {
    chain: ChainKey,
    config: OrderingConfig,
    last_delivered: Option<MessageRef>,
    pending: BTreeMap<MessageRef, Slot>,
    gap: Option<GapTimer>,
    failed: bool,
}

impl OrderedChainBuffer {
    pub fn new(chain: ChainKey, config: OrderingConfig) -> Self {
        Self {
            chain,
            config,
            last_delivered: None,
            pending: BTreeMap::new(),
            gap: None,
            failed: false,
        }
    }

    pub fn chain(&self) -> &ChainKey {
        &self.chain
    }

    pub fn last_delivered(&self) -> Option<MessageRef> {
        self.last_delivered
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_gap(&self) -> bool {
        self.gap.is_some()
    }

    /// Gap-fill requests issued for the currently open gap.
    pub fn gap_requests(&self) -> u32 {
        self.gap.as_ref().map_or(0, |g| g.requests)
    }

    /// Whether gap filling was exhausted and the chain abandoned.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Add a message. Returns the messages that became deliverable, in order.
    pub fn add(&mut self, msg: Message, now: Instant) -> Vec<Message> {
        let msg_ref = msg.msg_ref;
        self.admit(msg_ref, Slot::Message(msg), now)
    }

    /// Record a message that failed decoding as received, so its absence is
    /// not mistaken for a gap. It is never delivered.
    pub fn add_error(&mut self, msg: &Message, now: Instant) -> Vec<Message> {
        self.admit(
            msg.msg_ref,
            Slot::Placeholder {
                prev_ref: msg.prev_ref,
            },
            now,
        )
    }

    /// Treat `msg_ref` as already delivered. Anything pending that now
    /// follows it is released.
    pub fn mark_delivered(&mut self, msg_ref: MessageRef, now: Instant) -> Vec<Message> {
        let mut delivered = Vec::new();
        if self.last_delivered.is_some_and(|last| last >= msg_ref) {
            return delivered;
        }
        self.last_delivered = Some(msg_ref);
        self.drain_pending(&mut delivered);
        self.reset_gap(now);
        delivered
    }

    /// Cancel the gap timer and drop everything pending.
    pub fn clear(&mut self) {
        self.gap = None;
        self.pending.clear();
    }

    /// Take the buffered messages out, in ref order. Placeholders are
    /// discarded and the gap timer canceled.
    pub fn take_pending(&mut self) -> Vec<Message> {
        self.gap = None;
        std::mem::take(&mut self.pending)
            .into_values()
            .filter_map(|slot| match slot {
                Slot::Message(msg) => Some(msg),
                Slot::Placeholder { .. } => None,
            })
            .collect()
    }

    /// Fire the gap timer if it is due.
    pub fn tick(&mut self, now: Instant) -> Option<GapAction> {
        let timer = self.gap.as_ref()?;
        if now < timer.deadline {
            return None;
        }
        let requests = timer.requests;
        if self.head_is_unlinked() {
            return Some(GapAction::Released(self.release_head(now)));
        }
        let request = self.gap_request()?;

        if requests >= self.config.max_gap_requests {
            warn!(
                chain = %self.chain,
                from = %request.from,
                to = %request.to,
                requests,
                "gap fill failed, abandoning chain"
            );
            self.failed = true;
            self.clear();
            return Some(GapAction::Failed(request));
        }

        let retry = self.config.retry_resend_after;
        if let Some(timer) = self.gap.as_mut() {
            timer.requests += 1;
            timer.deadline = now + retry;
        }
        debug!(
            chain = %self.chain,
            from = %request.from,
            to = %request.to,
            attempt = requests + 1,
            "requesting gap fill"
        );
        Some(GapAction::Request(request))
    }

    fn admit(&mut self, msg_ref: MessageRef, slot: Slot, now: Instant) -> Vec<Message> {
        let mut delivered = Vec::new();

        if self.failed {
            trace!(chain = %self.chain, %msg_ref, "chain abandoned, dropping message");
            return delivered;
        }

        if self.last_delivered.is_some_and(|last| msg_ref <= last) {
            trace!(chain = %self.chain, %msg_ref, "dropping duplicate");
            return delivered;
        }

        if self.is_next(slot.prev_ref()) {
            self.advance(msg_ref, slot, &mut delivered);
            self.drain_pending(&mut delivered);
            self.reset_gap(now);
        } else {
            self.pending.entry(msg_ref).or_insert(slot);
            if self.gap.is_none() {
                debug!(chain = %self.chain, %msg_ref, "gap detected");
                self.gap = Some(GapTimer {
                    deadline: now + self.config.gap_fill_timeout,
                    requests: 0,
                });
            }
        }

        delivered
    }

    fn is_next(&self, prev_ref: Option<MessageRef>) -> bool {
        match (self.last_delivered, prev_ref) {
            (None, None) => true,
            (Some(last), Some(prev)) => prev == last,
            // Unlinked after delivery started: held until the gap timer
            // fires, so earlier refs still have a chance to arrive.
            (Some(_), None) => false,
            (None, Some(_)) => !self.config.strict_chain_start,
        }
    }

    fn advance(&mut self, msg_ref: MessageRef, slot: Slot, out: &mut Vec<Message>) {
        self.last_delivered = Some(msg_ref);
        if let Slot::Message(msg) = slot {
            out.push(msg);
        }
    }

    fn drain_pending(&mut self, out: &mut Vec<Message>) {
        while let Some((&head, slot)) = self.pending.first_key_value() {
            let stale = self.last_delivered.is_some_and(|last| head <= last);
            if !stale && !self.is_next(slot.prev_ref()) {
                break;
            }
            if let Some((_, slot)) = self.pending.pop_first() {
                if !stale {
                    self.advance(head, slot, out);
                }
            }
        }
    }

    /// After progress: close the gap, or open a fresh one if the new head is
    /// still blocked.
    fn reset_gap(&mut self, now: Instant) {
        if self.pending.is_empty() {
            if self.gap.take().is_some() {
                debug!(chain = %self.chain, "gap closed");
            }
        } else {
            self.gap = Some(GapTimer {
                deadline: now + self.config.gap_fill_timeout,
                requests: 0,
            });
        }
    }

    fn head_is_unlinked(&self) -> bool {
        self.pending
            .first_key_value()
            .is_some_and(|(_, slot)| slot.prev_ref().is_none())
    }

    fn release_head(&mut self, now: Instant) -> Vec<Message> {
        let mut delivered = Vec::new();
        if let Some((head, slot)) = self.pending.pop_first() {
            debug!(chain = %self.chain, msg_ref = %head, "releasing unlinked message");
            self.advance(head, slot, &mut delivered);
            self.drain_pending(&mut delivered);
            self.reset_gap(now);
        }
        delivered
    }

    fn gap_request(&self) -> Option<GapRequest> {
        let (_, head) = self.pending.first_key_value()?;
        let to = head.prev_ref()?;
        let from = self.last_delivered.map_or(to, MessageRef::next);
        Some(GapRequest {
            chain: self.chain.clone(),
            from,
            to,
        })
    }
}
