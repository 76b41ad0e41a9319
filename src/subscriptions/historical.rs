//! Bounded replay of stream history.

use crate::error::{ClientError, Result};
use crate::types::{ChainKey, Message, MessageRef, RequestId, ResendOptions, StreamPartition};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::shared::{KeyWait, SubscriptionContext, SubscriptionCore};
use super::subscription::Subscription;
use super::types::{Delivery, OnMessage, SubscriptionEvent, SubscriptionId, SubscriptionState};

/// Where a finished replay left off.
pub(crate) struct Handoff {
    /// Last delivered ref per chain.
    pub last_delivered: HashMap<ChainKey, MessageRef>,
    /// Replayed messages still blocked behind a gap.
    pub pending: Vec<Message>,
    /// Live messages that arrived during the replay, in arrival order.
    pub live: VecDeque<Message>,
    /// Replayed messages still waiting for a group key.
    pub key_wait: KeyWait,
}

/// Drives one replay. Live traffic is never processed here, only set aside
/// for whoever continues after the replay.
pub struct HistoricalSubscription {
    core: SubscriptionCore,
    handoff: Option<Handoff>,
    finished: bool,
}

impl HistoricalSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        stream: StreamPartition,
        mut ctx: SubscriptionContext,
        resend: ResendOptions,
    ) -> Self {
        // A replay starts wherever its range starts, usually mid-chain.
        ctx.ordering.strict_chain_start = false;
        let mut core = SubscriptionCore::new(id, stream, ctx, Some(resend));
        core.resending = true;
        Self {
            core,
            handoff: None,
            finished: false,
        }
    }

    /// The handoff produced when the replay completed, once. Messages held
    /// for missing keys go with it.
    pub(crate) fn take_handoff(&mut self) -> Option<Handoff> {
        let mut handoff = self.handoff.take()?;
        handoff.key_wait = self.core.take_key_wait();
        Some(handoff)
    }

    fn finish_resend(&mut self, request_id: RequestId, empty: bool) -> Result<()> {
        let initial = self.core.is_initial(request_id);
        self.core.replay_done(request_id, empty)?;
        if !initial {
            // A gap fill within the replay.
            return Ok(());
        }

        let handoff = Handoff {
            last_delivered: self.core.ordering.last_delivered(),
            pending: self.core.ordering.take_pending(),
            live: self.core.take_live_queue(),
            key_wait: KeyWait::new(),
        };
        debug!(
            subscription = %self.core.id,
            chains = handoff.last_delivered.len(),
            queued_live = handoff.live.len(),
            "replay done"
        );
        self.handoff = Some(handoff);
        self.finished = true;
        Ok(())
    }
}

impl Subscription for HistoricalSubscription {
    fn id(&self) -> SubscriptionId {
        self.core.id
    }

    fn stream(&self) -> &StreamPartition {
        &self.core.stream
    }

    fn state(&self) -> SubscriptionState {
        self.core.state
    }

    fn set_state(&mut self, state: SubscriptionState) {
        self.core.set_state(state);
    }

    fn is_resending(&self) -> bool {
        true
    }

    fn handle_message(&mut self, message: Message, is_replay: bool) {
        if is_replay {
            self.core.route(message, Instant::now());
        } else {
            self.core.queue_live(message);
        }
    }

    fn handle_replay_started(&mut self, request_id: RequestId) -> Result<()> {
        self.core.replay_started(request_id)
    }

    fn handle_replay_finished(&mut self, request_id: RequestId) -> Result<()> {
        self.finish_resend(request_id, false)
    }

    fn handle_replay_empty(&mut self, request_id: RequestId) -> Result<()> {
        self.finish_resend(request_id, true)
    }

    fn handle_disconnected(&mut self) {
        self.core.disconnect();
        self.core.resending = true;
    }

    fn group_key_available(&mut self, publisher_id: &str) {
        self.core.group_key_available(publisher_id);
    }

    fn tick(&mut self, now: Instant) {
        self.core.tick(now);
    }

    fn report_error(&self, error: ClientError) {
        self.core.report(error);
    }

    fn notify(&self, event: SubscriptionEvent) {
        self.core.emit(event);
    }

    fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.core.take_deliveries()
    }

    fn on_message(&self) -> OnMessage {
        Arc::clone(&self.core.ctx.on_message)
    }

    fn pending_resend_count(&self) -> usize {
        self.core.pending_resend_count()
    }

    /// Done once the replay completed and nothing it delivered is still
    /// waiting for a key.
    fn is_finished(&self) -> bool {
        self.finished && !self.core.has_key_wait()
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}
