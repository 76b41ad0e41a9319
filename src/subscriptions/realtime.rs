//! Unbounded live delivery.

use crate::error::{ClientError, Result};
use crate::types::{ChainKey, Message, MessageRef, RequestId, ResendOptions, StreamPartition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::shared::{KeyWait, SubscriptionContext, SubscriptionCore};
use super::subscription::Subscription;
use super::types::{Delivery, OnMessage, SubscriptionEvent, SubscriptionId, SubscriptionState};

/// Delivers live traffic in chain order, filling gaps by replay.
///
/// An optional initial resend runs inline: live messages arriving while it
/// is in flight are queued and released once it completes.
pub struct RealTimeSubscription {
    core: SubscriptionCore,
}

impl RealTimeSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        stream: StreamPartition,
        ctx: SubscriptionContext,
        resend: Option<ResendOptions>,
    ) -> Self {
        Self {
            core: SubscriptionCore::new(id, stream, ctx, resend),
        }
    }

    /// Take over from a finished replay: chains start from the refs the
    /// replay already delivered, messages it held for missing keys stay
    /// first in line, and the lifecycle state carries over without
    /// re-announcing it.
    pub(crate) fn continuing(
        id: SubscriptionId,
        stream: StreamPartition,
        ctx: SubscriptionContext,
        state: SubscriptionState,
        last_delivered: HashMap<ChainKey, MessageRef>,
        key_wait: KeyWait,
    ) -> Self {
        let mut core = SubscriptionCore::new(id, stream, ctx, None);
        core.state = state;
        core.restore_key_wait(key_wait);
        core.seed(last_delivered, Instant::now());
        Self { core }
    }

    fn finish_resend(&mut self, request_id: RequestId, empty: bool) -> Result<()> {
        self.core.replay_done(request_id, empty)?;
        self.core.resending = false;
        self.core.flush_live_queue(Instant::now());
        Ok(())
    }
}

impl Subscription for RealTimeSubscription {
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
        self.core.resending
    }

    fn handle_message(&mut self, message: Message, is_replay: bool) {
        if self.core.resending && !is_replay {
            self.core.queue_live(message);
        } else {
            self.core.route(message, Instant::now());
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
        self.core.flush_live_queue(Instant::now());
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

    fn stop(&mut self) {
        self.core.stop();
    }
}
