//! Replay followed by live delivery behind one stable subscription.

use crate::error::{ClientError, Result};
use crate::types::{Message, RequestId, ResendOptions, StreamPartition};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::shared::SubscriptionContext;
use super::historical::HistoricalSubscription;
use super::realtime::RealTimeSubscription;
use super::subscription::Subscription;
use super::types::{Delivery, OnMessage, SubscriptionEvent, SubscriptionId, SubscriptionState};

enum Delegate {
    Historical(HistoricalSubscription),
    RealTime(RealTimeSubscription),
}

/// Starts as a [`HistoricalSubscription`] and swaps itself to a
/// [`RealTimeSubscription`] when the replay completes.
///
/// The real-time side starts from the refs the replay delivered, then
/// receives the live messages set aside during the replay. Nothing the
/// replay delivered is delivered again and nothing that arrived live is
/// lost.
pub struct CombinedSubscription {
    ctx: SubscriptionContext,
    active: Delegate,
    /// Deliveries the replay released but nobody drained before the swap.
    outbox: Vec<Delivery>,
}

impl CombinedSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        stream: StreamPartition,
        ctx: SubscriptionContext,
        resend: ResendOptions,
    ) -> Self {
        let historical = HistoricalSubscription::new(id, stream, ctx.clone(), resend);
        Self {
            ctx,
            active: Delegate::Historical(historical),
            outbox: Vec::new(),
        }
    }

    /// Whether the replay is over and live delivery has taken over.
    pub fn is_live(&self) -> bool {
        matches!(self.active, Delegate::RealTime(_))
    }

    fn active(&self) -> &dyn Subscription {
        match &self.active {
            Delegate::Historical(sub) => sub as &dyn Subscription,
            Delegate::RealTime(sub) => sub,
        }
    }

    fn active_mut(&mut self) -> &mut dyn Subscription {
        match &mut self.active {
            Delegate::Historical(sub) => sub as &mut dyn Subscription,
            Delegate::RealTime(sub) => sub,
        }
    }

    fn hand_off_if_done(&mut self) {
        let Delegate::Historical(historical) = &mut self.active else {
            return;
        };
        let Some(handoff) = historical.take_handoff() else {
            return;
        };

        let mut realtime = RealTimeSubscription::continuing(
            historical.id(),
            historical.stream().clone(),
            self.ctx.clone(),
            historical.state(),
            handoff.last_delivered,
            handoff.key_wait,
        );
        debug!(
            subscription = %realtime.id(),
            pending = handoff.pending.len(),
            live = handoff.live.len(),
            "handing off to live delivery"
        );
        self.outbox.extend(historical.take_deliveries());
        for message in handoff.pending {
            realtime.handle_message(message, true);
        }
        for message in handoff.live {
            realtime.handle_message(message, false);
        }

        historical.stop();
        self.active = Delegate::RealTime(realtime);
    }
}

impl Subscription for CombinedSubscription {
    fn id(&self) -> SubscriptionId {
        self.active().id()
    }

    fn stream(&self) -> &StreamPartition {
        self.active().stream()
    }

    fn state(&self) -> SubscriptionState {
        self.active().state()
    }

    fn set_state(&mut self, state: SubscriptionState) {
        self.active_mut().set_state(state);
    }

    fn is_resending(&self) -> bool {
        self.active().is_resending()
    }

    fn handle_message(&mut self, message: Message, is_replay: bool) {
        self.active_mut().handle_message(message, is_replay);
    }

    fn handle_replay_started(&mut self, request_id: RequestId) -> Result<()> {
        self.active_mut().handle_replay_started(request_id)
    }

    fn handle_replay_finished(&mut self, request_id: RequestId) -> Result<()> {
        self.active_mut().handle_replay_finished(request_id)?;
        self.hand_off_if_done();
        Ok(())
    }

    fn handle_replay_empty(&mut self, request_id: RequestId) -> Result<()> {
        self.active_mut().handle_replay_empty(request_id)?;
        self.hand_off_if_done();
        Ok(())
    }

    fn handle_disconnected(&mut self) {
        self.active_mut().handle_disconnected();
    }

    fn group_key_available(&mut self, publisher_id: &str) {
        self.active_mut().group_key_available(publisher_id);
    }

    fn tick(&mut self, now: Instant) {
        self.active_mut().tick(now);
    }

    fn report_error(&self, error: ClientError) {
        self.active().report_error(error);
    }

    fn notify(&self, event: SubscriptionEvent) {
        self.active().notify(event);
    }

    fn take_deliveries(&mut self) -> Vec<Delivery> {
        let mut deliveries = std::mem::take(&mut self.outbox);
        deliveries.extend(self.active_mut().take_deliveries());
        deliveries
    }

    fn on_message(&self) -> OnMessage {
        Arc::clone(&self.ctx.on_message)
    }

    fn pending_resend_count(&self) -> usize {
        self.active().pending_resend_count()
    }

    fn stop(&mut self) {
        self.active_mut().stop();
    }
}
