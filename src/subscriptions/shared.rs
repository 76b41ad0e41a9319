//! State and behavior shared by every subscription variant.

use crate::error::{ClientError, Result};
use crate::ordering::{GapAction, MessageOrdering, OrderingConfig};
use crate::requests::RequestCorrelator;
use crate::transport::{ControlRequest, Transport};
use crate::types::{ChainKey, Message, MessageRef, RequestId, ResendOptions, StreamPartition};
use crate::verify::{DecryptError, Decryptor, Verdict, VerificationCache};
use crossbeam_channel::{Sender, TrySendError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::types::{Delivery, OnMessage, SubscriptionEvent, SubscriptionId, SubscriptionState};

/// Collaborators a subscription needs. Cheap to clone; a combined
/// subscription hands the same context to both of its delegates.
#[derive(Clone)]
pub(crate) struct SubscriptionContext {
    pub transport: Arc<dyn Transport>,
    pub correlator: Arc<RequestCorrelator>,
    pub verifier: Arc<VerificationCache>,
    pub decryptor: Arc<dyn Decryptor>,
    pub ordering: OrderingConfig,
    pub events: Sender<SubscriptionEvent>,
    pub on_message: OnMessage,
}

pub(crate) struct SubscriptionCore {
    pub id: SubscriptionId,
    pub stream: StreamPartition,
    pub ctx: SubscriptionContext,
    pub state: SubscriptionState,
    pub resending: bool,
    /// Replay requested when the subscription first becomes subscribed.
    initial_resend: Option<ResendOptions>,
    initial_request: Option<RequestId>,
    initial_done: bool,
    pending_resends: HashSet<RequestId>,
    /// Live messages held back while resending, in arrival order.
    live_queue: VecDeque<Message>,
    pub ordering: MessageOrdering,
    /// In-order messages waiting for their publisher's key.
    key_wait: KeyWait,
    /// Deliveries not yet handed to the callback, in order.
    outbox: Vec<Delivery>,
}

/// Messages held per publisher until its group key arrives.
pub(crate) type KeyWait = HashMap<String, VecDeque<Message>>;

impl SubscriptionCore {
    pub fn new(
        id: SubscriptionId,
        stream: StreamPartition,
        ctx: SubscriptionContext,
        initial_resend: Option<ResendOptions>,
    ) -> Self {
        let ordering = MessageOrdering::new(ctx.ordering.clone());
        Self {
            id,
            stream,
            ctx,
            state: SubscriptionState::Unsubscribed,
            resending: false,
            initial_done: initial_resend.is_none(),
            initial_resend,
            initial_request: None,
            pending_resends: HashSet::new(),
            live_queue: VecDeque::new(),
            ordering,
            key_wait: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    pub fn emit(&self, event: SubscriptionEvent) {
        match self.ctx.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(subscription = %self.id, ?event, "event buffer full, dropping event");
            }
            // Nobody is listening.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn report(&self, error: ClientError) {
        warn!(subscription = %self.id, %error, "subscription error");
        self.emit(SubscriptionEvent::Error(error));
    }

    pub fn set_state(&mut self, state: SubscriptionState) {
        if self.state == state {
            return;
        }
        debug!(subscription = %self.id, from = ?self.state, to = ?state, "state change");
        self.state = state;

        match state {
            SubscriptionState::Subscribed => {
                self.emit(SubscriptionEvent::Subscribed);
                self.start_initial_resend();
            }
            SubscriptionState::Unsubscribed => self.emit(SubscriptionEvent::Unsubscribed),
            SubscriptionState::Subscribing | SubscriptionState::Unsubscribing => {}
        }
    }

    fn start_initial_resend(&mut self) {
        if self.initial_done || self.initial_request.is_some() {
            return;
        }
        let Some(options) = self.initial_resend.clone() else {
            return;
        };
        if let Some(id) = self.request_resend(options) {
            self.initial_request = Some(id);
            self.resending = true;
        }
    }

    /// Whether `request_id` is the replay requested on subscribe.
    pub fn is_initial(&self, request_id: RequestId) -> bool {
        self.initial_request == Some(request_id)
    }

    /// Open a resend request and send it. Send failures are reported as
    /// events and the request is closed again.
    pub fn request_resend(&mut self, options: ResendOptions) -> Option<RequestId> {
        let request_id = self
            .ctx
            .correlator
            .register(self.id, &mut self.pending_resends);
        let request = ControlRequest::Resend {
            stream: self.stream.clone(),
            request_id,
            options,
        };

        match self.ctx.transport.send(request) {
            Ok(()) => {
                debug!(subscription = %self.id, %request_id, "resend requested");
                Some(request_id)
            }
            Err(error) => {
                self.pending_resends.remove(&request_id);
                self.ctx.correlator.forget(request_id);
                self.report(error);
                None
            }
        }
    }

    fn expect_pending(&self, kind: &'static str, request_id: RequestId) -> Result<()> {
        if self.pending_resends.contains(&request_id) {
            Ok(())
        } else {
            Err(ClientError::UnexpectedResponse { kind, request_id })
        }
    }

    pub fn replay_started(&mut self, request_id: RequestId) -> Result<()> {
        self.expect_pending("resending", request_id)?;
        self.emit(SubscriptionEvent::Resending { request_id });
        Ok(())
    }

    /// Close a finished replay. Leaves `resending` to the caller.
    pub fn replay_done(&mut self, request_id: RequestId, empty: bool) -> Result<()> {
        let kind = if empty { "no_resend" } else { "resent" };
        self.expect_pending(kind, request_id)?;

        self.pending_resends.remove(&request_id);
        self.ctx.correlator.forget(request_id);
        if self.is_initial(request_id) {
            self.initial_done = true;
            self.initial_request = None;
        }

        let event = if empty {
            SubscriptionEvent::NoResend { request_id }
        } else {
            SubscriptionEvent::Resent { request_id }
        };
        self.emit(event);
        Ok(())
    }

    pub fn queue_live(&mut self, message: Message) {
        trace!(subscription = %self.id, msg_ref = %message.msg_ref, "queueing live message");
        self.live_queue.push_back(message);
    }

    pub fn take_live_queue(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.live_queue)
    }

    /// Route held-back live messages in arrival order.
    pub fn flush_live_queue(&mut self, now: Instant) {
        while let Some(message) = self.live_queue.pop_front() {
            self.route(message, now);
        }
    }

    /// Verify a message and push it through ordering to the application.
    pub fn route(&mut self, message: Message, now: Instant) {
        match self.ctx.verifier.verify(&message) {
            Verdict::Valid => {
                let ready = self.ordering.add(message, now);
                self.deliver_all(ready);
            }
            Verdict::Invalid(reason) => {
                self.report(ClientError::Verification(format!(
                    "{} on {}: {}",
                    message.msg_ref,
                    message.chain_key(),
                    reason
                )));
            }
            Verdict::Malformed(reason) => {
                let ready = self.ordering.add_error(&message, now);
                self.report(ClientError::MalformedPayload(format!(
                    "{} on {}: {}",
                    message.msg_ref,
                    message.chain_key(),
                    reason
                )));
                self.deliver_all(ready);
            }
        }
    }

    /// Seed ordering with refs delivered by a previous delegate.
    pub fn seed(&mut self, last_delivered: HashMap<ChainKey, MessageRef>, now: Instant) {
        for (chain, msg_ref) in last_delivered {
            let ready = self.ordering.mark_delivered(chain, msg_ref, now);
            self.deliver_all(ready);
        }
    }

    fn deliver_all(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.deliver(message);
        }
    }

    fn deliver(&mut self, message: Message) {
        // Keep per-publisher order behind a missing key.
        if let Some(queue) = self.key_wait.get_mut(&message.publisher_id) {
            queue.push_back(message);
            return;
        }

        match self.ctx.decryptor.decrypt(&message) {
            Ok(content) => self.outbox.push(Delivery { content, message }),
            Err(DecryptError::KeyMissing) => {
                debug!(
                    subscription = %self.id,
                    publisher = %message.publisher_id,
                    "group key missing, holding messages"
                );
                self.key_wait
                    .entry(message.publisher_id.clone())
                    .or_default()
                    .push_back(message);
            }
            Err(DecryptError::Failed(reason)) => {
                self.report(ClientError::Decryption(format!(
                    "{} on {}: {}",
                    message.msg_ref,
                    message.chain_key(),
                    reason
                )));
            }
        }
    }

    /// Deliveries released since the last call, for the caller to hand to
    /// the callback once no lock is held.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_key_wait(&self) -> bool {
        !self.key_wait.is_empty()
    }

    pub fn take_key_wait(&mut self) -> KeyWait {
        std::mem::take(&mut self.key_wait)
    }

    /// Adopt messages another delegate held for missing keys. They stay
    /// ahead of anything this core delivers for the same publishers.
    pub fn restore_key_wait(&mut self, key_wait: KeyWait) {
        for (publisher, mut queue) in key_wait {
            let waiting = self.key_wait.entry(publisher).or_default();
            queue.extend(waiting.drain(..));
            *waiting = queue;
        }
    }

    /// Retry messages held for `publisher_id`'s key.
    pub fn group_key_available(&mut self, publisher_id: &str) {
        let Some(mut queue) = self.key_wait.remove(publisher_id) else {
            return;
        };
        while let Some(message) = queue.pop_front() {
            self.deliver(message);
            if self.key_wait.contains_key(publisher_id) {
                // Still missing; the rest stays queued behind it.
                if let Some(waiting) = self.key_wait.get_mut(publisher_id) {
                    waiting.extend(queue.drain(..));
                }
                return;
            }
        }
    }

    /// Fire due gap timers, requesting fills or reporting failed chains.
    pub fn tick(&mut self, now: Instant) {
        for action in self.ordering.tick(now) {
            match action {
                GapAction::Request(gap) => {
                    self.emit(SubscriptionEvent::Gap(gap.clone()));
                    self.request_resend(ResendOptions::Range {
                        from: gap.from,
                        to: gap.to,
                        publisher_id: gap.chain.publisher_id,
                        msg_chain_id: gap.chain.msg_chain_id,
                    });
                }
                GapAction::Failed(gap) => {
                    self.report(ClientError::GapFillFailed {
                        chain: gap.chain,
                        from: gap.from,
                        to: gap.to,
                    });
                }
                GapAction::Released(messages) => self.deliver_all(messages),
            }
        }
    }

    /// Close every open request. Late replies then correlate to nothing.
    pub fn abandon_requests(&mut self) {
        self.ctx
            .correlator
            .forget_all(self.pending_resends.drain());
        self.initial_request = None;
    }

    pub fn pending_resend_count(&self) -> usize {
        self.pending_resends.len()
    }

    /// Abrupt reset on transport loss.
    pub fn disconnect(&mut self) {
        self.abandon_requests();
        self.resending = false;
        self.set_state(SubscriptionState::Unsubscribed);
    }

    /// Cancel timers and drop everything held. Deliveries already released
    /// stay in the outbox.
    pub fn stop(&mut self) {
        self.ordering.clear();
        self.abandon_requests();
        self.live_queue.clear();
        self.key_wait.clear();
    }
}
