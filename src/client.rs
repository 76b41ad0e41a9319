//! Client tying transport, correlation and subscriptions together.

use crate::error::{ClientError, Result};
use crate::ordering::OrderingConfig;
use crate::requests::RequestCorrelator;
use crate::subscriptions::{
    CombinedSubscription, Delivery, HistoricalSubscription, RealTimeSubscription,
    SharedSubscription, SubscribeOptions, Subscription, SubscriptionContext, SubscriptionEvent,
    SubscriptionHandle, SubscriptionId, SubscriptionManager, SubscriptionState,
};
use crate::transport::{ControlMessage, ControlRequest, Transport};
use crate::types::{RequestId, ResendOptions, StreamPartition};
use crate::verify::{
    AcceptAll, Decryptor, PlaintextDecryptor, VerificationCache, Verifier,
    DEFAULT_VERIFICATION_CACHE_SIZE,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Ordering and gap-fill settings for every subscription.
    pub ordering: OrderingConfig,

    /// Verdicts memoized by the verification cache.
    /// Default: 10000
    pub verification_cache_size: usize,

    /// First request id handed out.
    /// Default: 1
    pub request_id_seed: u64,

    /// First subscription id handed out.
    /// Default: 1
    pub subscription_id_seed: u64,

    /// Max buffered events per channel before events are dropped
    /// (None = unbounded).
    pub event_buffer_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ordering: OrderingConfig::default(),
            verification_cache_size: DEFAULT_VERIFICATION_CACHE_SIZE,
            request_id_seed: 1,
            subscription_id_seed: 1,
            event_buffer_size: None,
        }
    }
}

/// Events not tied to any subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// A reply arrived for a request nobody is waiting on.
    UnexpectedReply {
        request_id: RequestId,
        kind: &'static str,
    },
    /// An error the transport reported without a live request to blame.
    Error(ClientError),
}

/// The ordering engine's entry point.
///
/// The transport feeds inbound traffic through [`Client::handle`] and the
/// connection lifecycle through [`Client::handle_connected`] /
/// [`Client::handle_disconnected`]; the application subscribes and receives
/// ordered deliveries.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    correlator: Arc<RequestCorrelator>,
    verifier: Arc<VerificationCache>,
    decryptor: Arc<dyn Decryptor>,
    subscriptions: SubscriptionManager,
    /// Network-level subscription state per stream.
    streams: Mutex<HashMap<StreamPartition, SubscriptionState>>,
    connected: AtomicBool,
    events: Sender<ClientEvent>,
    receiver: Receiver<ClientEvent>,
}

impl Client {
    /// Create a client that trusts every message and expects plaintext JSON.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, receiver) = channel(config.event_buffer_size);
        Self {
            transport,
            correlator: Arc::new(RequestCorrelator::new(config.request_id_seed)),
            verifier: Arc::new(VerificationCache::new(
                Arc::new(AcceptAll),
                config.verification_cache_size,
            )),
            decryptor: Arc::new(PlaintextDecryptor),
            subscriptions: SubscriptionManager::new(config.subscription_id_seed),
            streams: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            events,
            receiver,
            config,
        }
    }

    /// Use `verifier` for authenticity checks.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Arc::new(VerificationCache::new(
            verifier,
            self.config.verification_cache_size,
        ));
        self
    }

    /// Use `decryptor` to produce content.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Client-level events.
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.receiver.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    pub fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.subscriptions.get(id).map(|sub| sub.lock().state())
    }

    /// Resend requests awaiting replies.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    // --- Application API ---

    /// Subscribe to a stream partition. `on_message` receives content in
    /// chain order.
    ///
    /// While disconnected the subscription waits and is sent on the next
    /// [`handle_connected`](Self::handle_connected).
    pub fn subscribe<F>(
        &self,
        stream: StreamPartition,
        options: SubscribeOptions,
        on_message: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let id = self.subscriptions.next_id();
        let (events, receiver) = channel(self.config.event_buffer_size);
        let ctx = self.context(events, on_message);

        let subscription: Box<dyn Subscription> = match options.resend {
            None => Box::new(RealTimeSubscription::new(id, stream.clone(), ctx, None)),
            Some(resend) if options.handoff => {
                Box::new(CombinedSubscription::new(id, stream.clone(), ctx, resend))
            }
            Some(resend) => Box::new(RealTimeSubscription::new(
                id,
                stream.clone(),
                ctx,
                Some(resend),
            )),
        };
        let shared = self.subscriptions.insert(subscription, true);
        debug!(subscription = %id, %stream, "subscribe");

        if self.is_connected() {
            self.attach(&stream, &shared);
        }

        Ok(SubscriptionHandle { id, receiver })
    }

    /// Replay history without subscribing to live traffic. The subscription
    /// removes itself with [`SubscriptionEvent::Done`] once the replay ends.
    pub fn resend<F>(
        &self,
        stream: StreamPartition,
        options: ResendOptions,
        on_message: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let id = self.subscriptions.next_id();
        let (events, receiver) = channel(self.config.event_buffer_size);
        let ctx = self.context(events, on_message);

        let historical = HistoricalSubscription::new(id, stream.clone(), ctx, options);
        let shared = self.subscriptions.insert(Box::new(historical), false);
        debug!(subscription = %id, %stream, "resend");
        shared.lock().set_state(SubscriptionState::Subscribed);

        Ok(SubscriptionHandle { id, receiver })
    }

    /// End a subscription. Open resend requests are abandoned; late replies
    /// to them surface as [`ClientEvent::UnexpectedReply`].
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let shared = self
            .subscriptions
            .get(id)
            .ok_or(ClientError::SubscriptionNotFound(id.0))?;

        let stream = {
            let mut sub = shared.lock();
            sub.stop();
            sub.stream().clone()
        };

        let networked = self.subscriptions.is_networked(id);
        let last_on_stream = networked
            && self
                .subscriptions
                .networked(&stream)
                .into_iter()
                .filter(|(other, _)| *other != id)
                .all(|(_, sub)| sub.lock().state() == SubscriptionState::Unsubscribing);

        let send_unsubscribe = last_on_stream && self.is_connected() && {
            let mut streams = self.streams.lock();
            match streams.get(&stream) {
                Some(SubscriptionState::Subscribed) | Some(SubscriptionState::Subscribing) => {
                    streams.insert(stream.clone(), SubscriptionState::Unsubscribing);
                    true
                }
                _ => false,
            }
        };

        if !send_unsubscribe {
            self.finalize(id, &shared);
            return Ok(());
        }

        shared.lock().set_state(SubscriptionState::Unsubscribing);
        debug!(subscription = %id, %stream, "unsubscribe");
        if let Err(error) = self.transport.send(ControlRequest::Unsubscribe {
            stream: stream.clone(),
        }) {
            warn!(%stream, %error, "unsubscribe request failed");
            self.streams.lock().remove(&stream);
            shared.lock().report_error(error);
            self.finalize(id, &shared);
        }
        Ok(())
    }

    /// A group key for `publisher_id` became available. A replay-only
    /// subscription that was only waiting on this key completes.
    pub fn group_key_available(&self, publisher_id: &str) {
        for (id, sub) in self.subscriptions.all() {
            let finished = sub.with(|sub| {
                sub.group_key_available(publisher_id);
                sub.is_finished()
            });
            if finished {
                self.complete_replay(id, &sub);
            }
        }
    }

    // --- Transport API ---

    /// The transport (re)connected: subscribe every stream with local
    /// subscribers and restart unfinished replays.
    pub fn handle_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        debug!("connected");

        for stream in self.subscriptions.networked_streams() {
            for (_, sub) in self.subscriptions.networked(&stream) {
                self.attach(&stream, &sub);
            }
        }

        for (_, sub) in self.subscriptions.replay_only() {
            sub.lock().set_state(SubscriptionState::Subscribed);
        }
    }

    /// The transport lost its connection: every subscription resets.
    pub fn handle_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.streams.lock().clear();
        debug!("disconnected");

        for (id, sub) in self.subscriptions.all() {
            let unsubscribing = sub.with(|sub| {
                let unsubscribing = sub.state() == SubscriptionState::Unsubscribing;
                sub.handle_disconnected();
                unsubscribing
            });
            if unsubscribing {
                self.subscriptions.remove(id);
            }
        }
    }

    /// Feed one inbound message from the transport.
    pub fn handle(&self, message: ControlMessage) {
        match message {
            ControlMessage::Broadcast { message } => {
                for (_, sub) in self.subscriptions.networked(&message.stream) {
                    sub.with(|sub| {
                        // Waiting for a connection or on the way out.
                        if matches!(
                            sub.state(),
                            SubscriptionState::Subscribed | SubscriptionState::Subscribing
                        ) {
                            sub.handle_message(message.clone(), false);
                        }
                    });
                }
            }
            ControlMessage::Unicast {
                request_id,
                message,
            } => {
                if let Some((_, sub)) = self.resolve(request_id, "unicast") {
                    sub.with(|sub| sub.handle_message(message, true));
                }
            }
            ControlMessage::SubscribeResponse { stream } => self.on_subscribed(&stream),
            ControlMessage::UnsubscribeResponse { stream } => self.on_unsubscribed(&stream),
            ControlMessage::ResendResponseResending { request_id, .. } => {
                if let Some((_, sub)) = self.resolve(request_id, "resending") {
                    let mut sub = sub.lock();
                    if let Err(error) = sub.handle_replay_started(request_id) {
                        sub.report_error(error);
                    }
                }
            }
            ControlMessage::ResendResponseResent { request_id, .. } => {
                self.on_replay_done(request_id, false, "resent");
            }
            ControlMessage::ResendResponseNoResend { request_id, .. } => {
                self.on_replay_done(request_id, true, "no_resend");
            }
            ControlMessage::ErrorResponse {
                request_id,
                message,
            } => self.on_error_response(request_id, message),
        }
    }

    /// Fire due gap timers on every subscription.
    pub fn tick(&self, now: Instant) {
        for (_, sub) in self.subscriptions.all() {
            sub.with(|sub| sub.tick(now));
        }
    }

    /// Drive [`tick`](Self::tick) from a background thread every `interval`.
    ///
    /// The thread holds a weak reference, so it never keeps the client
    /// alive; dropping the returned guard stops and joins it.
    pub fn start_gap_timer(self: &Arc<Self>, interval: Duration) -> Result<GapTimer> {
        let client = Arc::downgrade(self);
        let (stop, stopped) = bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("orderly-gap-timer".to_string())
            .spawn(move || run_gap_timer(client, interval, stopped))
            .map_err(|e| ClientError::InvalidOperation(format!("failed to start gap timer: {e}")))?;

        Ok(GapTimer {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    // --- Internals ---

    fn context<F>(&self, events: Sender<SubscriptionEvent>, on_message: F) -> SubscriptionContext
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        SubscriptionContext {
            transport: Arc::clone(&self.transport),
            correlator: Arc::clone(&self.correlator),
            verifier: Arc::clone(&self.verifier),
            decryptor: Arc::clone(&self.decryptor),
            ordering: self.config.ordering.clone(),
            events,
            on_message: Arc::new(on_message),
        }
    }

    /// Join `sub` to the network subscription of `stream`, sending one if
    /// none is active or pending.
    fn attach(&self, stream: &StreamPartition, sub: &SharedSubscription) {
        let (state, send) = {
            let mut streams = self.streams.lock();
            match streams.get(stream) {
                Some(SubscriptionState::Subscribed) => (SubscriptionState::Subscribed, false),
                Some(SubscriptionState::Subscribing) => (SubscriptionState::Subscribing, false),
                _ => {
                    streams.insert(stream.clone(), SubscriptionState::Subscribing);
                    (SubscriptionState::Subscribing, true)
                }
            }
        };

        sub.lock().set_state(state);
        if !send {
            return;
        }

        if let Err(error) = self.transport.send(ControlRequest::Subscribe {
            stream: stream.clone(),
        }) {
            warn!(%stream, %error, "subscribe request failed");
            self.streams.lock().remove(stream);
            let mut sub = sub.lock();
            sub.set_state(SubscriptionState::Unsubscribed);
            sub.report_error(error);
        }
    }

    fn on_subscribed(&self, stream: &StreamPartition) {
        self.streams
            .lock()
            .insert(stream.clone(), SubscriptionState::Subscribed);
        for (_, sub) in self.subscriptions.networked(stream) {
            let mut sub = sub.lock();
            if sub.state() == SubscriptionState::Subscribing {
                sub.set_state(SubscriptionState::Subscribed);
            }
        }
    }

    fn on_unsubscribed(&self, stream: &StreamPartition) {
        {
            let mut streams = self.streams.lock();
            if streams.get(stream) == Some(&SubscriptionState::Unsubscribing) {
                streams.remove(stream);
            }
        }
        for (id, sub) in self.subscriptions.networked(stream) {
            if sub.lock().state() == SubscriptionState::Unsubscribing {
                self.finalize(id, &sub);
            }
        }
    }

    fn on_replay_done(&self, request_id: RequestId, empty: bool, kind: &'static str) {
        let Some((id, sub)) = self.resolve(request_id, kind) else {
            return;
        };

        let finished = sub.with(|sub| {
            let result = if empty {
                sub.handle_replay_empty(request_id)
            } else {
                sub.handle_replay_finished(request_id)
            };
            if let Err(error) = result {
                sub.report_error(error);
            }
            sub.is_finished()
        });

        if finished {
            self.complete_replay(id, &sub);
        }
    }

    fn on_error_response(&self, request_id: Option<RequestId>, message: String) {
        let error = ClientError::Transport(message);
        let Some(request_id) = request_id else {
            warn!(%error, "error response");
            self.emit(ClientEvent::Error(error));
            return;
        };
        let Some((_, sub)) = self.resolve(request_id, "error") else {
            return;
        };

        sub.lock().report_error(error);
        // A failed replay ends like an empty one, so nothing waits on it.
        self.on_replay_done(request_id, true, "error");
    }

    /// A replay-only subscription completed.
    fn complete_replay(&self, id: SubscriptionId, sub: &SharedSubscription) {
        let mut sub = sub.lock();
        sub.stop();
        sub.notify(SubscriptionEvent::Done);
        drop(sub);
        self.subscriptions.remove(id);
        debug!(subscription = %id, "replay complete");
    }

    fn finalize(&self, id: SubscriptionId, sub: &SharedSubscription) {
        sub.lock().set_state(SubscriptionState::Unsubscribed);
        self.subscriptions.remove(id);
    }

    fn resolve(
        &self,
        request_id: RequestId,
        kind: &'static str,
    ) -> Option<(SubscriptionId, SharedSubscription)> {
        let found = self
            .correlator
            .resolve(request_id)
            .ok()
            .and_then(|id| self.subscriptions.get(id).map(|sub| (id, sub)));
        if found.is_none() {
            self.emit(ClientEvent::UnexpectedReply { request_id, kind });
        }
        found
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(?event, "client event buffer full, dropping event");
        }
    }
}

/// Background driver for gap timers. Stops when dropped.
pub struct GapTimer {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GapTimer {
    /// Stop the timer thread and wait for it.
    pub fn stop(self) {
        drop(self);
    }

    /// Whether the timer thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for GapTimer {
    fn drop(&mut self) {
        // Disconnecting the stop channel wakes the thread.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_gap_timer(client: Weak<Client>, interval: Duration, stopped: Receiver<()>) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> now => {
                let (Ok(now), Some(client)) = (now, client.upgrade()) else {
                    break;
                };
                client.tick(now);
            }
            recv(stopped) -> _ => break,
        }
    }
}

fn channel<T>(size: Option<usize>) -> (Sender<T>, Receiver<T>) {
    match size {
        Some(size) => bounded(size),
        None => unbounded(),
    }
}
