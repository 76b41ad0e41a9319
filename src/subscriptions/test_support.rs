//! Fixtures for subscription unit tests.

use crate::ordering::OrderingConfig;
use crate::requests::RequestCorrelator;
use crate::transport::{ChannelTransport, ControlRequest};
use crate::types::{ChainKey, Message, MessageRef, RequestId, StreamPartition};
use crate::verify::{AcceptAll, PlaintextDecryptor, VerificationCache};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::sync::Arc;

use super::shared::SubscriptionContext;
use super::subscription::Subscription;
use super::types::SubscriptionEvent;

pub(crate) struct Fixture {
    pub ctx: SubscriptionContext,
    pub requests: Receiver<ControlRequest>,
    pub events: Receiver<SubscriptionEvent>,
    pub delivered: Arc<Mutex<Vec<i64>>>,
}

impl Fixture {
    pub fn new() -> Self {
        let (transport, requests) = ChannelTransport::new();
        let (events_tx, events) = unbounded();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);

        let ctx = SubscriptionContext {
            transport: Arc::new(transport),
            correlator: Arc::new(RequestCorrelator::default()),
            verifier: Arc::new(VerificationCache::new(Arc::new(AcceptAll), 128)),
            decryptor: Arc::new(PlaintextDecryptor),
            ordering: OrderingConfig::default(),
            events: events_tx,
            on_message: Arc::new(move |delivery| {
                sink.lock().push(delivery.message.msg_ref.timestamp);
            }),
        };

        Self {
            ctx,
            requests,
            events,
            delivered,
        }
    }

    /// Hand `sub`'s released deliveries to its callback, then list every
    /// timestamp delivered so far.
    pub fn delivered<S: Subscription>(&self, sub: &mut S) -> Vec<i64> {
        let on_message = sub.on_message();
        for delivery in sub.take_deliveries() {
            on_message(delivery);
        }
        self.delivered.lock().clone()
    }

    pub fn events(&self) -> Vec<SubscriptionEvent> {
        self.events.try_iter().collect()
    }

    /// Request id of the next resend sent through the transport.
    pub fn next_resend(&self) -> Option<RequestId> {
        self.requests.try_iter().find_map(|request| match request {
            ControlRequest::Resend { request_id, .. } => Some(request_id),
            _ => None,
        })
    }
}

pub(crate) fn stream() -> StreamPartition {
    StreamPartition::new("stream", 0)
}

pub(crate) fn msg(ts: i64, prev: Option<i64>) -> Message {
    chain_msg("publisher", ts, prev)
}

pub(crate) fn chain_msg(publisher: &str, ts: i64, prev: Option<i64>) -> Message {
    Message::new(
        stream(),
        &ChainKey::new(publisher, "chain"),
        MessageRef::new(ts, 0),
        prev.map(|p| MessageRef::new(p, 0)),
        format!("{{\"n\":{}}}", ts).into_bytes(),
    )
}
