//! End-to-end tests driving the client through a channel transport.

use orderly::{
    ChainKey, ChannelTransport, Client, ClientConfig, ClientEvent, ControlMessage, ControlRequest,
    Message, MessageRef, RequestId, ResendOptions, StreamPartition, SubscribeOptions,
    SubscriptionEvent, SubscriptionState,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    client: Arc<Client>,
    requests: Receiver<ControlRequest>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    fn with_config(config: ClientConfig) -> Self {
        init_tracing();
        let (transport, requests) = ChannelTransport::new();
        let client = Arc::new(Client::new(config, Arc::new(transport)));
        client.handle_connected();
        Self { client, requests }
    }

    fn sent(&self) -> Vec<ControlRequest> {
        self.requests.try_iter().collect()
    }

    /// Request id of the next resend sent, skipping other requests.
    fn next_resend(&self) -> RequestId {
        self.sent()
            .into_iter()
            .find_map(|request| match request {
                ControlRequest::Resend { request_id, .. } => Some(request_id),
                _ => None,
            })
            .expect("no resend request sent")
    }

    fn broadcast(&self, message: Message) {
        self.client.handle(ControlMessage::Broadcast { message });
    }

    fn unicast(&self, request_id: RequestId, message: Message) {
        self.client.handle(ControlMessage::Unicast {
            request_id,
            message,
        });
    }

    fn resent(&self, stream: StreamPartition, request_id: RequestId) {
        self.client
            .handle(ControlMessage::ResendResponseResent { stream, request_id });
    }

    fn acknowledge(&self, stream: StreamPartition) {
        self.client
            .handle(ControlMessage::SubscribeResponse { stream });
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn stream() -> StreamPartition {
    StreamPartition::new("sensors", 0)
}

fn message(stream: &StreamPartition, publisher: &str, ts: i64, prev: Option<i64>) -> Message {
    Message::new(
        stream.clone(),
        &ChainKey::new(publisher, "chain"),
        MessageRef::new(ts, 0),
        prev.map(|p| MessageRef::new(p, 0)),
        format!("{{\"n\":{ts}}}").into_bytes(),
    )
}

fn msg(ts: i64, prev: Option<i64>) -> Message {
    message(&stream(), "alice", ts, prev)
}

/// Collects `content.n` of every delivery.
fn sink() -> (Arc<Mutex<Vec<i64>>>, impl Fn(orderly::Delivery) + Send + Sync + 'static) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let target = Arc::clone(&delivered);
    let callback = move |delivery: orderly::Delivery| {
        let n = delivery.content["n"].as_i64().unwrap_or(-1);
        target.lock().push(n);
    };
    (delivered, callback)
}

// --- Live Ordering ---

#[test]
fn test_live_messages_delivered_in_chain_order() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());

    harness.broadcast(msg(1, None));
    harness.broadcast(msg(3, Some(2)));
    harness.broadcast(msg(2, Some(1)));
    harness.broadcast(msg(2, Some(1)));
    harness.broadcast(msg(4, Some(3)));

    assert_eq!(*delivered.lock(), vec![1, 2, 3, 4]);
    assert_eq!(
        harness.client.subscription_state(handle.id),
        Some(SubscriptionState::Subscribed)
    );
    assert_eq!(handle.drain(), vec![SubscriptionEvent::Subscribed]);
}

#[test]
fn test_chains_do_not_block_each_other() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());

    harness.broadcast(message(&stream(), "alice", 1, None));
    harness.broadcast(message(&stream(), "alice", 3, Some(2)));
    harness.broadcast(message(&stream(), "bob", 10, None));
    harness.broadcast(message(&stream(), "bob", 11, Some(10)));

    assert_eq!(*delivered.lock(), vec![1, 10, 11]);
}

#[test]
fn test_gap_filled_by_range_resend() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());
    harness.sent();

    harness.broadcast(msg(1, None));
    harness.broadcast(msg(4, Some(3)));

    // Nothing is requested before the gap timer fires.
    harness.client.tick(Instant::now());
    assert!(harness.sent().is_empty());

    harness.client.tick(Instant::now() + Duration::from_secs(6));
    let requests = harness.sent();
    assert_eq!(requests.len(), 1);
    let ControlRequest::Resend {
        request_id,
        options: ResendOptions::Range {
            from,
            to,
            publisher_id,
            msg_chain_id,
        },
        ..
    } = requests[0].clone()
    else {
        panic!("expected range resend, got {:?}", requests[0]);
    };
    assert_eq!(from, MessageRef::new(1, 1));
    assert_eq!(to, MessageRef::new(3, 0));
    assert_eq!(publisher_id, "alice");
    assert_eq!(msg_chain_id, "chain");

    harness.client.handle(ControlMessage::ResendResponseResending {
        stream: stream(),
        request_id,
    });
    harness.unicast(request_id, msg(2, Some(1)));
    harness.unicast(request_id, msg(3, Some(2)));
    harness.resent(stream(), request_id);

    assert_eq!(*delivered.lock(), vec![1, 2, 3, 4]);
    assert_eq!(harness.client.pending_requests(), 0);

    let events = handle.drain();
    assert!(events.iter().any(|e| matches!(e, SubscriptionEvent::Gap(_))));
    assert!(events.contains(&SubscriptionEvent::Resent { request_id }));
}

#[test]
fn test_live_subscriber_joins_running_chain() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());
    harness.sent();

    for ts in 100..110 {
        harness.broadcast(msg(ts, Some(ts - 1)));
    }

    assert_eq!(*delivered.lock(), (100..110).collect::<Vec<_>>());
    harness.client.tick(Instant::now() + Duration::from_secs(60));
    assert!(harness.sent().is_empty());
}

// --- Resend and Handoff ---

#[test]
fn test_resend_then_live_without_loss_or_duplicates() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(
            stream(),
            SubscribeOptions::with_resend(ResendOptions::Last { count: 3 }),
            on_message,
        )
        .unwrap();

    assert_eq!(
        harness.sent(),
        vec![ControlRequest::Subscribe { stream: stream() }]
    );
    harness.acknowledge(stream());
    let request_id = harness.next_resend();

    harness.client.handle(ControlMessage::ResendResponseResending {
        stream: stream(),
        request_id,
    });
    harness.unicast(request_id, msg(3, Some(2)));
    // Live traffic overlapping the replay.
    harness.broadcast(msg(5, Some(4)));
    harness.broadcast(msg(4, Some(3)));
    harness.unicast(request_id, msg(4, Some(3)));
    harness.broadcast(msg(6, Some(5)));
    harness.resent(stream(), request_id);

    assert_eq!(*delivered.lock(), vec![3, 4, 5, 6]);

    harness.broadcast(msg(7, Some(6)));
    assert_eq!(*delivered.lock(), vec![3, 4, 5, 6, 7]);

    assert_eq!(
        handle.drain(),
        vec![
            SubscriptionEvent::Subscribed,
            SubscriptionEvent::Resending { request_id },
            SubscriptionEvent::Resent { request_id },
        ]
    );
}

#[test]
fn test_empty_resend_goes_live() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(
            stream(),
            SubscribeOptions::with_resend(ResendOptions::From {
                from: MessageRef::new(100, 0),
                publisher_id: None,
            }),
            on_message,
        )
        .unwrap();
    harness.acknowledge(stream());
    let request_id = harness.next_resend();

    harness.broadcast(msg(1, None));
    assert!(delivered.lock().is_empty());

    harness
        .client
        .handle(ControlMessage::ResendResponseNoResend {
            stream: stream(),
            request_id,
        });
    harness.broadcast(msg(2, Some(1)));

    assert_eq!(*delivered.lock(), vec![1, 2]);
    assert!(handle
        .drain()
        .contains(&SubscriptionEvent::NoResend { request_id }));
}

#[test]
fn test_inline_resend_queues_live_traffic() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let options = SubscribeOptions {
        resend: Some(ResendOptions::Last { count: 2 }),
        handoff: false,
    };
    harness
        .client
        .subscribe(stream(), options, on_message)
        .unwrap();
    harness.acknowledge(stream());
    let request_id = harness.next_resend();

    harness.unicast(request_id, msg(1, None));
    harness.broadcast(msg(3, Some(2)));
    harness.unicast(request_id, msg(2, Some(1)));
    assert_eq!(*delivered.lock(), vec![1, 2]);

    harness.resent(stream(), request_id);
    assert_eq!(*delivered.lock(), vec![1, 2, 3]);
}

#[test]
fn test_concurrent_resends_are_correlated() {
    let harness = Harness::new();
    let other = StreamPartition::new("sensors", 1);

    let (first, on_first) = sink();
    let (second, on_second) = sink();
    harness
        .client
        .subscribe(
            stream(),
            SubscribeOptions::with_resend(ResendOptions::Last { count: 5 }),
            on_first,
        )
        .unwrap();
    harness
        .client
        .subscribe(
            other.clone(),
            SubscribeOptions::with_resend(ResendOptions::Last { count: 5 }),
            on_second,
        )
        .unwrap();
    harness.acknowledge(stream());
    let first_request = harness.next_resend();
    harness.acknowledge(other.clone());
    let second_request = harness.next_resend();
    assert_ne!(first_request, second_request);

    harness.unicast(second_request, message(&other, "bob", 20, None));
    harness.unicast(first_request, msg(10, None));
    harness.unicast(second_request, message(&other, "bob", 21, Some(20)));
    harness.resent(other, second_request);
    harness.resent(stream(), first_request);

    assert_eq!(*first.lock(), vec![10]);
    assert_eq!(*second.lock(), vec![20, 21]);
    assert_eq!(harness.client.pending_requests(), 0);
}

#[test]
fn test_replay_only_resend_completes() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .resend(stream(), ResendOptions::Last { count: 2 }, on_message)
        .unwrap();

    // No network subscription, just the replay.
    let requests = harness.sent();
    assert_eq!(requests.len(), 1);
    let ControlRequest::Resend { request_id, .. } = requests[0].clone() else {
        panic!("expected resend, got {:?}", requests[0]);
    };

    // Live traffic on the stream does not reach a replay-only subscription.
    harness.broadcast(msg(9, Some(8)));
    harness.unicast(request_id, msg(7, Some(6)));
    harness.unicast(request_id, msg(8, Some(7)));
    harness.resent(stream(), request_id);

    assert_eq!(*delivered.lock(), vec![7, 8]);
    assert_eq!(harness.client.subscription_count(), 0);
    assert_eq!(handle.drain().last(), Some(&SubscriptionEvent::Done));
}

// --- Lifecycle ---

#[test]
fn test_unsubscribe_during_resend_rejects_late_replies() {
    let harness = Harness::new();
    let events = harness.client.events();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(
            stream(),
            SubscribeOptions::with_resend(ResendOptions::Last { count: 3 }),
            on_message,
        )
        .unwrap();
    harness.acknowledge(stream());
    let request_id = harness.next_resend();

    harness.client.unsubscribe(handle.id).unwrap();
    assert_eq!(
        harness.sent(),
        vec![ControlRequest::Unsubscribe { stream: stream() }]
    );
    assert_eq!(harness.client.pending_requests(), 0);

    harness.unicast(request_id, msg(1, None));
    harness.resent(stream(), request_id);
    assert!(delivered.lock().is_empty());

    let client_events: Vec<_> = events.try_iter().collect();
    assert_eq!(
        client_events,
        vec![
            ClientEvent::UnexpectedReply {
                request_id,
                kind: "unicast"
            },
            ClientEvent::UnexpectedReply {
                request_id,
                kind: "resent"
            },
        ]
    );

    harness
        .client
        .handle(ControlMessage::UnsubscribeResponse { stream: stream() });
    assert_eq!(harness.client.subscription_count(), 0);
    assert_eq!(handle.drain().last(), Some(&SubscriptionEvent::Unsubscribed));
}

#[test]
fn test_reconnect_resubscribes() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    let handle = harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());
    harness.broadcast(msg(1, None));
    harness.broadcast(msg(3, Some(2)));
    harness.sent();

    harness.client.handle_disconnected();
    assert!(!harness.client.is_connected());
    assert_eq!(
        harness.client.subscription_state(handle.id),
        Some(SubscriptionState::Unsubscribed)
    );

    harness.client.handle_connected();
    assert_eq!(
        harness.sent(),
        vec![ControlRequest::Subscribe { stream: stream() }]
    );
    harness.acknowledge(stream());

    // Ordering state survives the reconnect.
    harness.broadcast(msg(2, Some(1)));
    assert_eq!(*delivered.lock(), vec![1, 2, 3]);

    assert_eq!(
        handle.drain(),
        vec![
            SubscriptionEvent::Subscribed,
            SubscriptionEvent::Unsubscribed,
            SubscriptionEvent::Subscribed,
        ]
    );
}

#[test]
fn test_reconnect_restarts_unfinished_replay() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    harness
        .client
        .subscribe(
            stream(),
            SubscribeOptions::with_resend(ResendOptions::Last { count: 3 }),
            on_message,
        )
        .unwrap();
    harness.acknowledge(stream());
    let first = harness.next_resend();
    harness.unicast(first, msg(1, None));

    harness.client.handle_disconnected();
    harness.client.handle_connected();
    harness.acknowledge(stream());
    let second = harness.next_resend();
    assert_ne!(first, second);

    // The abandoned request no longer reaches the subscription.
    harness.resent(stream(), first);
    harness.unicast(second, msg(1, None));
    harness.unicast(second, msg(2, Some(1)));
    harness.resent(stream(), second);
    harness.broadcast(msg(3, Some(2)));

    assert_eq!(*delivered.lock(), vec![1, 2, 3]);
}

#[test]
fn test_callback_can_unsubscribe_its_own_subscription() {
    let harness = Harness::new();
    let client = Arc::clone(&harness.client);
    let own_id = Arc::new(Mutex::new(None));
    let (delivered, record) = sink();

    let weak = Arc::downgrade(&client);
    let id_slot = Arc::clone(&own_id);
    let handle = client
        .subscribe(stream(), SubscribeOptions::live(), move |delivery| {
            record(delivery);
            let id = *id_slot.lock();
            if let (Some(client), Some(id)) = (weak.upgrade(), id) {
                let _ = client.unsubscribe(id);
            }
        })
        .unwrap();
    *own_id.lock() = Some(handle.id);
    harness.acknowledge(stream());
    harness.sent();

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let worker = Arc::clone(&client);
    std::thread::spawn(move || {
        worker.handle(ControlMessage::Broadcast {
            message: msg(1, None),
        });
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("broadcast did not return");

    assert_eq!(*delivered.lock(), vec![1]);
    assert_eq!(
        harness.sent(),
        vec![ControlRequest::Unsubscribe { stream: stream() }]
    );

    harness.broadcast(msg(2, Some(1)));
    assert_eq!(*delivered.lock(), vec![1]);
}

#[test]
fn test_deliveries_from_threads_stay_in_order() {
    let harness = Harness::new();
    let (delivered, on_message) = sink();
    harness
        .client
        .subscribe(stream(), SubscribeOptions::live(), on_message)
        .unwrap();
    harness.acknowledge(stream());
    harness.broadcast(msg(1, None));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let client = Arc::clone(&harness.client);
            std::thread::spawn(move || {
                for ts in (2..=200).filter(|ts| ts % 4 == worker) {
                    client.handle(ControlMessage::Broadcast {
                        message: msg(ts, Some(ts - 1)),
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*delivered.lock(), (1..=200).collect::<Vec<_>>());
}

#[test]
fn test_gap_timer_thread_stops_with_guard() {
    let harness = Harness::new();
    let timer = harness
        .client
        .start_gap_timer(Duration::from_millis(5))
        .unwrap();
    drop(timer);
    assert_eq!(Arc::strong_count(&harness.client), 1);
}
