//! Registry of live subscriptions.

use crate::types::StreamPartition;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::subscription::Subscription;
use super::types::SubscriptionId;

/// A registered subscription.
pub type SharedSubscription = Arc<SubscriptionSlot>;

/// A subscription behind its single-writer lock, plus the lock that keeps
/// its callback invocations in order.
///
/// The callback never runs while the subscription lock is held, so it may
/// call back into the client, including to unsubscribe itself.
pub struct SubscriptionSlot {
    subscription: Mutex<Box<dyn Subscription>>,
    /// Set while this thread is handing out deliveries.
    dispatching: ReentrantMutex<Cell<bool>>,
}

impl SubscriptionSlot {
    fn new(subscription: Box<dyn Subscription>) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            dispatching: ReentrantMutex::new(Cell::new(false)),
        }
    }

    /// Lock the subscription. Deliveries it releases wait in its outbox
    /// until [`dispatch`](Self::dispatch).
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Subscription>> {
        self.subscription.lock()
    }

    /// Run `f` on the subscription, then hand out what it released.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Subscription) -> R) -> R {
        let result = {
            let mut subscription = self.lock();
            f(&mut **subscription)
        };
        self.dispatch();
        result
    }

    /// Hand released deliveries to the callback, outside the subscription
    /// lock.
    ///
    /// Batches are drained and delivered under the dispatch lock, so two
    /// threads cannot interleave one subscription's deliveries. A callback
    /// that re-enters on the same thread only queues; the outer loop
    /// delivers what it released.
    pub fn dispatch(&self) {
        let dispatching = self.dispatching.lock();
        if dispatching.replace(true) {
            return;
        }
        let _reset = ResetOnDrop(&dispatching);

        loop {
            let (deliveries, on_message) = {
                let mut subscription = self.lock();
                (subscription.take_deliveries(), subscription.on_message())
            };
            if deliveries.is_empty() {
                break;
            }
            for delivery in deliveries {
                on_message(delivery);
            }
        }
    }
}

/// Clears the dispatching flag even if a callback panics.
struct ResetOnDrop<'a>(&'a Cell<bool>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

struct Entry {
    stream: StreamPartition,
    /// Whether the subscription rides on a network subscription to its
    /// stream. Replay-only subscriptions do not.
    networked: bool,
    subscription: SharedSubscription,
}

/// Tracks subscriptions by id and by stream.
///
/// The registry lock is only held to look entries up; callers lock the
/// subscription itself afterwards.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Entry>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    /// Create a new subscription manager whose first id is `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn insert(&self, subscription: Box<dyn Subscription>, networked: bool) -> SharedSubscription {
        let id = subscription.id();
        let stream = subscription.stream().clone();
        let shared = Arc::new(SubscriptionSlot::new(subscription));
        self.subscriptions.write().insert(
            id,
            Entry {
                stream,
                networked,
                subscription: Arc::clone(&shared),
            },
        );
        shared
    }

    pub fn get(&self, id: SubscriptionId) -> Option<SharedSubscription> {
        self.subscriptions
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.subscription))
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<SharedSubscription> {
        self.subscriptions
            .write()
            .remove(&id)
            .map(|entry| entry.subscription)
    }

    pub fn is_networked(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .read()
            .get(&id)
            .is_some_and(|entry| entry.networked)
    }

    /// Networked subscriptions on `stream`, in id order.
    pub fn networked(&self, stream: &StreamPartition) -> Vec<(SubscriptionId, SharedSubscription)> {
        self.collect(|entry| entry.networked && entry.stream == *stream)
    }

    /// Replay-only subscriptions, in id order.
    pub fn replay_only(&self) -> Vec<(SubscriptionId, SharedSubscription)> {
        self.collect(|entry| !entry.networked)
    }

    /// Every subscription, in id order.
    pub fn all(&self) -> Vec<(SubscriptionId, SharedSubscription)> {
        self.collect(|_| true)
    }

    /// Streams with at least one networked subscription.
    pub fn networked_streams(&self) -> Vec<StreamPartition> {
        let subs = self.subscriptions.read();
        let mut streams: Vec<_> = subs
            .values()
            .filter(|entry| entry.networked)
            .map(|entry| entry.stream.clone())
            .collect();
        streams.sort_by(|a, b| (&a.stream_id, a.partition).cmp(&(&b.stream_id, b.partition)));
        streams.dedup();
        streams
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn collect<F>(&self, filter: F) -> Vec<(SubscriptionId, SharedSubscription)>
    where
        F: Fn(&Entry) -> bool,
    {
        let subs = self.subscriptions.read();
        let mut matching: Vec<_> = subs
            .iter()
            .filter(|(_, entry)| filter(entry))
            .map(|(id, entry)| (*id, Arc::clone(&entry.subscription)))
            .collect();
        matching.sort_by_key(|(id, _)| *id);
        matching
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::realtime::RealTimeSubscription;
    use crate::subscriptions::test_support::{stream, Fixture};
    use crate::types::ResendOptions;
    use crate::subscriptions::historical::HistoricalSubscription;

    #[test]
    fn test_insert_lookup_remove() {
        let fixture = Fixture::new();
        let manager = SubscriptionManager::new(10);

        let id = manager.next_id();
        assert_eq!(id, SubscriptionId(10));
        manager.insert(
            Box::new(RealTimeSubscription::new(id, stream(), fixture.ctx.clone(), None)),
            true,
        );

        assert_eq!(manager.subscription_count(), 1);
        assert!(manager.get(id).is_some());
        assert!(manager.is_networked(id));
        assert_eq!(manager.networked(&stream()).len(), 1);

        manager.remove(id);
        assert_eq!(manager.subscription_count(), 0);
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn test_replay_only_not_networked() {
        let fixture = Fixture::new();
        let manager = SubscriptionManager::default();

        let live = manager.next_id();
        manager.insert(
            Box::new(RealTimeSubscription::new(live, stream(), fixture.ctx.clone(), None)),
            true,
        );
        let replay = manager.next_id();
        manager.insert(
            Box::new(HistoricalSubscription::new(
                replay,
                stream(),
                fixture.ctx.clone(),
                ResendOptions::Last { count: 1 },
            )),
            false,
        );

        let networked: Vec<_> = manager.networked(&stream()).into_iter().map(|(id, _)| id).collect();
        assert_eq!(networked, vec![live]);
        assert_eq!(manager.replay_only().len(), 1);
        assert_eq!(manager.networked_streams(), vec![stream()]);
        assert_eq!(manager.all().len(), 2);
    }
}
