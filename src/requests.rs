//! Correlation of resend requests with the subscriptions awaiting replies.

use crate::error::{ClientError, Result};
use crate::subscriptions::SubscriptionId;
use crate::types::RequestId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Maps in-flight request ids to the subscription that issued them.
///
/// Ids are generated per client instance and never reused, so a reply to a
/// forgotten request can always be told apart from a live one.
pub struct RequestCorrelator {
    /// Counter for generating request IDs.
    next_id: AtomicU64,
    /// Open requests by ID.
    entries: Mutex<HashMap<RequestId, SubscriptionId>>,
}

impl RequestCorrelator {
    /// Create a correlator whose first id is `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            next_id: AtomicU64::new(seed),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a fresh request id without registering it.
    pub fn generate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Open a request on behalf of `subscription`. The id is also recorded in
    /// the subscription's own pending set.
    pub fn register(
        &self,
        subscription: SubscriptionId,
        pending: &mut HashSet<RequestId>,
    ) -> RequestId {
        let id = self.generate_id();
        self.entries.lock().insert(id, subscription);
        pending.insert(id);
        trace!(request_id = %id, subscription = %subscription, "request registered");
        id
    }

    /// Find the subscription a reply belongs to.
    pub fn resolve(&self, id: RequestId) -> Result<SubscriptionId> {
        match self.entries.lock().get(&id) {
            Some(subscription) => Ok(*subscription),
            None => {
                warn!(request_id = %id, "reply correlates to no open request");
                Err(ClientError::UnexpectedReply(id))
            }
        }
    }

    /// Close a request. Later replies to it resolve to nothing.
    pub fn forget(&self, id: RequestId) {
        self.entries.lock().remove(&id);
    }

    /// Close several requests at once.
    pub fn forget_all<I>(&self, ids: I)
    where
        I: IntoIterator<Item = RequestId>,
    {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.remove(&id);
        }
    }

    /// Number of open requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(1)
    }
}
