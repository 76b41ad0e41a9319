//! The capability every subscription variant implements.

use crate::error::{ClientError, Result};
use crate::types::{Message, RequestId, StreamPartition};
use std::time::Instant;

use super::types::{Delivery, OnMessage, SubscriptionEvent, SubscriptionId, SubscriptionState};

/// One logical interest in a stream partition.
///
/// Implementations are driven by a single writer: the client holds each
/// subscription behind its own lock and feeds it messages, replies and timer
/// ticks one at a time. Ordered messages collect in an outbox; the client
/// drains it with [`take_deliveries`](Subscription::take_deliveries) and
/// runs the callback after releasing the lock.
pub trait Subscription: Send {
    fn id(&self) -> SubscriptionId;

    fn stream(&self) -> &StreamPartition;

    fn state(&self) -> SubscriptionState;

    /// Move to `state`. Becoming subscribed issues the initial resend, if
    /// one was configured and has not completed.
    fn set_state(&mut self, state: SubscriptionState);

    fn is_resending(&self) -> bool;

    /// Accept a message. Replayed messages are ordered right away; live ones
    /// are held back while a replay is in flight.
    fn handle_message(&mut self, message: Message, is_replay: bool);

    fn handle_replay_started(&mut self, request_id: RequestId) -> Result<()>;

    fn handle_replay_finished(&mut self, request_id: RequestId) -> Result<()>;

    fn handle_replay_empty(&mut self, request_id: RequestId) -> Result<()>;

    /// Transport lost: reset to unsubscribed and abandon open requests.
    fn handle_disconnected(&mut self);

    /// A group key for `publisher_id` arrived; retry held messages.
    fn group_key_available(&mut self, publisher_id: &str);

    /// Fire due gap timers.
    fn tick(&mut self, now: Instant);

    /// Surface an error to the application.
    fn report_error(&self, error: ClientError);

    /// Send a lifecycle event to the application.
    fn notify(&self, event: SubscriptionEvent);

    /// Deliveries released since the last call, in order.
    fn take_deliveries(&mut self) -> Vec<Delivery>;

    /// The application's delivery callback.
    fn on_message(&self) -> OnMessage;

    /// Open resend requests.
    fn pending_resend_count(&self) -> usize;

    /// Replay-only subscriptions report true once their replay completed.
    fn is_finished(&self) -> bool {
        false
    }

    /// Cancel all gap timers and abandon open requests.
    fn stop(&mut self);
}
