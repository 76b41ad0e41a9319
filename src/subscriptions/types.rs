//! Subscription types exposed to the application.

use crate::error::ClientError;
use crate::ordering::GapRequest;
use crate::types::{Message, RequestId, ResendOptions};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-visible lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Options for [`Client::subscribe`](crate::Client::subscribe).
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// History to replay before live delivery (None = live only).
    pub resend: Option<ResendOptions>,

    /// Hand off from a separate historical subscription to a real-time one
    /// (true), or run the replay inside the real-time subscription while
    /// queueing live traffic (false).
    /// Default: true
    pub handoff: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::live()
    }
}

impl SubscribeOptions {
    /// Live messages only.
    pub fn live() -> Self {
        Self {
            resend: None,
            handoff: true,
        }
    }

    /// Replay `resend` first, then continue live.
    pub fn with_resend(resend: ResendOptions) -> Self {
        Self {
            resend: Some(resend),
            handoff: true,
        }
    }
}

/// An in-order message handed to the application.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Decrypted content.
    pub content: Value,
    /// The message as received.
    pub message: Message,
}

/// Ordered delivery callback.
pub type OnMessage = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Lifecycle notifications for one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The network acknowledged the subscription.
    Subscribed,
    /// The subscription ended, by request or by disconnect.
    Unsubscribed,
    /// A replay started.
    Resending { request_id: RequestId },
    /// A replay finished with messages.
    Resent { request_id: RequestId },
    /// A replay finished with nothing to send.
    NoResend { request_id: RequestId },
    /// A gap was detected and a fill requested.
    Gap(GapRequest),
    /// A replay-only subscription completed and was removed.
    Done,
    Error(ClientError),
}

/// Handle to a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive lifecycle events.
    pub receiver: crossbeam_channel::Receiver<SubscriptionEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SubscriptionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every event currently queued.
    pub fn drain(&self) -> Vec<SubscriptionEvent> {
        self.receiver.try_iter().collect()
    }
}
