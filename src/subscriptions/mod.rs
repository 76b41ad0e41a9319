//! Subscriptions to stream partitions.
//!
//! A subscription turns the unordered, duplicated traffic of a stream
//! partition into one ordered callback:
//! - Live messages are ordered per chain, with gaps filled by replay
//! - Initial replays ("last N", "from T") run before live delivery
//! - Replay and live traffic are stitched without loss or duplicates
//!
//! Three variants implement [`Subscription`]:
//! - [`RealTimeSubscription`] for live delivery
//! - [`HistoricalSubscription`] for one bounded replay
//! - [`CombinedSubscription`], a replay that turns into live delivery
//!
//! # Example
//!
//! ```ignore
//! let handle = client.subscribe(
//!     StreamPartition::new("sensors", 0),
//!     SubscribeOptions::with_resend(ResendOptions::Last { count: 100 }),
//!     |delivery| println!("{}", delivery.content),
//! )?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SubscriptionEvent::Resent { .. }) => println!("Now live!"),
//!         Ok(SubscriptionEvent::Error(e)) => eprintln!("{e}"),
//!         Ok(SubscriptionEvent::Unsubscribed) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod combined;
mod historical;
mod manager;
mod realtime;
mod shared;
mod subscription;
#[cfg(test)]
mod test_support;
mod types;

pub(crate) use shared::SubscriptionContext;
pub use combined::CombinedSubscription;
pub use historical::HistoricalSubscription;
pub use manager::{SharedSubscription, SubscriptionManager, SubscriptionSlot};
pub use realtime::RealTimeSubscription;
pub use subscription::Subscription;
pub use types::{
    Delivery, OnMessage, SubscribeOptions, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
