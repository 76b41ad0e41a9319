//! # Orderly
//!
//! Client-side ordering engine for a partitioned pub/sub network.
//!
//! Messages arrive over the network out of order, duplicated, or missing.
//! Each message names its predecessor on its publisher's chain, so the client
//! can hold messages back until the chain is contiguous and ask the network
//! to resend what is missing.
//!
//! ## Core Concepts
//!
//! - **Chains**: Per-publisher sequences linked by `prev_ref`, ordered independently
//! - **Gap fills**: Missing ranges re-requested on a timer, bounded by a retry budget
//! - **Resends**: Historical replays correlated to their subscription by request id
//! - **Handoff**: A replay that turns into live delivery without loss or duplicates
//!
//! ## Example
//!
//! ```ignore
//! use orderly::{ChannelTransport, Client, ClientConfig, ResendOptions, StreamPartition, SubscribeOptions};
//!
//! let (transport, requests) = ChannelTransport::new();
//! let client = Arc::new(Client::new(ClientConfig::default(), Arc::new(transport)));
//! let _timer = client.start_gap_timer(Duration::from_millis(100))?;
//!
//! client.handle_connected();
//! let handle = client.subscribe(
//!     StreamPartition::new("sensors", 0),
//!     SubscribeOptions::with_resend(ResendOptions::Last { count: 10 }),
//!     |delivery| println!("{}", delivery.content),
//! )?;
//!
//! // Forward `requests` to the network and feed replies back:
//! // client.handle(control_message);
//! ```

pub mod client;
pub mod error;
pub mod ordering;
pub mod requests;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod verify;

// Re-exports
pub use client::{Client, ClientConfig, ClientEvent, GapTimer};
pub use error::{ClientError, Result};
pub use ordering::{
    GapAction, GapRequest, MessageOrdering, OrderedChainBuffer, OrderingConfig,
    DEFAULT_MAX_GAP_REQUESTS,
};
pub use requests::RequestCorrelator;
pub use subscriptions::{
    CombinedSubscription, Delivery, HistoricalSubscription, OnMessage, RealTimeSubscription,
    SubscribeOptions, Subscription, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
pub use transport::{ChannelTransport, ControlMessage, ControlRequest, Transport};
pub use types::*;
pub use verify::{
    AcceptAll, DecryptError, Decryptor, PlaintextDecryptor, Verdict, VerificationCache, Verifier,
    DEFAULT_VERIFICATION_CACHE_SIZE,
};
