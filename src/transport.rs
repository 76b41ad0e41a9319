//! Boundary to the network transport.
//!
//! The transport owns connecting, framing and reconnect backoff. The client
//! only hands it [`ControlRequest`]s and is fed [`ControlMessage`]s back.

use crate::error::Result;
use crate::types::{Message, RequestId, ResendOptions, StreamPartition};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Requests the client sends to the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Subscribe {
        stream: StreamPartition,
    },
    Unsubscribe {
        stream: StreamPartition,
    },
    Resend {
        stream: StreamPartition,
        request_id: RequestId,
        options: ResendOptions,
    },
}

/// Traffic the transport feeds into the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// A live message.
    Broadcast { message: Message },
    /// A replayed message answering a resend request.
    Unicast {
        request_id: RequestId,
        message: Message,
    },
    SubscribeResponse {
        stream: StreamPartition,
    },
    UnsubscribeResponse {
        stream: StreamPartition,
    },
    ResendResponseResending {
        stream: StreamPartition,
        request_id: RequestId,
    },
    ResendResponseResent {
        stream: StreamPartition,
        request_id: RequestId,
    },
    ResendResponseNoResend {
        stream: StreamPartition,
        request_id: RequestId,
    },
    ErrorResponse {
        request_id: Option<RequestId>,
        message: String,
    },
}

/// Outbound side of the transport.
///
/// `send` is fire-and-forget: it must not block on the network and must not
/// call back into the client, since it runs while a subscription is locked.
pub trait Transport: Send + Sync {
    fn send(&self, request: ControlRequest) -> Result<()>;
}

/// Transport that forwards requests over a channel, typically to an I/O
/// thread owning the socket.
pub struct ChannelTransport {
    sender: Sender<ControlRequest>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its request channel.
    pub fn new() -> (Self, Receiver<ControlRequest>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, request: ControlRequest) -> Result<()> {
        self.sender.send(request)?;
        Ok(())
    }
}
