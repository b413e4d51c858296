//! Signaling transport: the channel to the rendezvous server.
//!
//! The call layer only sees [`SignalingChannel`] plus a stream of inbound
//! [`SignalEvent`]s; [`SocketSignaling`] is the websocket-backed production
//! implementation and the in-memory one lives in [`crate::testing`].

pub mod protocol;
mod socket;

pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalEvent};
pub use socket::SocketSignaling;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    /// The channel is not currently connected; the frame was not sent.
    #[error("signaling channel unavailable")]
    ChannelUnavailable,
    #[error("signaling connect failed: {0}")]
    Connect(String),
    /// The channel was shut down locally and will not reconnect.
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling protocol error: {0}")]
    Protocol(String),
}

/// Outbound half of the rendezvous connection.
///
/// Sends are fire-and-forget at the protocol level; an `Err` only reports
/// that the frame could not be handed to the transport. Inbound events
/// arrive on the receiver returned at connect time.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, event: SignalEvent) -> Result<(), SignalError>;

    fn is_connected(&self) -> bool;

    /// Tear down the connection. Idempotent; no frames are sent afterwards.
    async fn disconnect(&self);
}
