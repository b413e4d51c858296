//! Abstraction over the underlying peer connection.
//!
//! The session and call layers never touch the WebRTC stack directly; they
//! drive a [`PeerEngine`] and react to its [`EngineEvent`] stream. The
//! production engine wraps `webrtc`'s peer connection, the test double in
//! [`crate::testing`] is scripted.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaKind, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("track operation failed: {0}")]
    Track(String),
    #[error("engine closed")]
    Closed,
}

/// Coarse transport health, mirroring the peer connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications out of the engine, delivered on the channel
/// handed to [`EngineFactory::create`].
#[derive(Debug)]
pub enum EngineEvent {
    ConnectionState(ConnectionHealth),
    /// A remote track started arriving.
    RemoteTrack(MediaTrack),
    /// A locally gathered candidate to trickle to the peer. `None` marks the
    /// end of gathering.
    Candidate(Option<IceCandidate>),
    /// The engine wants a new offer, typically after tracks changed.
    NegotiationNeeded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    /// Request fresh ICE credentials to recover a failing transport.
    pub ice_restart: bool,
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self, options: OfferOptions)
        -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    fn has_remote_description(&self) -> bool;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError>;

    /// Stop sending every local track of `kind`, keeping the transceiver
    /// alive for a later re-add.
    async fn clear_track(&self, kind: MediaKind) -> Result<(), EngineError>;

    fn connection_health(&self) -> ConnectionHealth;

    async fn close(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerEngine>, EngineError>;
}
