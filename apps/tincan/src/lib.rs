//! Peer-to-peer audio/video calling core.
//!
//! The crate connects a rendezvous server over websocket, exchanges
//! offer/answer and trickle candidates with one peer, and drives the call
//! through a single state machine: ring, answer, mid-call video upgrade and
//! downgrade, transport recovery, hangup. The host platform plugs in its
//! camera/microphone capture ([`MediaSource`]), device audio routing
//! ([`AudioRoute`]) and identity persistence ([`IdentityStore`]); everything
//! else lives here.

pub mod call;
pub mod config;
pub mod ident;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod testing;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use call::{
    CallCommand, CallDirection, CallError, CallHandle, CallInfo, CallNotice, CallState,
    CallStateMachine,
};
pub use config::{CallConfig, IceServerConfig};
pub use ident::{CallerId, IdentityError, IdentityStore};
pub use media::{AudioRoute, MediaError, MediaKind, MediaSource, MediaTrack, RemoteMedia};
pub use peer::{EngineFactory, PeerEngine, WebRtcEngineFactory};
pub use signaling::{SignalError, SignalEvent, SignalingChannel, SocketSignaling};

/// Bring the whole stack up: resolve the caller id, connect signaling, and
/// spawn the call driver backed by the production WebRTC engine.
pub async fn connect(
    config: CallConfig,
    identity: Arc<dyn IdentityStore>,
    media: Arc<dyn MediaSource>,
    audio: Arc<dyn AudioRoute>,
) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallNotice>), CallError> {
    let caller_id = identity.get_or_create_caller_id().await?;
    let (signaling, signals) = SocketSignaling::connect(
        &config.signal_url,
        &caller_id,
        config.reconnect_backoff,
    )
    .await?;
    let factory = Arc::new(WebRtcEngineFactory::new(config.ice_servers.clone()));
    let (handle, notices, _task) = CallStateMachine::spawn(
        caller_id,
        signaling as Arc<dyn SignalingChannel>,
        signals,
        factory as Arc<dyn EngineFactory>,
        media,
        audio,
        config.renegotiation_grace,
    )
    .await?;
    Ok((handle, notices))
}
