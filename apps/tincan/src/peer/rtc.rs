//! `webrtc`-backed [`PeerEngine`].
//!
//! One engine wraps one `RTCPeerConnection`. Every asynchronous callback on
//! the connection is forwarded onto the owner's event channel so the call
//! driver observes everything from a single place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::media::{MediaKind, MediaTrack};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

use super::engine::{
    ConnectionHealth, EngineError, EngineEvent, EngineFactory, OfferOptions, PeerEngine,
};

pub struct WebRtcEngineFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerEngine>, EngineError> {
        let engine = WebRtcEngine::new(&self.ice_servers, events).await?;
        Ok(engine as Arc<dyn PeerEngine>)
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    // Description lookups on the peer connection are async; the sync trait
    // accessor reads this flag instead, maintained by the setters below.
    remote_set: AtomicBool,
}

impl WebRtcEngine {
    pub async fn new(
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<Self>, EngineError> {
        let api = build_api(SettingEngine::default())?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let payload = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(err) => {
                            warn!(
                                target = "peer",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => None,
                };
                let _ = events.send(EngineEvent::Candidate(payload));
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    RTPCodecType::Unspecified => {
                        warn!(target = "peer", "ignoring track of unspecified kind");
                        return;
                    }
                };
                debug!(target = "peer", kind = %kind, "remote track arrived");
                let _ = events.send(EngineEvent::RemoteTrack(MediaTrack::detached(kind)));
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::ConnectionState(health_from(state)));
            })
        }));

        pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::NegotiationNeeded);
            })
        }));

        Ok(Arc::new(Self {
            pc,
            remote_set: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, EngineError> {
        let rtc_options = RTCOfferOptions {
            ice_restart: options.ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(rtc_options))
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_negotiation_error)?;
        self.remote_set.store(true, Ordering::Release);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::Acquire)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        let handle = track.rtc_handle().ok_or_else(|| {
            EngineError::Track(format!("track {} has no outbound handle", track.id()))
        })?;
        self.pc
            .add_track(handle)
            .await
            .map(|_sender| ())
            .map_err(|err| EngineError::Track(err.to_string()))
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), EngineError> {
        let wanted = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        for sender in self.pc.get_senders().await {
            let matches = match sender.track().await {
                Some(track) => track.kind() == wanted,
                None => false,
            };
            if matches {
                sender
                    .replace_track(None)
                    .await
                    .map_err(|err| EngineError::Track(err.to_string()))?;
            }
        }
        Ok(())
    }

    fn connection_health(&self) -> ConnectionHealth {
        health_from(self.pc.connection_state())
    }

    async fn close(&self) {
        self.remote_set.store(false, Ordering::Release);
        if let Err(err) = self.pc.close().await {
            debug!(target = "peer", error = %err, "peer connection close error");
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    result.map_err(to_negotiation_error)
}

fn health_from(state: RTCPeerConnectionState) -> ConnectionHealth {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionHealth::New,
        RTCPeerConnectionState::Connecting => ConnectionHealth::Connecting,
        RTCPeerConnectionState::Connected => ConnectionHealth::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionHealth::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionHealth::Failed,
        RTCPeerConnectionState::Closed => ConnectionHealth::Closed,
    }
}

fn to_setup_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn to_negotiation_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::Negotiation(err.to_string())
}
