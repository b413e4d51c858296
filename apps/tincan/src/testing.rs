//! In-process doubles for exercising call flows without sockets or devices.
//!
//! [`Rendezvous`] plays the server role: it owns a single router task that
//! rewrites addressed events into their delivery forms in arrival order, so
//! two [`MemorySignaling`] endpoints see exactly the frames a real server
//! would forward. The engine, media and audio fakes record every interaction
//! for assertion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ident::CallerId;
use crate::media::{AudioRoute, MediaError, MediaKind, MediaSource, MediaTrack};
use crate::peer::{
    ConnectionHealth, EngineError, EngineEvent, EngineFactory, OfferOptions, PeerEngine,
};
use crate::signaling::{
    IceCandidate, SessionDescription, SignalError, SignalEvent, SignalingChannel,
};

/// In-memory stand-in for the rendezvous server.
pub struct Rendezvous {
    router_tx: mpsc::UnboundedSender<(CallerId, SignalEvent)>,
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SignalEvent>>>>,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        let (router_tx, mut router_rx) = mpsc::unbounded_channel::<(CallerId, SignalEvent)>();
        let peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SignalEvent>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let routing = Arc::clone(&peers);
        tokio::spawn(async move {
            while let Some((from, event)) = router_rx.recv().await {
                if let Some((target, delivery)) = route(&from, event) {
                    let sender = routing
                        .lock()
                        .ok()
                        .and_then(|map| map.get(target.as_str()).cloned());
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(delivery);
                        }
                        None => {
                            warn!(
                                target = "testing",
                                peer = target.as_str(),
                                "dropping frame for unknown peer"
                            );
                        }
                    }
                }
            }
        });

        Arc::new(Self { router_tx, peers })
    }

    /// Register a peer and hand back its endpoint plus inbound event stream.
    pub fn join(
        self: &Arc<Self>,
        caller_id: CallerId,
    ) -> (Arc<MemorySignaling>, mpsc::UnboundedReceiver<SignalEvent>) {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(caller_id.as_str().to_string(), delivery_tx);
        }
        let channel = Arc::new(MemorySignaling {
            caller_id,
            router_tx: self.router_tx.clone(),
            connected: AtomicBool::new(true),
        });
        (channel, delivery_rx)
    }
}

/// Server-side rewrite of one addressed event into its delivery form.
fn route(from: &CallerId, event: SignalEvent) -> Option<(CallerId, SignalEvent)> {
    match event {
        SignalEvent::Call {
            callee_id,
            rtc_message,
            media,
        } => Some((
            callee_id,
            SignalEvent::NewCall {
                caller_id: from.clone(),
                rtc_message,
                media,
            },
        )),
        SignalEvent::AnswerCall {
            caller_id,
            rtc_message,
            media,
        } => Some((caller_id, SignalEvent::CallAnswered { rtc_message, media })),
        SignalEvent::Candidate {
            callee_id: Some(target),
            candidate,
        } => Some((
            target,
            SignalEvent::Candidate {
                callee_id: Some(from.clone()),
                candidate,
            },
        )),
        SignalEvent::CancelCall { callee_id } => Some((callee_id, SignalEvent::CallCanceled)),
        SignalEvent::RejectCall { caller_id } => Some((caller_id, SignalEvent::CallRejected)),
        SignalEvent::EndCall { callee_id } => Some((callee_id, SignalEvent::CallEnded)),
        SignalEvent::RequestMediaChange { callee_id, media } => Some((
            callee_id,
            SignalEvent::IncomingMediaChangeRequest {
                caller_id: from.clone(),
                media,
            },
        )),
        SignalEvent::ApproveMediaChange { caller_id, media } => Some((
            caller_id,
            SignalEvent::MediaChangeApproved {
                callee_id: from.clone(),
                media,
            },
        )),
        SignalEvent::RejectMediaChange { caller_id, .. } => {
            Some((caller_id, SignalEvent::MediaChangeRejected))
        }
        SignalEvent::RenegotiateOffer {
            remote_id,
            rtc_message,
        } => Some((
            remote_id,
            SignalEvent::RenegotiateOffer {
                remote_id: from.clone(),
                rtc_message,
            },
        )),
        SignalEvent::RenegotiateAnswer {
            remote_id,
            rtc_message,
        } => Some((
            remote_id,
            SignalEvent::RenegotiateAnswer {
                remote_id: from.clone(),
                rtc_message,
            },
        )),
        SignalEvent::EndVideo { callee_id } => Some((
            callee_id,
            SignalEvent::EndedVideo {
                caller_id: Some(from.clone()),
            },
        )),
        other => {
            warn!(
                target = "testing",
                event = other.name(),
                "client sent a delivery-form event, dropping"
            );
            None
        }
    }
}

/// Channel endpoint bound to a [`Rendezvous`].
pub struct MemorySignaling {
    caller_id: CallerId,
    router_tx: mpsc::UnboundedSender<(CallerId, SignalEvent)>,
    connected: AtomicBool,
}

impl MemorySignaling {
    /// Simulate losing or regaining the server connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn send(&self, event: SignalEvent) -> Result<(), SignalError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalError::ChannelUnavailable);
        }
        self.router_tx
            .send((self.caller_id.clone(), event))
            .map_err(|_| SignalError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Standalone channel that records what was sent and delivers nothing.
pub struct FakeSignaling {
    connected: AtomicBool,
    sent: Mutex<Vec<SignalEvent>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SignalEvent> {
        self.sent.lock().expect("signaling log poisoned").clone()
    }
}

impl Default for FakeSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(&self, event: SignalEvent) -> Result<(), SignalError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalError::ChannelUnavailable);
        }
        self.sent.lock().expect("signaling log poisoned").push(event);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct EngineState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<MediaTrack>,
    applied: Vec<IceCandidate>,
    attempted: Vec<IceCandidate>,
    offers: u32,
    answers: u32,
    last_offer: Option<OfferOptions>,
    reject_candidates: Vec<String>,
    health: Option<ConnectionHealth>,
    closed: bool,
}

/// Scripted engine: descriptions and candidates are bookkeeping only, and
/// asynchronous events fire when the test calls [`FakeEngine::emit`].
pub struct FakeEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: Mutex::new(EngineState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Make `add_candidate` fail for candidates whose SDP line matches.
    pub fn reject_candidate(&self, line: &str) {
        self.state().reject_candidates.push(line.to_string());
    }

    pub fn attached_tracks(&self) -> Vec<MediaTrack> {
        self.state().tracks.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied.clone()
    }

    pub fn attempted_candidates(&self) -> Vec<IceCandidate> {
        self.state().attempted.clone()
    }

    pub fn offer_count(&self) -> u32 {
        self.state().offers
    }

    pub fn last_offer_options(&self) -> Option<OfferOptions> {
        self.state().last_offer
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, EngineError> {
        let mut state = self.state();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.offers += 1;
        state.last_offer = Some(options);
        Ok(SessionDescription::offer(format!("offer-{}", state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(EngineError::Negotiation(
                "no remote offer to answer".into(),
            ));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            state.answers
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.state().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.state().remote = Some(description);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state().remote.is_some()
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let mut state = self.state();
        state.attempted.push(candidate.clone());
        if state
            .reject_candidates
            .iter()
            .any(|line| candidate.candidate.contains(line.as_str()))
        {
            return Err(EngineError::Candidate(format!(
                "scripted rejection of {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        self.state().tracks.push(track.clone());
        Ok(())
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), EngineError> {
        self.state().tracks.retain(|track| track.kind() != kind);
        Ok(())
    }

    fn connection_health(&self) -> ConnectionHealth {
        let state = self.state();
        if state.closed {
            ConnectionHealth::Closed
        } else {
            state.health.unwrap_or(ConnectionHealth::New)
        }
    }

    async fn close(&self) {
        self.state().closed = true;
        // A closed connection reports itself, same as the real engine.
        let _ = self
            .events
            .send(EngineEvent::ConnectionState(ConnectionHealth::Closed));
    }
}

/// Factory that keeps every engine it ever built, so tests can assert on
/// engines replaced during recovery.
pub struct FakeEngineFactory {
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeEngineFactory {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn engines(&self) -> Vec<Arc<FakeEngine>> {
        self.engines.lock().expect("factory state poisoned").clone()
    }

    pub fn latest(&self) -> Arc<FakeEngine> {
        self.engines()
            .last()
            .cloned()
            .expect("no engine created yet")
    }
}

impl Default for FakeEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerEngine>, EngineError> {
        let engine = FakeEngine::new(events);
        self.engines
            .lock()
            .expect("factory state poisoned")
            .push(Arc::clone(&engine));
        Ok(engine)
    }
}

/// Capture source handing out detached tracks, optionally denying access.
pub struct FakeMedia {
    deny: AtomicBool,
    acquired: Mutex<Vec<MediaTrack>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self {
            deny: AtomicBool::new(false),
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> Vec<MediaTrack> {
        self.acquired.lock().expect("media log poisoned").clone()
    }
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<Vec<MediaTrack>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("scripted denial".into()));
        }
        let mut tracks = vec![MediaTrack::detached(MediaKind::Audio)];
        if kind == MediaKind::Video {
            tracks.push(MediaTrack::detached(MediaKind::Video));
        }
        self.acquired
            .lock()
            .expect("media log poisoned")
            .extend(tracks.iter().cloned());
        Ok(tracks)
    }
}

/// Audio route that records every call in order.
pub struct FakeAudioRoute {
    log: Mutex<Vec<String>>,
}

impl FakeAudioRoute {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("audio log poisoned").clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().expect("audio log poisoned").push(entry);
    }
}

impl Default for FakeAudioRoute {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRoute for FakeAudioRoute {
    fn start_ringtone(&self) {
        self.record("start_ringtone".into());
    }

    fn stop_ringtone(&self) {
        self.record("stop_ringtone".into());
    }

    fn start_session(&self, kind: MediaKind) {
        self.record(format!("start_session:{kind}"));
    }

    fn stop_session(&self) {
        self.record("stop_session".into());
    }

    fn set_speaker(&self, on: bool) {
        self.record(format!("set_speaker:{on}"));
    }

    fn set_mic_mute(&self, muted: bool) {
        self.record(format!("set_mic_mute:{muted}"));
    }
}
