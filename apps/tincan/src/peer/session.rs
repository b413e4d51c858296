//! Lifecycle of a single peer connection within a call.
//!
//! The session is driven from one task; none of its methods are reentrant.
//! It layers three responsibilities over the raw engine: candidate buffering
//! until the remote description lands, offer exclusivity through the
//! negotiation guard, and the two-step recovery ladder (ICE restart first,
//! full engine recreation second).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::ident::CallerId;
use crate::media::{MediaKind, MediaTrack, RemoteMedia};
use crate::signaling::{IceCandidate, SessionDescription, SignalEvent, SignalError, SignalingChannel};

use super::candidates::CandidateBuffer;
use super::engine::{
    ConnectionHealth, EngineError, EngineEvent, EngineFactory, OfferOptions, PeerEngine,
};
use super::negotiation::NegotiationGuard;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("no remote peer bound to this session")]
    NoRemote,
}

/// What the caller of [`PeerSession::handle_engine_event`] needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    None,
    RemoteTrackAdded(MediaKind),
    /// An ICE-restart offer went out; the transport may still recover.
    RecoveryOfferSent,
    /// The engine was torn down and rebuilt from scratch.
    Recreated,
}

pub struct PeerSession {
    factory: Arc<dyn EngineFactory>,
    signaling: Arc<dyn SignalingChannel>,
    engine: Arc<dyn PeerEngine>,
    events_out: mpsc::UnboundedSender<(u64, EngineEvent)>,
    generation: u64,
    remote_id: Option<CallerId>,
    local_tracks: Vec<MediaTrack>,
    candidates: CandidateBuffer,
    guard: NegotiationGuard,
    remote_media: watch::Sender<RemoteMedia>,
    restart_attempted: bool,
    renegotiating: Arc<AtomicBool>,
    established: bool,
}

impl PeerSession {
    pub async fn new(
        factory: Arc<dyn EngineFactory>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<(u64, EngineEvent)>,
            watch::Receiver<RemoteMedia>,
        ),
        SessionError,
    > {
        let (events_out, events_rx) = mpsc::unbounded_channel();
        let generation = 1;
        let engine = Self::spawn_engine(&factory, &events_out, generation).await?;
        let (remote_media, remote_media_rx) = watch::channel(RemoteMedia::default());
        let session = Self {
            factory,
            signaling,
            engine,
            events_out,
            generation,
            remote_id: None,
            local_tracks: Vec::new(),
            candidates: CandidateBuffer::new(),
            guard: NegotiationGuard::new(),
            remote_media,
            restart_attempted: false,
            renegotiating: Arc::new(AtomicBool::new(false)),
            established: false,
        };
        Ok((session, events_rx, remote_media_rx))
    }

    /// Create an engine whose events are tagged with its generation, so
    /// notifications queued by a replaced engine can be told apart from the
    /// live one's.
    async fn spawn_engine(
        factory: &Arc<dyn EngineFactory>,
        events_out: &mpsc::UnboundedSender<(u64, EngineEvent)>,
        generation: u64,
    ) -> Result<Arc<dyn PeerEngine>, EngineError> {
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        let out = events_out.clone();
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                if out.send((generation, event)).is_err() {
                    break;
                }
            }
        });
        factory.create(engine_tx).await
    }

    /// Generation of the engine currently in use.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_remote_id(&mut self, remote: CallerId) {
        self.remote_id = Some(remote);
    }

    pub fn remote_id(&self) -> Option<&CallerId> {
        self.remote_id.as_ref()
    }

    /// Mark the call as answered; from here on automatic negotiation-needed
    /// events are suppressed and renegotiation is always explicit.
    pub fn set_established(&mut self) {
        self.established = true;
    }

    pub fn set_renegotiating(&mut self, on: bool) {
        self.renegotiating.store(on, Ordering::Release);
    }

    pub fn renegotiating(&self) -> bool {
        self.renegotiating.load(Ordering::Acquire)
    }

    /// Keep renegotiation suppression up a little longer than the signaling
    /// round trip, then drop it. The window is approximate; an automatic
    /// negotiation event racing the expiry is absorbed by the offer guard.
    pub fn arm_renegotiation_grace(&self, grace: Duration) {
        let flag = Arc::clone(&self.renegotiating);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            flag.store(false, Ordering::Release);
        });
    }

    /// Attach local capture tracks to the engine. At most one sender exists
    /// per kind; re-acquired tracks of a kind already held are skipped, so an
    /// upgrade that hands back a fresh microphone does not grow a second
    /// audio sender.
    pub async fn attach_local_tracks(
        &mut self,
        tracks: &[MediaTrack],
    ) -> Result<(), SessionError> {
        for track in tracks {
            if self.local_tracks.iter().any(|held| held.kind() == track.kind()) {
                continue;
            }
            self.engine.add_track(track).await?;
            self.local_tracks.push(track.clone());
        }
        Ok(())
    }

    pub fn local_has_video(&self) -> bool {
        self.local_tracks
            .iter()
            .any(|track| track.kind() == MediaKind::Video)
    }

    fn local_kind(&self) -> MediaKind {
        if self.local_has_video() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    /// Create, apply and send an initial (or recovery) offer as a `call`
    /// event. Returns `Ok(false)` without side effects when another offer is
    /// already in flight.
    pub async fn try_send_offer(
        &mut self,
        kind: MediaKind,
        restart: bool,
    ) -> Result<bool, SessionError> {
        if !self.guard.try_acquire() {
            trace!(target = "peer", "offer suppressed, one already in flight");
            return Ok(false);
        }
        let result = self.send_offer_locked(kind, restart).await;
        if result.is_err() {
            self.guard.release();
        }
        result.map(|()| true)
    }

    async fn send_offer_locked(
        &mut self,
        kind: MediaKind,
        restart: bool,
    ) -> Result<(), SessionError> {
        let callee_id = self.remote_id.clone().ok_or(SessionError::NoRemote)?;
        let offer = self
            .engine
            .create_offer(OfferOptions {
                ice_restart: restart,
            })
            .await?;
        self.engine.set_local_description(offer.clone()).await?;
        self.signaling
            .send(SignalEvent::Call {
                callee_id,
                rtc_message: offer,
                media: kind,
            })
            .await?;
        Ok(())
    }

    /// Like [`try_send_offer`] but framed as a mid-call `renegotiateOffer`,
    /// so the peer applies it to the live session instead of ringing.
    ///
    /// [`try_send_offer`]: Self::try_send_offer
    pub async fn try_send_renegotiate_offer(&mut self) -> Result<bool, SessionError> {
        if !self.guard.try_acquire() {
            trace!(target = "peer", "renegotiate offer suppressed");
            return Ok(false);
        }
        let result = async {
            let remote_id = self.remote_id.clone().ok_or(SessionError::NoRemote)?;
            let offer = self
                .engine
                .create_offer(OfferOptions::default())
                .await?;
            self.engine.set_local_description(offer.clone()).await?;
            self.signaling
                .send(SignalEvent::RenegotiateOffer {
                    remote_id,
                    rtc_message: offer,
                })
                .await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            self.guard.release();
        }
        result.map(|()| true)
    }

    /// Produce and apply the local answer to the currently set remote offer.
    /// Sending it is up to the caller, whose framing depends on the phase.
    pub async fn answer_current(&mut self) -> Result<SessionDescription, SessionError> {
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply the remote description, settle any in-flight offer and drain
    /// buffered candidates.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), SessionError> {
        self.engine.set_remote_description(description).await?;
        self.guard.release();
        self.drain_candidates().await;
        Ok(())
    }

    /// Apply a trickled candidate now if the remote description is in place,
    /// otherwise hold it in arrival order.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.engine.has_remote_description() {
            if let Err(err) = self.engine.add_candidate(candidate).await {
                warn!(target = "peer", error = %err, "dropping rejected candidate");
            }
        } else {
            self.candidates.push(candidate);
            debug!(
                target = "peer",
                buffered = self.candidates.len(),
                "buffered candidate ahead of remote description"
            );
        }
    }

    pub async fn drain_candidates(&mut self) {
        if self.candidates.is_empty() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let outcome = self
            .candidates
            .drain(engine.has_remote_description(), move |candidate| {
                let engine = Arc::clone(&engine);
                async move { engine.add_candidate(candidate).await }
            })
            .await;
        match outcome {
            Ok(applied) => trace!(target = "peer", applied, "drained candidate buffer"),
            Err(err) => warn!(target = "peer", error = %err, "candidate drain skipped"),
        }
    }

    /// React to one engine notification. Recovery is attempted in place; the
    /// returned update tells the call layer what changed. Events tagged with
    /// a superseded generation come from an engine that was already replaced
    /// (its dying `Closed`, late candidates) and are dropped.
    pub async fn handle_engine_event(
        &mut self,
        generation: u64,
        event: EngineEvent,
    ) -> SessionUpdate {
        if generation != self.generation {
            trace!(
                target = "peer",
                generation,
                current = self.generation,
                "dropping event from replaced engine"
            );
            return SessionUpdate::None;
        }
        match event {
            EngineEvent::Candidate(Some(candidate)) => {
                // Gathering can outpace signaling: without a bound remote the
                // candidate has no address and is dropped, as the peer will
                // re-learn it from a later offer exchange.
                match self.remote_id.clone() {
                    Some(callee_id) => {
                        let send = self.signaling.send(SignalEvent::Candidate {
                            callee_id: Some(callee_id),
                            candidate,
                        });
                        if let Err(err) = send.await {
                            warn!(target = "peer", error = %err, "candidate send failed");
                        }
                    }
                    None => {
                        trace!(target = "peer", "dropping candidate, no remote bound");
                    }
                }
                SessionUpdate::None
            }
            EngineEvent::Candidate(None) => SessionUpdate::None,
            EngineEvent::RemoteTrack(track) => {
                let kind = track.kind();
                self.remote_media
                    .send_modify(|media| *media = media.with_track(track));
                SessionUpdate::RemoteTrackAdded(kind)
            }
            EngineEvent::ConnectionState(health) => self.handle_health(health).await,
            EngineEvent::NegotiationNeeded => {
                if self.renegotiating() || self.established {
                    trace!(target = "peer", "automatic negotiation suppressed");
                    return SessionUpdate::None;
                }
                if self.remote_id.is_none() {
                    return SessionUpdate::None;
                }
                let kind = self.local_kind();
                if let Err(err) = self.try_send_offer(kind, false).await {
                    warn!(target = "peer", error = %err, "automatic offer failed");
                }
                SessionUpdate::None
            }
        }
    }

    async fn handle_health(&mut self, health: ConnectionHealth) -> SessionUpdate {
        match health {
            ConnectionHealth::Connected => {
                self.restart_attempted = false;
                SessionUpdate::None
            }
            ConnectionHealth::Disconnected | ConnectionHealth::Failed
                if !self.restart_attempted =>
            {
                self.restart_attempted = true;
                let kind = self.local_kind();
                warn!(target = "peer", state = ?health, "transport degraded, trying ICE restart");
                match self.try_send_offer(kind, true).await {
                    Ok(true) => SessionUpdate::RecoveryOfferSent,
                    Ok(false) => SessionUpdate::None,
                    Err(err) => {
                        warn!(target = "peer", error = %err, "ICE restart offer failed");
                        self.recreate().await;
                        SessionUpdate::Recreated
                    }
                }
            }
            ConnectionHealth::Failed => {
                warn!(target = "peer", "transport failed after restart, rebuilding engine");
                self.recreate().await;
                SessionUpdate::Recreated
            }
            ConnectionHealth::Closed => {
                warn!(target = "peer", "live engine closed underneath the call");
                self.recreate().await;
                SessionUpdate::Recreated
            }
            ConnectionHealth::Disconnected => SessionUpdate::None,
            ConnectionHealth::New | ConnectionHealth::Connecting => SessionUpdate::None,
        }
    }

    /// Replace the engine with a fresh one and re-attach the local tracks.
    async fn recreate(&mut self) {
        self.engine.close().await;
        self.candidates.clear();
        self.guard.release();
        self.generation += 1;
        match Self::spawn_engine(&self.factory, &self.events_out, self.generation).await {
            Ok(engine) => {
                self.engine = engine;
                for track in self.local_tracks.clone() {
                    if let Err(err) = self.engine.add_track(&track).await {
                        warn!(
                            target = "peer",
                            track = track.id(),
                            error = %err,
                            "failed to re-attach track after rebuild"
                        );
                    }
                }
            }
            Err(err) => {
                warn!(target = "peer", error = %err, "engine rebuild failed");
            }
        }
    }

    /// Disable and release every local track, clearing the outbound senders.
    pub async fn stop_local_tracks(&mut self) {
        for track in &self.local_tracks {
            track.set_enabled(false);
        }
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if let Err(err) = self.engine.clear_track(kind).await {
                debug!(target = "peer", error = %err, "clearing tracks on teardown");
            }
        }
        self.local_tracks.clear();
    }

    /// Drop only the video tracks, used by the downgrade path.
    pub async fn stop_local_video(&mut self) {
        for track in &self.local_tracks {
            if track.kind() == MediaKind::Video {
                track.set_enabled(false);
            }
        }
        if let Err(err) = self.engine.clear_track(MediaKind::Video).await {
            warn!(target = "peer", error = %err, "failed to clear outbound video");
        }
        self.local_tracks.retain(|track| track.kind() != MediaKind::Video);
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        for track in &self.local_tracks {
            if track.kind() == MediaKind::Audio {
                track.set_enabled(enabled);
            }
        }
    }

    /// Full teardown back to a pristine engine, ready for the next call.
    pub async fn reset(&mut self) {
        self.stop_local_tracks().await;
        self.engine.close().await;
        self.remote_id = None;
        self.candidates.clear();
        self.guard.release();
        self.restart_attempted = false;
        self.renegotiating.store(false, Ordering::Release);
        self.established = false;
        self.remote_media.send_replace(RemoteMedia::default());
        self.generation += 1;
        match Self::spawn_engine(&self.factory, &self.events_out, self.generation).await {
            Ok(engine) => self.engine = engine,
            Err(err) => {
                warn!(target = "peer", error = %err, "engine rebuild after reset failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngineFactory, FakeSignaling};

    async fn session() -> (PeerSession, Arc<FakeEngineFactory>, Arc<FakeSignaling>) {
        let factory = Arc::new(FakeEngineFactory::new());
        let signaling = Arc::new(FakeSignaling::new());
        let (session, _events, _media) = PeerSession::new(
            Arc::clone(&factory) as Arc<dyn EngineFactory>,
            Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
        )
        .await
        .unwrap();
        (session, factory, signaling)
    }

    #[tokio::test]
    async fn candidate_without_remote_is_dropped() {
        let (mut session, _factory, signaling) = session().await;
        let candidate = IceCandidate {
            candidate: "candidate:0".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let generation = session.generation();
        let update = session
            .handle_engine_event(generation, EngineEvent::Candidate(Some(candidate)))
            .await;
        assert_eq!(update, SessionUpdate::None);
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn second_offer_is_suppressed_until_answer() {
        let (mut session, _factory, signaling) = session().await;
        session.set_remote_id(CallerId::new("222222"));
        assert!(session.try_send_offer(MediaKind::Audio, false).await.unwrap());
        assert!(!session.try_send_offer(MediaKind::Audio, false).await.unwrap());
        assert_eq!(signaling.sent().len(), 1);

        session
            .apply_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(session.try_send_offer(MediaKind::Audio, false).await.unwrap());
    }

    #[tokio::test]
    async fn negotiation_needed_is_suppressed_once_established() {
        let (mut session, _factory, signaling) = session().await;
        session.set_remote_id(CallerId::new("222222"));
        session.set_established();
        let generation = session.generation();
        let update = session
            .handle_engine_event(generation, EngineEvent::NegotiationNeeded)
            .await;
        assert_eq!(update, SessionUpdate::None);
        assert!(signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn failure_ladder_restarts_then_rebuilds() {
        let (mut session, factory, signaling) = session().await;
        session.set_remote_id(CallerId::new("222222"));
        let track = MediaTrack::detached(MediaKind::Audio);
        session.attach_local_tracks(&[track]).await.unwrap();
        let generation = session.generation();

        let first = session
            .handle_engine_event(generation, EngineEvent::ConnectionState(ConnectionHealth::Failed))
            .await;
        assert_eq!(first, SessionUpdate::RecoveryOfferSent);
        let restart_offer = signaling.sent().pop().unwrap();
        assert_eq!(restart_offer.name(), "call");
        assert!(factory.engines().len() == 1);

        let second = session
            .handle_engine_event(generation, EngineEvent::ConnectionState(ConnectionHealth::Failed))
            .await;
        assert_eq!(second, SessionUpdate::Recreated);
        let engines = factory.engines();
        assert_eq!(engines.len(), 2);
        assert_eq!(engines[1].attached_tracks().len(), 1);
    }

    #[tokio::test]
    async fn events_from_a_replaced_engine_are_dropped() {
        let (mut session, factory, _signaling) = session().await;
        session.set_remote_id(CallerId::new("222222"));
        let stale = session.generation();

        session
            .handle_engine_event(stale, EngineEvent::ConnectionState(ConnectionHealth::Failed))
            .await;
        let second = session
            .handle_engine_event(stale, EngineEvent::ConnectionState(ConnectionHealth::Failed))
            .await;
        assert_eq!(second, SessionUpdate::Recreated);
        assert_eq!(factory.engines().len(), 2);
        assert_ne!(session.generation(), stale);

        // The replaced engine reports Closed as it dies; that must not tear
        // down its successor.
        let update = session
            .handle_engine_event(stale, EngineEvent::ConnectionState(ConnectionHealth::Closed))
            .await;
        assert_eq!(update, SessionUpdate::None);
        assert_eq!(factory.engines().len(), 2);
    }

    #[tokio::test]
    async fn reattaching_a_kind_keeps_a_single_sender() {
        let (mut session, factory, _signaling) = session().await;
        session
            .attach_local_tracks(&[MediaTrack::detached(MediaKind::Audio)])
            .await
            .unwrap();
        // An upgrade re-acquires the microphone alongside the camera.
        session
            .attach_local_tracks(&[
                MediaTrack::detached(MediaKind::Audio),
                MediaTrack::detached(MediaKind::Video),
            ])
            .await
            .unwrap();

        let tracks = factory.latest().attached_tracks();
        let audio = tracks.iter().filter(|t| t.kind() == MediaKind::Audio).count();
        let video = tracks.iter().filter(|t| t.kind() == MediaKind::Video).count();
        assert_eq!((audio, video), (1, 1));
    }

    #[tokio::test]
    async fn early_candidates_drain_after_remote_description() {
        let (mut session, factory, _signaling) = session().await;
        for tag in ["a", "b"] {
            session
                .handle_remote_candidate(IceCandidate {
                    candidate: tag.into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                })
                .await;
        }
        let engine = factory.latest();
        assert!(engine.applied_candidates().is_empty());

        session
            .apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let applied = engine.applied_candidates();
        assert_eq!(
            applied.iter().map(|c| c.candidate.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
