//! Call orchestration: one task owning the whole call lifecycle.
//!
//! [`CallStateMachine`] is driven by a single `select!` loop over user
//! commands, inbound signaling events and engine events, so every state
//! transition is serialized. Callers interact through the cloneable
//! [`CallHandle`] and observe progress via [`CallNotice`]s and a watched
//! [`CallInfo`] snapshot.

mod media_change;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ident::{CallerId, IdentityError};
use crate::media::{AudioRoute, MediaError, MediaKind, MediaSource, RemoteMedia};
use crate::peer::{EngineError, EngineEvent, EngineFactory, PeerSession, SessionError, SessionUpdate};
use crate::signaling::{SessionDescription, SignalError, SignalEvent, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Offer held while an incoming call rings, applied on accept.
struct PendingOffer {
    from: CallerId,
    offer: SessionDescription,
    kind: MediaKind,
}

/// A peer's not-yet-answered request to upgrade the call media.
struct MediaChangeRequest {
    from: CallerId,
    proposed: MediaKind,
}

#[derive(Debug, Clone)]
pub enum CallCommand {
    Start { remote: CallerId, kind: MediaKind },
    Accept,
    Leave,
    RequestVideo,
    ApproveMediaChange,
    RejectMediaChange,
    EndVideo,
    SetMicEnabled(bool),
    SetSpeaker(bool),
}

/// Asynchronous happenings the embedding UI must surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    IncomingCall { from: CallerId, kind: MediaKind },
    CallRejected,
    CallCanceled,
    CallEnded,
    ConnectionFailed,
    MediaChangeRequested { from: CallerId, kind: MediaKind },
    MediaChangeRejected,
    RemoteVideoEnded,
    MediaUnavailable(String),
}

/// Observable snapshot of the call, published on every transition.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub state: CallState,
    pub remote_id: Option<CallerId>,
    pub direction: Option<CallDirection>,
    pub local_media: MediaKind,
    pub remote_media: Option<MediaKind>,
    pub started_at: Option<SystemTime>,
    pub mic_enabled: bool,
    pub speaker_on: bool,
}

impl Default for CallInfo {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            remote_id: None,
            direction: None,
            local_media: MediaKind::Audio,
            remote_media: None,
            started_at: None,
            mic_enabled: true,
            speaker_on: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("call driver is gone")]
    Closed,
}

/// Cloneable front door to a running call driver.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    info: watch::Receiver<CallInfo>,
    remote_media: watch::Receiver<RemoteMedia>,
}

impl CallHandle {
    fn send(&self, command: CallCommand) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| CallError::Closed)
    }

    pub fn start(&self, remote: CallerId, kind: MediaKind) -> Result<(), CallError> {
        self.send(CallCommand::Start { remote, kind })
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.send(CallCommand::Accept)
    }

    /// Cancel, reject or hang up, whichever the current state calls for.
    pub fn leave(&self) -> Result<(), CallError> {
        self.send(CallCommand::Leave)
    }

    pub fn request_video(&self) -> Result<(), CallError> {
        self.send(CallCommand::RequestVideo)
    }

    pub fn approve_media_change(&self) -> Result<(), CallError> {
        self.send(CallCommand::ApproveMediaChange)
    }

    pub fn reject_media_change(&self) -> Result<(), CallError> {
        self.send(CallCommand::RejectMediaChange)
    }

    pub fn end_video(&self) -> Result<(), CallError> {
        self.send(CallCommand::EndVideo)
    }

    pub fn set_mic_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(CallCommand::SetMicEnabled(enabled))
    }

    pub fn set_speaker(&self, on: bool) -> Result<(), CallError> {
        self.send(CallCommand::SetSpeaker(on))
    }

    pub fn info(&self) -> CallInfo {
        self.info.borrow().clone()
    }

    pub fn watch_info(&self) -> watch::Receiver<CallInfo> {
        self.info.clone()
    }

    pub fn watch_remote_media(&self) -> watch::Receiver<RemoteMedia> {
        self.remote_media.clone()
    }
}

pub struct CallStateMachine {
    local_id: CallerId,
    signaling: Arc<dyn SignalingChannel>,
    session: PeerSession,
    media: Arc<dyn MediaSource>,
    audio: Arc<dyn AudioRoute>,
    grace: Duration,
    state: CallState,
    direction: Option<CallDirection>,
    local_kind: MediaKind,
    remote_kind: Option<MediaKind>,
    started_at: Option<SystemTime>,
    mic_enabled: bool,
    speaker_on: bool,
    pending_offer: Option<PendingOffer>,
    pending_change: Option<MediaChangeRequest>,
    notices: mpsc::UnboundedSender<CallNotice>,
    info: watch::Sender<CallInfo>,
}

impl CallStateMachine {
    /// Build the driver and spawn its task. `signals` is the inbound event
    /// stream of the signaling connection registered under `local_id`.
    pub async fn spawn(
        local_id: CallerId,
        signaling: Arc<dyn SignalingChannel>,
        signals: mpsc::UnboundedReceiver<SignalEvent>,
        factory: Arc<dyn EngineFactory>,
        media: Arc<dyn MediaSource>,
        audio: Arc<dyn AudioRoute>,
        grace: Duration,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallNotice>, JoinHandle<()>), CallError> {
        let (session, engine_events, remote_media) =
            PeerSession::new(factory, Arc::clone(&signaling)).await?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = watch::channel(CallInfo::default());

        let machine = CallStateMachine {
            local_id,
            signaling,
            session,
            media,
            audio,
            grace,
            state: CallState::Idle,
            direction: None,
            local_kind: MediaKind::Audio,
            remote_kind: None,
            started_at: None,
            mic_enabled: true,
            speaker_on: false,
            pending_offer: None,
            pending_change: None,
            notices: notices_tx,
            info: info_tx,
        };

        let task = tokio::spawn(machine.run(commands_rx, signals, engine_events));
        let handle = CallHandle {
            commands: commands_tx,
            info: info_rx,
            remote_media,
        };
        Ok((handle, notices_rx, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        mut engine_events: mpsc::UnboundedReceiver<(u64, EngineEvent)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => break,
                },
                event = engine_events.recv() => match event {
                    Some((generation, event)) => self.handle_engine(generation, event).await,
                    None => break,
                },
            }
        }
        if self.state != CallState::Idle {
            self.teardown().await;
        }
        debug!(target = "call", id = self.local_id.as_str(), "call driver stopped");
    }

    /// Command dispatch. Failures are absorbed here so a bad command never
    /// kills the driver.
    async fn handle_command(&mut self, command: CallCommand) {
        let result = match command {
            CallCommand::Start { remote, kind } => self.start_call(remote, kind).await,
            CallCommand::Accept => self.accept().await,
            CallCommand::Leave => self.leave().await,
            CallCommand::RequestVideo => self.request_video().await,
            CallCommand::ApproveMediaChange => self.approve_media_change().await,
            CallCommand::RejectMediaChange => self.decline_media_change().await,
            CallCommand::EndVideo => self.end_video().await,
            CallCommand::SetMicEnabled(enabled) => {
                self.set_mic(enabled);
                Ok(())
            }
            CallCommand::SetSpeaker(on) => {
                self.set_speaker(on);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(target = "call", error = %err, "command failed");
        }
    }

    async fn handle_signal(&mut self, signal: SignalEvent) {
        let name = signal.name();
        let result = match signal {
            SignalEvent::NewCall {
                caller_id,
                rtc_message,
                media,
            } => self.on_new_call(caller_id, rtc_message, media).await,
            SignalEvent::CallAnswered { rtc_message, media } => {
                self.on_call_answered(rtc_message, media).await
            }
            SignalEvent::Candidate { candidate, .. } => {
                self.session.handle_remote_candidate(candidate).await;
                Ok(())
            }
            SignalEvent::CallCanceled => self.on_remote_hangup(CallNotice::CallCanceled).await,
            SignalEvent::CallRejected => self.on_remote_hangup(CallNotice::CallRejected).await,
            SignalEvent::CallEnded => self.on_remote_hangup(CallNotice::CallEnded).await,
            SignalEvent::IncomingMediaChangeRequest { caller_id, media } => {
                self.on_media_change_request(caller_id, media)
            }
            SignalEvent::MediaChangeApproved { callee_id, media } => {
                self.on_media_change_approved(callee_id, media).await
            }
            SignalEvent::MediaChangeRejected => {
                self.notify(CallNotice::MediaChangeRejected);
                Ok(())
            }
            SignalEvent::RenegotiateOffer {
                remote_id,
                rtc_message,
            } => self.on_renegotiate_offer(remote_id, rtc_message).await,
            SignalEvent::RenegotiateAnswer {
                remote_id,
                rtc_message,
            } => self.on_renegotiate_answer(remote_id, rtc_message).await,
            SignalEvent::EndedVideo { .. } => {
                self.on_remote_video_ended();
                Ok(())
            }
            other => {
                debug!(target = "call", event = other.name(), "ignoring event");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(target = "call", event = name, error = %err, "signal handling failed");
        }
    }

    async fn handle_engine(&mut self, generation: u64, event: EngineEvent) {
        match self.session.handle_engine_event(generation, event).await {
            SessionUpdate::None | SessionUpdate::RecoveryOfferSent => {}
            SessionUpdate::RemoteTrackAdded(kind) => {
                if kind == MediaKind::Video && self.remote_kind != Some(MediaKind::Video) {
                    self.remote_kind = Some(MediaKind::Video);
                    self.publish();
                }
            }
            SessionUpdate::Recreated => {
                // A rebuilt engine has no live media; the call cannot survive
                // it, so surface the failure and return to idle.
                if self.state != CallState::Idle {
                    self.notify(CallNotice::ConnectionFailed);
                    self.teardown().await;
                }
            }
        }
    }

    async fn start_call(&mut self, remote: CallerId, kind: MediaKind) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            debug!(target = "call", state = ?self.state, "ignoring start while busy");
            return Ok(());
        }
        let tracks = match self.media.acquire(kind).await {
            Ok(tracks) => tracks,
            Err(err) => {
                self.notify(CallNotice::MediaUnavailable(err.to_string()));
                return Ok(());
            }
        };
        info!(
            target = "call",
            to = remote.as_str(),
            kind = %kind,
            "starting call"
        );
        self.session.set_remote_id(remote.clone());
        self.session.attach_local_tracks(&tracks).await?;
        self.session.try_send_offer(kind, false).await?;
        self.state = CallState::OutgoingRinging;
        self.direction = Some(CallDirection::Outgoing);
        self.local_kind = kind;
        self.publish();
        Ok(())
    }

    async fn on_new_call(
        &mut self,
        caller_id: CallerId,
        rtc_message: SessionDescription,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if self.state == CallState::Idle {
            info!(
                target = "call",
                from = caller_id.as_str(),
                kind = %media,
                "incoming call"
            );
            self.session.set_remote_id(caller_id.clone());
            self.pending_offer = Some(PendingOffer {
                from: caller_id.clone(),
                offer: rtc_message,
                kind: media,
            });
            self.state = CallState::IncomingRinging;
            self.direction = Some(CallDirection::Incoming);
            self.local_kind = media;
            self.remote_kind = Some(media);
            self.audio.start_ringtone();
            self.notify(CallNotice::IncomingCall {
                from: caller_id,
                kind: media,
            });
            self.publish();
            return Ok(());
        }

        if self.state == CallState::Connected && self.session.remote_id() == Some(&caller_id) {
            // A fresh `call` from the current peer mid-call is its recovery
            // offer after an ICE restart; answer it in place.
            debug!(target = "call", "applying recovery offer from current peer");
            self.session.apply_remote_description(rtc_message).await?;
            let answer = self.session.answer_current().await?;
            self.signaling
                .send(SignalEvent::AnswerCall {
                    caller_id,
                    rtc_message: answer,
                    media: self.local_kind,
                })
                .await?;
            return Ok(());
        }

        debug!(
            target = "call",
            from = caller_id.as_str(),
            "busy, rejecting second incoming call"
        );
        self.signaling
            .send(SignalEvent::RejectCall { caller_id })
            .await?;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        if self.state != CallState::IncomingRinging {
            debug!(target = "call", state = ?self.state, "ignoring accept");
            return Ok(());
        }
        let Some(pending) = self.pending_offer.take() else {
            return Ok(());
        };
        let tracks = match self.media.acquire(pending.kind).await {
            Ok(tracks) => tracks,
            Err(err) => {
                self.notify(CallNotice::MediaUnavailable(err.to_string()));
                self.pending_offer = Some(pending);
                return Ok(());
            }
        };
        let result = async {
            self.session.attach_local_tracks(&tracks).await?;
            self.session
                .apply_remote_description(pending.offer.clone())
                .await?;
            let answer = self.session.answer_current().await?;
            self.signaling
                .send(SignalEvent::AnswerCall {
                    caller_id: pending.from.clone(),
                    rtc_message: answer,
                    media: pending.kind,
                })
                .await?;
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(err) = result {
            // Keep the offer so a later accept can still succeed.
            self.pending_offer = Some(pending);
            return Err(err);
        }

        self.audio.stop_ringtone();
        self.audio.start_session(pending.kind);
        self.audio.set_speaker(false);
        self.audio.set_mic_mute(false);
        self.speaker_on = false;
        self.mic_enabled = true;
        self.local_kind = pending.kind;
        self.remote_kind = Some(pending.kind);
        self.started_at = Some(SystemTime::now());
        self.state = CallState::Connected;
        self.session.set_established();
        self.publish();
        Ok(())
    }

    async fn on_call_answered(
        &mut self,
        rtc_message: SessionDescription,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if self.state == CallState::Connected {
            // Answer to a recovery offer; the call itself does not change.
            self.session.apply_remote_description(rtc_message).await?;
            return Ok(());
        }
        if self.state != CallState::OutgoingRinging {
            debug!(target = "call", state = ?self.state, "ignoring stray answer");
            return Ok(());
        }
        self.session.apply_remote_description(rtc_message).await?;
        self.audio.start_session(self.local_kind);
        self.audio.set_speaker(false);
        self.speaker_on = false;
        self.remote_kind = Some(media);
        self.started_at = Some(SystemTime::now());
        self.state = CallState::Connected;
        self.session.set_established();
        self.publish();
        Ok(())
    }

    async fn on_remote_hangup(&mut self, notice: CallNotice) -> Result<(), CallError> {
        if self.state == CallState::Idle {
            return Ok(());
        }
        self.notify(notice);
        self.teardown().await;
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), CallError> {
        if self.state == CallState::Idle {
            return Ok(());
        }
        let farewell = match (self.state, self.session.remote_id().cloned()) {
            (CallState::OutgoingRinging, Some(remote)) => {
                Some(SignalEvent::CancelCall { callee_id: remote })
            }
            (CallState::IncomingRinging, Some(remote)) => {
                Some(SignalEvent::RejectCall { caller_id: remote })
            }
            (CallState::Connected, Some(remote)) => {
                Some(SignalEvent::EndCall { callee_id: remote })
            }
            _ => None,
        };
        if let Some(farewell) = farewell {
            if let Err(err) = self.signaling.send(farewell).await {
                // The peer learns of the hangup from the dying transport instead.
                warn!(target = "call", error = %err, "hangup notification failed");
            }
        }
        self.teardown().await;
        Ok(())
    }

    fn set_mic(&mut self, enabled: bool) {
        self.mic_enabled = enabled;
        self.session.set_mic_enabled(enabled);
        self.audio.set_mic_mute(!enabled);
        self.publish();
    }

    fn set_speaker(&mut self, on: bool) {
        self.speaker_on = on;
        self.audio.set_speaker(on);
        self.publish();
    }

    fn on_remote_video_ended(&mut self) {
        if self.state != CallState::Connected {
            return;
        }
        self.remote_kind = Some(MediaKind::Audio);
        self.notify(CallNotice::RemoteVideoEnded);
        self.publish();
    }

    /// Return everything to idle: audio routing, media, peer session.
    async fn teardown(&mut self) {
        self.audio.stop_ringtone();
        self.audio.stop_session();
        self.session.reset().await;
        self.pending_offer = None;
        self.pending_change = None;
        self.state = CallState::Idle;
        self.direction = None;
        self.local_kind = MediaKind::Audio;
        self.remote_kind = None;
        self.started_at = None;
        self.mic_enabled = true;
        self.speaker_on = false;
        self.publish();
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        self.info.send_replace(CallInfo {
            state: self.state,
            remote_id: self.session.remote_id().cloned(),
            direction: self.direction,
            local_media: self.local_kind,
            remote_media: self.remote_kind,
            started_at: self.started_at,
            mic_enabled: self.mic_enabled,
            speaker_on: self.speaker_on,
        });
    }
}
