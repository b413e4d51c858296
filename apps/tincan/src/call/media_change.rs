//! Mid-call media renegotiation.
//!
//! Upgrading audio to video is consensual: a four-step handshake
//! (`requestMediaChange`, `incomingMediaChangeRequest`, approve or reject,
//! then a `renegotiateOffer`/`renegotiateAnswer` exchange). Downgrading back
//! to audio is unilateral; the peer is only told after the fact via
//! `endVideo`. Both paths raise the renegotiation flag so the offer exchange
//! is never duplicated by automatic negotiation, and drop it a grace period
//! after the handshake settles.

use tracing::{debug, info, warn};

use crate::ident::CallerId;
use crate::media::MediaKind;
use crate::signaling::{SessionDescription, SignalEvent};

use super::{CallError, CallNotice, CallState, CallStateMachine, MediaChangeRequest};

impl CallStateMachine {
    /// Ask the peer to turn this audio call into a video call.
    pub(super) async fn request_video(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Connected || self.local_kind == MediaKind::Video {
            debug!(target = "call", state = ?self.state, "ignoring video request");
            return Ok(());
        }
        let Some(remote) = self.session.remote_id().cloned() else {
            return Ok(());
        };
        info!(target = "call", to = remote.as_str(), "requesting video upgrade");
        self.signaling
            .send(SignalEvent::RequestMediaChange {
                callee_id: remote,
                media: MediaKind::Video,
            })
            .await?;
        Ok(())
    }

    pub(super) fn on_media_change_request(
        &mut self,
        caller_id: CallerId,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if self.state != CallState::Connected || self.session.remote_id() != Some(&caller_id) {
            debug!(target = "call", "ignoring media change request outside the call");
            return Ok(());
        }
        self.pending_change = Some(MediaChangeRequest {
            from: caller_id.clone(),
            proposed: media,
        });
        self.notify(CallNotice::MediaChangeRequested {
            from: caller_id,
            kind: media,
        });
        Ok(())
    }

    /// Consent to the pending upgrade: attach the camera now and tell the
    /// requester, who then drives the renegotiation offer.
    pub(super) async fn approve_media_change(&mut self) -> Result<(), CallError> {
        let Some(request) = self.pending_change.take() else {
            debug!(target = "call", "no media change pending");
            return Ok(());
        };
        let tracks = match self.media.acquire(request.proposed).await {
            Ok(tracks) => tracks,
            Err(err) => {
                // Consent without a camera is a lie; turn it into a reject.
                warn!(target = "call", error = %err, "approval failed, rejecting instead");
                self.notify(CallNotice::MediaUnavailable(err.to_string()));
                self.signaling
                    .send(SignalEvent::RejectMediaChange {
                        caller_id: request.from,
                        media: request.proposed,
                    })
                    .await?;
                return Ok(());
            }
        };
        self.session.set_renegotiating(true);
        self.session.attach_local_tracks(&tracks).await?;
        self.signaling
            .send(SignalEvent::ApproveMediaChange {
                caller_id: request.from,
                media: request.proposed,
            })
            .await?;
        self.session.arm_renegotiation_grace(self.grace);
        self.local_kind = request.proposed;
        self.remote_kind = Some(request.proposed);
        self.publish();
        Ok(())
    }

    pub(super) async fn decline_media_change(&mut self) -> Result<(), CallError> {
        let Some(request) = self.pending_change.take() else {
            return Ok(());
        };
        self.signaling
            .send(SignalEvent::RejectMediaChange {
                caller_id: request.from,
                media: request.proposed,
            })
            .await?;
        Ok(())
    }

    /// The peer consented; attach the camera and send the fresh offer.
    pub(super) async fn on_media_change_approved(
        &mut self,
        callee_id: CallerId,
        media: MediaKind,
    ) -> Result<(), CallError> {
        if self.state != CallState::Connected || self.session.remote_id() != Some(&callee_id) {
            debug!(target = "call", "ignoring stray media change approval");
            return Ok(());
        }
        self.session.set_renegotiating(true);
        let tracks = match self.media.acquire(media).await {
            Ok(tracks) => tracks,
            Err(err) => {
                self.session.set_renegotiating(false);
                self.notify(CallNotice::MediaUnavailable(err.to_string()));
                return Ok(());
            }
        };
        self.session.attach_local_tracks(&tracks).await?;
        self.local_kind = media;
        self.remote_kind = Some(media);
        self.session.try_send_renegotiate_offer().await?;
        self.session.arm_renegotiation_grace(self.grace);
        self.publish();
        Ok(())
    }

    pub(super) async fn on_renegotiate_offer(
        &mut self,
        remote_id: CallerId,
        rtc_message: SessionDescription,
    ) -> Result<(), CallError> {
        if self.state != CallState::Connected || self.session.remote_id() != Some(&remote_id) {
            debug!(target = "call", "ignoring renegotiation from outside the call");
            return Ok(());
        }
        self.session.set_renegotiating(true);
        self.session.apply_remote_description(rtc_message).await?;
        let answer = self.session.answer_current().await?;
        self.signaling
            .send(SignalEvent::RenegotiateAnswer {
                remote_id,
                rtc_message: answer,
            })
            .await?;
        self.session.arm_renegotiation_grace(self.grace);
        Ok(())
    }

    pub(super) async fn on_renegotiate_answer(
        &mut self,
        remote_id: CallerId,
        rtc_message: SessionDescription,
    ) -> Result<(), CallError> {
        if self.session.remote_id() != Some(&remote_id) {
            debug!(target = "call", "ignoring renegotiation answer from stranger");
            return Ok(());
        }
        self.session.apply_remote_description(rtc_message).await?;
        Ok(())
    }

    /// Drop our video and fall back to audio. No consent needed; the peer
    /// just gets told.
    pub(super) async fn end_video(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Connected || self.local_kind != MediaKind::Video {
            debug!(target = "call", "ignoring video stop outside a video call");
            return Ok(());
        }
        let Some(remote) = self.session.remote_id().cloned() else {
            return Ok(());
        };
        info!(target = "call", "ending video, staying on audio");
        self.session.set_renegotiating(true);
        self.session.stop_local_video().await;
        self.local_kind = MediaKind::Audio;
        self.session.try_send_renegotiate_offer().await?;
        self.signaling
            .send(SignalEvent::EndVideo { callee_id: remote })
            .await?;
        self.session.arm_renegotiation_grace(self.grace);
        self.publish();
        Ok(())
    }
}
