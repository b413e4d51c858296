//! Wire model of the rendezvous protocol.
//!
//! Every frame is one JSON object `{"event": <name>, "data": <payload>}`.
//! Client-to-server events name the peer they are addressed to; the server
//! rewrites them into the corresponding delivery event carrying the sender's
//! id before forwarding (`call` becomes `newCall`, `answerCall` becomes
//! `callAnswered`, and so on).

use serde::{Deserialize, Serialize};

use crate::ident::CallerId;
use crate::media::MediaKind;

/// Session description as exchanged on the wire, in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Every event exchanged with the rendezvous server.
///
/// Outbound and inbound shapes share one enum because the channel is duplex;
/// a client only ever emits the addressed forms and only ever receives the
/// delivery forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalEvent {
    /// Initial offer, initiator to callee.
    #[serde(rename = "call")]
    Call {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    /// Initial offer as delivered to the callee.
    #[serde(rename = "newCall")]
    NewCall {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    /// Answer, callee to initiator.
    #[serde(rename = "answerCall")]
    AnswerCall {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    /// Answer as delivered to the initiator.
    #[serde(rename = "callAnswered")]
    CallAnswered {
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    /// Trickle candidate, either direction. Outbound frames address the peer;
    /// delivered frames carry the sender instead, which receivers ignore.
    #[serde(rename = "ICEcandidate")]
    Candidate {
        #[serde(
            rename = "calleeId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        callee_id: Option<CallerId>,
        #[serde(rename = "rtcMessage")]
        candidate: IceCandidate,
    },
    #[serde(rename = "cancelCall")]
    CancelCall {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
    },
    #[serde(rename = "callCanceled")]
    CallCanceled,
    #[serde(rename = "rejectCall")]
    RejectCall {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
    },
    #[serde(rename = "callRejected")]
    CallRejected,
    #[serde(rename = "endCall")]
    EndCall {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
    },
    #[serde(rename = "callEnded")]
    CallEnded,
    /// Upgrade handshake, requester to target.
    #[serde(rename = "requestMediaChange")]
    RequestMediaChange {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    #[serde(rename = "incomingMediaChangeRequest")]
    IncomingMediaChangeRequest {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    #[serde(rename = "approveMediaChange")]
    ApproveMediaChange {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    #[serde(rename = "mediaChangeApproved")]
    MediaChangeApproved {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    #[serde(rename = "rejectMediaChange")]
    RejectMediaChange {
        #[serde(rename = "callerId")]
        caller_id: CallerId,
        #[serde(rename = "type")]
        media: MediaKind,
    },
    #[serde(rename = "mediaChangeRejected")]
    MediaChangeRejected,
    /// Mid-call offer, distinct from `call` so the receiver does not treat it
    /// as a brand-new incoming call. Delivered frames carry the sender's id
    /// in the same field (alias `from` for older servers).
    #[serde(rename = "renegotiateOffer")]
    RenegotiateOffer {
        #[serde(rename = "remoteId", alias = "from")]
        remote_id: CallerId,
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
    },
    #[serde(rename = "renegotiateAnswer")]
    RenegotiateAnswer {
        #[serde(rename = "remoteId", alias = "from")]
        remote_id: CallerId,
        #[serde(rename = "rtcMessage")]
        rtc_message: SessionDescription,
    },
    /// Downgrade notice, requester to peer.
    #[serde(rename = "endVideo")]
    EndVideo {
        #[serde(rename = "calleeId")]
        callee_id: CallerId,
    },
    #[serde(rename = "endedVideo")]
    EndedVideo {
        #[serde(
            rename = "callerId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        caller_id: Option<CallerId>,
    },
}

impl SignalEvent {
    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SignalEvent::Call { .. } => "call",
            SignalEvent::NewCall { .. } => "newCall",
            SignalEvent::AnswerCall { .. } => "answerCall",
            SignalEvent::CallAnswered { .. } => "callAnswered",
            SignalEvent::Candidate { .. } => "ICEcandidate",
            SignalEvent::CancelCall { .. } => "cancelCall",
            SignalEvent::CallCanceled => "callCanceled",
            SignalEvent::RejectCall { .. } => "rejectCall",
            SignalEvent::CallRejected => "callRejected",
            SignalEvent::EndCall { .. } => "endCall",
            SignalEvent::CallEnded => "callEnded",
            SignalEvent::RequestMediaChange { .. } => "requestMediaChange",
            SignalEvent::IncomingMediaChangeRequest { .. } => "incomingMediaChangeRequest",
            SignalEvent::ApproveMediaChange { .. } => "approveMediaChange",
            SignalEvent::MediaChangeApproved { .. } => "mediaChangeApproved",
            SignalEvent::RejectMediaChange { .. } => "rejectMediaChange",
            SignalEvent::MediaChangeRejected => "mediaChangeRejected",
            SignalEvent::RenegotiateOffer { .. } => "renegotiateOffer",
            SignalEvent::RenegotiateAnswer { .. } => "renegotiateAnswer",
            SignalEvent::EndVideo { .. } => "endVideo",
            SignalEvent::EndedVideo { .. } => "endedVideo",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_shape() {
        let event = SignalEvent::Call {
            callee_id: CallerId::new("222222"),
            rtc_message: SessionDescription::offer("v=0"),
            media: MediaKind::Video,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "call",
                "data": {
                    "calleeId": "222222",
                    "rtcMessage": {"type": "offer", "sdp": "v=0"},
                    "type": "video",
                }
            })
        );
    }

    #[test]
    fn candidate_frame_roundtrip() {
        let event = SignalEvent::Candidate {
            callee_id: Some(CallerId::new("111111")),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"ICEcandidate\""));
        assert!(text.contains("\"sdpMLineIndex\":0"));
        let back: SignalEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unit_events_omit_data() {
        let text = serde_json::to_string(&SignalEvent::CallEnded).unwrap();
        assert_eq!(text, "{\"event\":\"callEnded\"}");
        let back: SignalEvent = serde_json::from_str("{\"event\":\"callRejected\"}").unwrap();
        assert_eq!(back, SignalEvent::CallRejected);
    }

    #[test]
    fn renegotiate_offer_accepts_from_alias() {
        let back: SignalEvent = serde_json::from_str(
            "{\"event\":\"renegotiateOffer\",\"data\":{\"from\":\"111111\",\
             \"rtcMessage\":{\"type\":\"offer\",\"sdp\":\"v=0\"}}}",
        )
        .unwrap();
        match back {
            SignalEvent::RenegotiateOffer { remote_id, .. } => {
                assert_eq!(remote_id.as_str(), "111111");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
