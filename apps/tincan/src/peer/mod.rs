//! Per-call peer connection management.
//!
//! [`PeerSession`] owns one engine instance plus everything that must stay
//! consistent with it: the candidate buffer, the offer guard, local track
//! attachment and the connection recovery ladder.

pub mod candidates;
pub mod engine;
pub mod negotiation;
pub mod rtc;
mod session;

pub use candidates::{CandidateBuffer, PreconditionViolation};
pub use engine::{
    ConnectionHealth, EngineError, EngineEvent, EngineFactory, OfferOptions, PeerEngine,
};
pub use negotiation::NegotiationGuard;
pub use rtc::{WebRtcEngine, WebRtcEngineFactory};
pub use session::{PeerSession, SessionError, SessionUpdate};
