use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Client configuration for the signaling channel and the peer engine.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Base URL of the rendezvous server (`http`/`https` or `ws`/`wss`).
    pub signal_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Fixed delay between signaling reconnect attempts.
    pub reconnect_backoff: Duration,
    /// How long the automatic renegotiation trigger stays suppressed after a
    /// manual renegotiation completes.
    pub renegotiation_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signal_url: "http://localhost:3000".to_string(),
            ice_servers: default_stun_servers(),
            reconnect_backoff: Duration::from_secs(1),
            renegotiation_grace: Duration::from_millis(300),
        }
    }
}

/// One STUN or TURN server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub(crate) fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

pub fn default_stun_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
        IceServerConfig::stun("stun:stun2.l.google.com:19302"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_entry_converts_with_credentials() {
        let server = IceServerConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            username: Some("user".into()),
            credential: Some("secret".into()),
        };
        let rtc = server.to_rtc();
        assert_eq!(rtc.urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");
    }

    #[test]
    fn defaults_carry_stun_only() {
        for server in default_stun_servers() {
            assert!(server.urls[0].starts_with("stun:"));
            assert!(server.username.is_none());
        }
    }
}
