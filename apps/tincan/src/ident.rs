use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque routing address of a device on the rendezvous server.
///
/// Generated once per device, persisted by the host application, and stable
/// across sessions. The signaling connection is tagged with this id, and every
/// addressed event names the peer's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh id for a device that has never joined before.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(format!("{:06}", rng.gen_range(0..1_000_000u32)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Error)]
#[error("identity storage failed: {0}")]
pub struct IdentityError(pub String);

/// Persistent identity storage owned by the host application.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the device's caller id, creating and persisting one on first
    /// use.
    async fn get_or_create_caller_id(&self) -> Result<CallerId, IdentityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_six_digits() {
        let id = CallerId::generate();
        assert_eq!(id.as_str().len(), 6);
        assert!(id.as_str().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn serializes_as_bare_string() {
        let id = CallerId::new("123456");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"123456\"");
    }
}
