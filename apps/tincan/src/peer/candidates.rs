//! Buffer for trickle candidates that arrive before the remote description.
//!
//! Applying a candidate before `setRemoteDescription` fails, so early
//! arrivals queue here in arrival order and drain once the description
//! lands. Failures while draining are logged and skipped; one bad candidate
//! must not block the rest.

use std::future::Future;

use thiserror::Error;
use tracing::warn;

use crate::signaling::IceCandidate;

use super::engine::EngineError;

#[derive(Debug, Error)]
#[error("candidate buffer drained before remote description was set")]
pub struct PreconditionViolation;

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Apply every buffered candidate in arrival order, then empty the
    /// buffer. Individual failures are logged and skipped. Returns how many
    /// candidates were applied successfully.
    pub async fn drain<F, Fut>(
        &mut self,
        remote_description_set: bool,
        mut apply: F,
    ) -> Result<usize, PreconditionViolation>
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        if !remote_description_set {
            return Err(PreconditionViolation);
        }
        let mut applied = 0;
        for candidate in self.queue.drain(..) {
            let summary = candidate.candidate.clone();
            match apply(candidate).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(
                        target = "peer",
                        candidate = %summary,
                        error = %err,
                        "skipping candidate that failed to apply"
                    );
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn candidate(tag: &str) -> IceCandidate {
        IceCandidate {
            candidate: tag.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn drains_in_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate("a"));
        buffer.push(candidate("b"));
        buffer.push(candidate("c"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let applied = buffer
            .drain(true, move |c| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(c.candidate);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(applied, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn continues_past_failures() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate("good"));
        buffer.push(candidate("bad"));
        buffer.push(candidate("also-good"));

        let applied = buffer
            .drain(true, |c| async move {
                if c.candidate == "bad" {
                    Err(EngineError::Candidate("malformed".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(applied, 2);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn refuses_to_drain_without_remote_description() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate("early"));

        let result = buffer.drain(false, |_| async { Ok(()) }).await;
        assert!(result.is_err());
        assert_eq!(buffer.len(), 1);
    }
}
