//! Websocket-backed [`SignalingChannel`].
//!
//! One supervisor task owns the connection lifecycle: it dials, splits the
//! stream into a writer task and an inline read loop, and redials with a
//! fixed backoff whenever the socket drops. Frames sent while disconnected
//! fail fast with [`SignalError::ChannelUnavailable`] rather than queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::ident::CallerId;

use super::protocol::SignalEvent;
use super::{SignalError, SignalingChannel};

pub struct SocketSignaling {
    writer: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SocketSignaling {
    /// Dial the rendezvous server and register under `caller_id`.
    ///
    /// Returns once the first connection is up; afterwards a background
    /// supervisor keeps redialing every `backoff` until [`disconnect`] is
    /// called. Inbound events arrive on the returned receiver, which closes
    /// only on local disconnect.
    ///
    /// [`disconnect`]: SignalingChannel::disconnect
    pub async fn connect(
        signal_url: &str,
        caller_id: &CallerId,
        backoff: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalEvent>), SignalError> {
        let ws_url = derive_websocket_url(signal_url, caller_id)?;

        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                return Err(SignalError::Connect(format!(
                    "websocket connect to {ws_url} failed: {err}"
                )));
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalEvent>();
        let channel = Arc::new(SocketSignaling {
            writer: RwLock::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let supervisor = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let mut current = Some(stream);
                loop {
                    if channel.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let stream = match current.take() {
                        Some(stream) => stream,
                        None => match connect_async(ws_url.as_str()).await {
                            Ok((stream, _)) => stream,
                            Err(err) => {
                                debug!(
                                    target = "signaling",
                                    url = %ws_url,
                                    error = %err,
                                    "reconnect attempt failed"
                                );
                                tokio::time::sleep(backoff).await;
                                continue;
                            }
                        },
                    };
                    channel.run_connection(stream, &events_tx).await;
                    if channel.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(target = "signaling", "connection lost, redialing");
                    tokio::time::sleep(backoff).await;
                }
            })
        };
        if let Ok(mut tasks) = channel.tasks.lock() {
            tasks.push(supervisor);
        }

        Ok((channel, events_rx))
    }

    /// Drive one live socket until it drops or the channel is closed.
    async fn run_connection(
        self: &Arc<Self>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        events_tx: &mpsc::UnboundedSender<SignalEvent>,
    ) {
        let (mut ws_write, mut ws_read) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

        if let Ok(mut writer) = self.writer.write() {
            *writer = Some(writer_tx);
        }
        self.connected.store(true, Ordering::SeqCst);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<SignalEvent>(&text) {
                    Ok(event) => {
                        trace!(target = "signaling", event = event.name(), "received");
                        if events_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            target = "signaling",
                            error = %err,
                            "ignoring unparseable frame"
                        );
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Frame(_)) => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut writer) = self.writer.write() {
            *writer = None;
        }
        writer_task.abort();
    }
}

#[async_trait]
impl SignalingChannel for SocketSignaling {
    async fn send(&self, event: SignalEvent) -> Result<(), SignalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalError::Closed);
        }
        let text = serde_json::to_string(&event)
            .map_err(|err| SignalError::Protocol(err.to_string()))?;
        let sender = self
            .writer
            .read()
            .ok()
            .and_then(|writer| writer.clone())
            .ok_or(SignalError::ChannelUnavailable)?;
        trace!(target = "signaling", event = event.name(), "sending");
        sender
            .send(Message::Text(text))
            .map_err(|_| SignalError::ChannelUnavailable)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut writer) = self.writer.write() {
            *writer = None;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Map the configured server URL onto the websocket endpoint, carrying the
/// caller id as a query parameter so the server can route deliveries.
fn derive_websocket_url(signal_url: &str, caller_id: &CallerId) -> Result<Url, SignalError> {
    let base = Url::parse(signal_url)
        .map_err(|err| SignalError::Connect(format!("invalid signal url {signal_url}: {err}")))?;
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SignalError::Connect(format!(
                "unsupported signal url scheme: {other}"
            )));
        }
    };
    ws.set_scheme(scheme)
        .map_err(|_| SignalError::Connect("invalid websocket scheme".into()))?;
    ws.set_query(Some(&format!("callerId={}", caller_id.as_str())));
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_from_http() {
        let url = derive_websocket_url("http://rendezvous.local:3500", &CallerId::new("123456"))
            .unwrap();
        assert_eq!(url.as_str(), "ws://rendezvous.local:3500/?callerId=123456");
    }

    #[test]
    fn websocket_url_from_https() {
        let url =
            derive_websocket_url("https://rendezvous.example.com", &CallerId::new("654321"))
                .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.query(), Some("callerId=654321"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = derive_websocket_url("ftp://nope", &CallerId::new("1")).unwrap_err();
        assert!(matches!(err, SignalError::Connect(_)));
    }
}
