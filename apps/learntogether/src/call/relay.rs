use super::error::CallError;
use super::retry::RetryPolicy;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_proto::{ClientEvent, RelayEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

/// An open relay socket.
#[async_trait]
pub trait RelayLink: Send + Sync {
    fn send(&self, event: ClientEvent) -> Result<(), CallError>;
    async fn close(&self);
}

pub type RelayEvents = mpsc::UnboundedReceiver<RelayEvent>;

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Arc<dyn RelayLink>, RelayEvents), CallError>;
}

/// Connects following `policy`: each attempt is bounded by the connect
/// timeout and failed attempts back off exponentially.
pub async fn connect_with_retry(
    connector: &dyn RelayConnector,
    url: &str,
    policy: &RetryPolicy,
) -> Result<(Arc<dyn RelayLink>, RelayEvents), CallError> {
    let mut last_error = None;
    for (attempt, delay) in policy.attempts() {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = tokio::time::timeout(policy.connect_timeout, connector.connect(url)).await;
        let err = match outcome {
            Ok(Ok(link)) => {
                tracing::debug!(target = "relay", url = %url, attempt, "relay connected");
                return Ok(link);
            }
            Ok(Err(err)) => err,
            Err(_) => CallError::Relay(format!(
                "connect timed out after {:?}",
                policy.connect_timeout
            )),
        };
        tracing::warn!(
            target = "relay",
            url = %url,
            attempt,
            max_attempts = policy.max_attempts,
            error = %err,
            "relay connect attempt failed"
        );
        last_error = Some(err);
    }
    Err(last_error.unwrap_or_else(|| CallError::Relay("no connection attempts made".into())))
}

/// Normalizes a relay address to a websocket URL.
pub fn websocket_url(relay_url: &str) -> Result<Url, CallError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| CallError::Relay(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(CallError::Relay(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CallError::Relay("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}

enum Outbound {
    Event(ClientEvent),
    Close,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketRelayConnector;

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    async fn connect(&self, url: &str) -> Result<(Arc<dyn RelayLink>, RelayEvents), CallError> {
        let ws_url = websocket_url(url)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| CallError::Relay(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", url = %ws_url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();

        let writer = tokio::spawn(async move {
            while let Some(outbound) = send_rx.recv().await {
                match outbound {
                    Outbound::Event(event) => {
                        let text = match event.to_frame() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(target = "relay", error = %err, "failed to encode frame");
                                continue;
                            }
                        };
                        tracing::trace!(target = "relay", event = event.name(), "ws_out");
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match RelayEvent::from_frame(&text) {
                    Ok(event) => {
                        tracing::trace!(target = "relay", event = event.name(), "ws_in");
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "relay", error = %err, len = text.len(), "ignoring unknown frame");
                    }
                }
            }
        });

        let link = WebSocketRelayLink {
            send_tx,
            tasks: Mutex::new(vec![writer, reader]),
        };
        Ok((Arc::new(link), event_rx))
    }
}

pub struct WebSocketRelayLink {
    send_tx: mpsc::UnboundedSender<Outbound>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl RelayLink for WebSocketRelayLink {
    fn send(&self, event: ClientEvent) -> Result<(), CallError> {
        self.send_tx
            .send(Outbound::Event(event))
            .map_err(|_| CallError::ChannelClosed)
    }

    async fn close(&self) {
        let _ = self.send_tx.send(Outbound::Close);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        let mut handles = handles.into_iter();
        if let Some(writer) = handles.next() {
            // Let the close frame go out before the socket is torn down.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for WebSocketRelayLink {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
