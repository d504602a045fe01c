use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{EnvelopeStream, SignalingEnvelope, SignalingTransport};
use crate::error::TransportError;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(15);

/// Client side of the rendezvous push channel (`/signal/ws?partyId=`).
///
/// Each subscription owns a reader task that reconnects with jittered
/// exponential backoff when the socket drops.
pub struct WsSignalingTransport {
    base_url: String,
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl WsSignalingTransport {
    /// `base_url` is the rendezvous root, e.g. `ws://127.0.0.1:9850`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    fn subscribe_url(&self, party_id: &str) -> String {
        format!("{}/signal/ws?partyId={}", self.base_url, urlencoding::encode(party_id))
    }
}

async fn dial(url: &str) -> Result<(WsSink, WsStream), TransportError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| TransportError::Network(format!("connect {}: {}", url, e)))?;
    Ok(ws.split())
}

fn backoff(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(1u32 << attempt.min(5));
    let capped = exp.min(RECONNECT_MAX);
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter)
}

/// Forward frames until the socket closes. Returns false once the
/// subscriber has gone away and the pump should stop for good.
async fn forward(mut stream: WsStream, tx: &mpsc::Sender<SignalingEnvelope>) -> bool {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalingEnvelope>(&text) {
                Ok(envelope) => {
                    if tx.send(envelope).await.is_err() {
                        return false;
                    }
                }
                Err(e) => warn!("Dropping malformed envelope from rendezvous: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Rendezvous socket error: {}", e);
                break;
            }
        }
    }
    !tx.is_closed()
}

#[async_trait]
impl SignalingTransport for WsSignalingTransport {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), TransportError> {
        let json = envelope.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(TransportError::Closed)?;
        sink.send(Message::Text(json))
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    async fn subscribe(&self, party_id: &str) -> Result<EnvelopeStream, TransportError> {
        let url = self.subscribe_url(party_id);
        let (sink, stream) = dial(&url).await?;
        *self.sink.lock().await = Some(sink);
        info!("Subscribed to rendezvous as {}", party_id);

        let (tx, rx) = mpsc::channel(256);
        let shared_sink = self.sink.clone();
        tokio::spawn(async move {
            let mut stream = Some(stream);
            let mut attempt = 0u32;
            loop {
                if let Some(s) = stream.take() {
                    attempt = 0;
                    if !forward(s, &tx).await {
                        break;
                    }
                    shared_sink.lock().await.take();
                    warn!("Rendezvous connection lost, reconnecting");
                }

                tokio::time::sleep(backoff(attempt)).await;
                attempt = attempt.saturating_add(1);
                match dial(&url).await {
                    Ok((sink, s)) => {
                        *shared_sink.lock().await = Some(sink);
                        info!("Reconnected to rendezvous");
                        stream = Some(s);
                    }
                    Err(e) => debug!("Rendezvous reconnect failed: {}", e),
                }
                if tx.is_closed() {
                    break;
                }
            }
            shared_sink.lock().await.take();
            debug!("Rendezvous pump exited");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_url_strips_trailing_slash() {
        let t = WsSignalingTransport::new("ws://127.0.0.1:9850/");
        assert_eq!(t.subscribe_url("alice"), "ws://127.0.0.1:9850/signal/ws?partyId=alice");
    }

    #[test]
    fn subscribe_url_escapes_party_id() {
        let t = WsSignalingTransport::new("ws://127.0.0.1:9850");
        assert_eq!(
            t.subscribe_url("bob & co#1"),
            "ws://127.0.0.1:9850/signal/ws?partyId=bob%20%26%20co%231"
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff(0) >= RECONNECT_BASE);
        assert!(backoff(0) <= RECONNECT_BASE + RECONNECT_BASE / 4);
        assert!(backoff(30) <= RECONNECT_MAX + RECONNECT_MAX / 4);
        assert!(backoff(30) >= RECONNECT_MAX);
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        use crate::models::{EndReason, SessionId};
        let t = WsSignalingTransport::new("ws://127.0.0.1:1");
        let env = SignalingEnvelope::hangup(SessionId::new(), "a", "b", EndReason::Normal);
        assert_eq!(t.send(&env).await, Err(TransportError::Closed));
    }
}
