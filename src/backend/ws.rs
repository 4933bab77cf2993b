use super::auth::Credentials;
use super::types::{InboundFrame, OutboundFrame, PushLink, WsEnvelope};
use super::PushTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket implementation of the push channel.
pub struct WsTransport {
    auth: Arc<Credentials>,
    ws_url: String,
}

impl WsTransport {
    pub fn new(auth: Arc<Credentials>, ws_url: &str) -> Self {
        Self {
            auth,
            ws_url: ws_url.to_string(),
        }
    }

    fn endpoint(&self, user_id: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.ws_url)
            .with_context(|| format!("invalid push channel URL: {}", self.ws_url))?;
        url.query_pairs_mut().append_pair("userId", user_id);
        Ok(url.to_string())
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn open(&self, user_id: &str) -> Result<PushLink> {
        // Build request from URL (adds WS upgrade headers automatically),
        // then attach auth headers
        let mut request = self
            .endpoint(user_id)?
            .into_client_request()
            .context("failed to build WS request")?;
        for (k, v) in self.auth.headers() {
            request.headers_mut().insert(
                k.parse::<tokio_tungstenite::tungstenite::http::HeaderName>()
                    .map_err(|e| anyhow::anyhow!("invalid header name: {}", e))?,
                v.parse::<tokio_tungstenite::tungstenite::http::HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("invalid header value: {}", e))?,
            );
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                let err_str = format!("{:#}", e);
                if err_str.contains("401") || err_str.contains("Unauthorized") {
                    anyhow::bail!(
                        "push channel rejected credentials (401 Unauthorized) for user {}",
                        user_id
                    );
                }
                return Err(anyhow::anyhow!(e).context("WS connection failed"));
            }
        };
        tracing::debug!("push channel socket open");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(512);
        tokio::spawn(async move {
            let reason = pump(ws_stream, out_rx, &in_tx).await;
            let _ = in_tx.send(InboundFrame::Closed(reason)).await;
        });

        Ok(PushLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Shuttle frames until either side goes away. Returns the close reason,
/// `None` when the owner dropped the outbound sender.
async fn pump(
    ws_stream: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    in_tx: &mpsc::Sender<InboundFrame>,
) -> Option<String> {
    let (mut write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(Message::Close(None)).await;
                    return None;
                };
                tracing::debug!(frame = ?frame, "push channel send");
                if let Err(e) = write.send(Message::Text(frame.to_json().to_string())).await {
                    return Some(format!("WS send failed: {:#}", e));
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frame) = decode_event(&text) {
                            if in_tx.send(frame).await.is_err() {
                                return None;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return Some(format!("WS pong failed: {:#}", e));
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!("push channel received close frame");
                        return Some("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(format!("WS read error: {:#}", e)),
                    None => return Some("connection reset".to_string()),
                }
            }
        }
    }
}

fn decode_event(text: &str) -> Option<InboundFrame> {
    match serde_json::from_str::<WsEnvelope>(text) {
        Ok(env) => Some(InboundFrame::Event {
            name: env.event,
            data: env.data,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "dropping unparseable push frame");
            None
        }
    }
}
