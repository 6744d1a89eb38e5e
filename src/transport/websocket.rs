//! WebSocket 客户端传输
//!
//! 连接后拆分读写：写任务从通道取出报文写入 socket 并回报结果；读任务把文本帧转发到入站通道，
//! 服务器关闭或出错时结束并丢弃入站发送端。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::transport::Transport;

type Outgoing = (String, oneshot::Sender<Result<(), String>>);

/// WebSocket 传输
pub struct WebSocketTransport {
    url: String,
    login_payload: Option<Value>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    closing: CancellationToken,
}

impl WebSocketTransport {
    pub fn new(url: &str, login_payload: Option<Value>) -> Self {
        Self {
            url: url.to_string(),
            login_payload,
            outgoing: Mutex::new(None),
            closing: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, inbound: mpsc::UnboundedSender<String>) -> Result<(), AgentError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| AgentError::TransportFailure(format!("connect {}: {e}", self.url)))?;
        tracing::info!(url = %self.url, "WebSocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

        let closing = self.closing.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closing.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    next = rx.recv() => {
                        let Some((text, ack)) = next else { break };
                        let result = ws_tx.send(WsMessage::Text(text)).await.map_err(|e| e.to_string());
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("WebSocket writer stopped");
        });

        let closing = self.closing.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closing.cancelled() => break,
                    frame = ws_rx.next() => frame,
                };
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(?frame, "Server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                };
                if inbound.send(text).is_err() {
                    break;
                }
            }
            tracing::debug!("WebSocket reader stopped");
        });

        *self.outgoing.lock().await = Some(tx);

        if let Some(login) = &self.login_payload {
            self.send(login.to_string()).await?;
            tracing::info!("Login payload sent");
        }
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), AgentError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let guard = self.outgoing.lock().await;
            let sender = guard
                .as_ref()
                .ok_or_else(|| AgentError::TransportFailure("not connected".to_string()))?;
            sender
                .send((text, ack_tx))
                .map_err(|_| AgentError::TransportFailure("connection closed".to_string()))?;
        }
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AgentError::TransportFailure(e)),
            Err(_) => Err(AgentError::TransportFailure("writer stopped".to_string())),
        }
    }

    async fn close(&self) {
        self.closing.cancel();
        self.outgoing.lock().await.take();
        tracing::info!(url = %self.url, "WebSocket closed");
    }
}
