//! 传输层：与实验服务器之间的持久连接
//!
//! - **Transport**: connect / send / close；入站文本经 `mpsc` 通道交给管理器，连接关闭时通道随之关闭
//! - **Outbox**: 出站封装（附加 run id、单次超时、线性退避重试）
//! - **websocket**: tokio-tungstenite 客户端
//! - **memory**: 进程内传输（测试用）

pub mod memory;
pub mod message;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::TransportSection;
use crate::core::AgentError;

pub use memory::MemoryTransport;
pub use message::{join_payload, run_id_value, tag_outbound, Message};
pub use websocket::WebSocketTransport;

/// 连接抽象
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接；之后收到的每条文本报文按到达顺序写入 `inbound`
    async fn connect(&self, inbound: mpsc::UnboundedSender<String>) -> Result<(), AgentError>;

    /// 发送一条文本报文
    async fn send(&self, text: String) -> Result<(), AgentError>;

    async fn close(&self);
}

/// 发送重试策略
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    /// 总尝试次数（>= 1）
    pub attempts: u32,
    pub timeout: Duration,
    /// 第 n 次失败后等待 n * backoff
    pub backoff: Duration,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self::from_config(&TransportSection::default())
    }
}

impl SendPolicy {
    pub fn from_config(cfg: &TransportSection) -> Self {
        Self {
            attempts: cfg.send_retries.saturating_add(1),
            timeout: Duration::from_millis(cfg.send_timeout_ms),
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

/// 出站信箱：所有阶段动作与钩子都经由它发送
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    run_id: Option<String>,
    policy: SendPolicy,
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, run_id: Option<String>, policy: SendPolicy) -> Self {
        Self {
            transport,
            run_id,
            policy,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// 附加 run id 后发送；返回实际发出的载荷。只接受 JSON 对象（否则无处携带 run id）
    pub async fn send(&self, payload: Value) -> Result<Value, AgentError> {
        if !payload.is_object() {
            return Err(AgentError::HandlerFailed(format!(
                "outbound payload must be a JSON object, got {payload}"
            )));
        }
        let tagged = tag_outbound(payload, self.run_id());
        let text = serde_json::to_string(&tagged)
            .map_err(|e| AgentError::TransportFailure(format!("serialize error: {e}")))?;

        let attempts = self.policy.attempts.max(1);
        let mut last_error = AgentError::TransportFailure("not attempted".to_string());
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.timeout, self.transport.send(text.clone())).await {
                Ok(Ok(())) => {
                    tracing::debug!(attempt, payload = %text, "Message sent");
                    return Ok(tagged);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = AgentError::Timeout(format!(
                        "send exceeded {}ms",
                        self.policy.timeout.as_millis()
                    ))
                }
            }
            tracing::warn!(attempt, attempts, kind = last_error.kind(), error = %last_error, "Send attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff * attempt).await;
            }
        }

        Err(AgentError::TransportFailure(format!(
            "send failed after {attempts} attempts: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(attempts: u32) -> SendPolicy {
        SendPolicy {
            attempts,
            timeout: Duration::from_millis(100),
            backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retries_then_succeeds() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.fail_next_sends(2);

        let outbox = Outbox::new(transport.clone(), Some("42".to_string()), policy(3));
        let sent = outbox.send(json!({"type": "bid"})).await.unwrap();

        assert_eq!(sent["message_type"], json!(42));
        assert_eq!(transport.sent_json(), vec![json!({"type": "bid", "message_type": 42})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_exhausts_retries() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.fail_next_sends(5);

        let outbox = Outbox::new(transport.clone(), None, policy(2));
        let err = outbox.send(json!({"type": "bid"})).await.unwrap_err();

        assert_eq!(err.kind(), "transport_failure");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let outbox = Outbox::new(transport.clone(), Some("42".to_string()), policy(1));
        for payload in [json!([1, 2]), json!(3), json!("bid")] {
            let err = outbox.send(payload).await.unwrap_err();
            assert_eq!(err.kind(), "handler_failed");
        }
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_policy_from_config() {
        let policy = SendPolicy::from_config(&TransportSection {
            send_retries: 2,
            send_timeout_ms: 250,
            retry_backoff_ms: 40,
        });
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.timeout, Duration::from_millis(250));
    }
}
