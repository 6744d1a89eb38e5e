//! 进程内传输
//!
//! 入站报文通过 `push` 注入（连接前注入的报文在 connect 时按序投递），出站报文记录在内存中。
//! 可注入发送失败与断线。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::core::AgentError;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct Inner {
    inbound: Option<mpsc::UnboundedSender<String>>,
    pending: Vec<String>,
    sent: Vec<String>,
}

/// 内存传输
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    fail_next: AtomicU32,
    sent_notify: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注入一条入站文本
    pub fn push(&self, text: impl Into<String>) {
        let text = text.into();
        let mut inner = self.lock();
        match &inner.inbound {
            Some(tx) => {
                if tx.send(text).is_err() {
                    tracing::debug!("Inbound receiver dropped, message discarded");
                }
            }
            None => inner.pending.push(text),
        }
    }

    pub fn push_json(&self, value: &Value) {
        self.push(value.to_string());
    }

    /// 已发出的原始文本
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// 已发出的报文（解析为 JSON）
    pub fn sent_json(&self) -> Vec<Value> {
        self.lock()
            .sent
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// 等待至少 count 条出站报文
    pub async fn wait_for_sent(&self, count: usize) {
        loop {
            let notified = self.sent_notify.notified();
            if self.lock().sent.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// 接下来 n 次 send 返回失败
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 模拟服务器断开：关闭入站通道
    pub fn disconnect(&self) {
        self.lock().inbound = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().inbound.is_some()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, inbound: mpsc::UnboundedSender<String>) -> Result<(), AgentError> {
        let mut inner = self.lock();
        for text in inner.pending.drain(..) {
            let _ = inbound.send(text);
        }
        inner.inbound = Some(inbound);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), AgentError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AgentError::TransportFailure("injected send failure".to_string()));
        }

        self.lock().sent.push(text);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.disconnect();
    }
}
