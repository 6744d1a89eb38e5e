//! Agent 错误类型
//!
//! 所有错误都只影响单个 Hook 阶段或单次阶段动作，不会穿透分发循环与调度循环；
//! `kind()` 给出稳定的错误类别名，用于结构化日志字段。

use thiserror::Error;

use crate::core::state::PhaseId;
use crate::role::Aspect;

/// 阶段编排过程中可能出现的错误（能力缺失、传输、报文、状态冲突、LLM 等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 解析级联已穷尽，仅对本次阶段动作致命
    #[error("Capability not found: role={role} phase={phase} aspect={aspect}")]
    CapabilityNotFound {
        role: String,
        phase: PhaseId,
        aspect: Aspect,
    },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// 报文缺少必需字段，丢弃该条后继续分发
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// 阶段号回退等不兼容更新
    #[error("State conflict: phase {from} -> {to}")]
    StateConflict { from: PhaseId, to: PhaseId },

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    /// 管理器生命周期误用（重复 start、stop 之后再 start）
    #[error("Invalid lifecycle: {0}")]
    InvalidLifecycle(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 错误类别（日志字段 `kind`）
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::CapabilityNotFound { .. } => "capability_not_found",
            AgentError::TransportFailure(_) => "transport_failure",
            AgentError::MalformedMessage(_) => "malformed_message",
            AgentError::StateConflict { .. } => "state_conflict",
            AgentError::LlmError(_) => "llm_error",
            AgentError::Timeout(_) => "timeout",
            AgentError::HandlerFailed(_) => "handler_failed",
            AgentError::TemplateError(_) => "template_error",
            AgentError::ConfigError(_) => "config_error",
            AgentError::InvalidLifecycle(_) => "invalid_lifecycle",
            AgentError::Cancelled => "cancelled",
        }
    }

    /// 出错的能力面（仅 CapabilityNotFound 携带）
    pub fn aspect(&self) -> Option<Aspect> {
        match self {
            AgentError::CapabilityNotFound { aspect, .. } => Some(*aspect),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_not_found_display() {
        let err = AgentError::CapabilityNotFound {
            role: "owner".to_string(),
            phase: 2,
            aspect: Aspect::UserPrompt,
        };
        let text = err.to_string();
        assert!(text.contains("owner"));
        assert!(text.contains("user-prompt"));
        assert_eq!(err.kind(), "capability_not_found");
        assert_eq!(err.aspect(), Some(Aspect::UserPrompt));
    }

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(AgentError::TransportFailure("x".into()).kind(), "transport_failure");
        assert_eq!(AgentError::StateConflict { from: 3, to: 1 }.kind(), "state_conflict");
        assert_eq!(AgentError::InvalidLifecycle("x".into()).kind(), "invalid_lifecycle");
        assert_eq!(AgentError::Cancelled.aspect(), None);
    }
}
