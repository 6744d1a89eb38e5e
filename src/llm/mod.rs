//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatMessage, ChatRole, LlmClient};

use crate::config::{AppConfig, LlmSection};
use crate::core::AgentError;

/// 按配置创建推理后端；只有 provider=mock 使用 Mock，其余后端缺少 OPENAI_API_KEY 时报错
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    select_llm(&cfg.llm, std::env::var("OPENAI_API_KEY").ok())
}

fn select_llm(section: &LlmSection, api_key: Option<String>) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = section.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Ok(Arc::new(MockLlmClient::new()));
    }

    let key = api_key.filter(|k| !k.trim().is_empty()).ok_or_else(|| {
        AgentError::ConfigError(format!(
            "LLM provider '{provider}' requires OPENAI_API_KEY (set [llm] provider = \"mock\" for offline runs)"
        ))
    })?;
    tracing::info!(provider = %provider, model = %section.model, "Using OpenAI-compatible LLM");
    Ok(Arc::new(OpenAiClient::from_section(section, &key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = match select_llm(&LlmSection::default(), None) {
            Err(e) => e,
            Ok(_) => panic!("Expected missing key to fail"),
        };
        assert_eq!(err.kind(), "config_error");
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        assert!(select_llm(&LlmSection::default(), Some("  ".to_string())).is_err());
    }

    #[test]
    fn test_mock_provider_needs_no_key() {
        let section = LlmSection {
            provider: "Mock".to_string(),
            ..LlmSection::default()
        };
        assert!(select_llm(&section, None).is_ok());
    }

    #[test]
    fn test_openai_provider_with_key() {
        assert!(select_llm(&LlmSection::default(), Some("sk-test".to_string())).is_ok());
    }
}
