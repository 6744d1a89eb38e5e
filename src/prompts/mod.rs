//! Prompt 模板
//!
//! 从 config/prompts/ 加载 `*.jinja2` 模板，文件名（去扩展名）即模板键，
//! 如 `owner_system_p2.jinja2` → `owner_system_p2`。渲染上下文为整份状态文档
//! （`meta` / `private_information` / `public_information`）。

use std::path::{Path, PathBuf};

use minijinja::Environment;

use crate::core::state::GameState;
use crate::core::AgentError;

/// 模板查找与渲染能力
pub trait TemplateSource: Send + Sync {
    fn contains(&self, key: &str) -> bool;

    fn render(&self, key: &str, state: &GameState) -> Result<String, AgentError>;
}

const TEMPLATE_EXT: &str = "jinja2";

/// minijinja 模板库
pub struct TemplateStore {
    env: Environment<'static>,
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// 添加单个模板（同名覆盖）
    pub fn add(&mut self, key: &str, source: &str) -> Result<(), AgentError> {
        self.env
            .add_template_owned(key.to_string(), source.to_string())
            .map_err(|e| AgentError::TemplateError(format!("{key}: {e}")))
    }

    /// 加载目录下所有 `*.jinja2`；目录不存在时返回空库
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref();
        let mut store = Self::new();
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "Prompt directory not found, no templates loaded");
            return Ok(store);
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| AgentError::TemplateError(format!("{}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)
                .map_err(|e| AgentError::TemplateError(format!("{}: {e}", path.display())))?;
            store.add(key, &source)?;
        }

        tracing::info!(dir = %dir.display(), count = store.keys().len(), "Prompt templates loaded");
        Ok(store)
    }

    /// 从默认位置加载
    pub fn from_default() -> Result<Self, AgentError> {
        let dirs = [
            PathBuf::from("config/prompts"),
            PathBuf::from("../config/prompts"),
        ];
        let dir = dirs
            .into_iter()
            .find(|d| d.exists())
            .unwrap_or_else(|| PathBuf::from("config/prompts"));
        Self::load_dir(dir)
    }

    /// 已加载的模板键（排序）
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .env
            .templates()
            .map(|(name, _)| name.to_string())
            .collect();
        keys.sort();
        keys
    }
}

impl TemplateSource for TemplateStore {
    fn contains(&self, key: &str) -> bool {
        self.env.get_template(key).is_ok()
    }

    fn render(&self, key: &str, state: &GameState) -> Result<String, AgentError> {
        let template = self
            .env
            .get_template(key)
            .map_err(|e| AgentError::TemplateError(format!("{key}: {e}")))?;
        template
            .render(state)
            .map_err(|e| AgentError::TemplateError(format!("{key}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_with_state_context() {
        let mut store = TemplateStore::new();
        store
            .add(
                "owner_user_p2",
                "Phase {{ meta.phase }}: you are {{ meta.player_name }}, value {{ private_information.value }}",
            )
            .unwrap();

        let mut state = GameState::default();
        state.meta.phase = 2;
        state.meta.player_name = Some("Alice".to_string());
        state.private_information.insert("value".to_string(), json!(120));

        let text = store.render("owner_user_p2", &state).unwrap();
        assert_eq!(text, "Phase 2: you are Alice, value 120");
    }

    #[test]
    fn test_missing_key() {
        let store = TemplateStore::new();
        assert!(!store.contains("all_system"));
        let err = store.render("all_system", &GameState::default()).unwrap_err();
        assert_eq!(err.kind(), "template_error");
    }

    #[test]
    fn test_load_dir_uses_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("all_system.jinja2"), "You are a participant.").unwrap();
        std::fs::write(dir.path().join("speculator_user_p6.jinja2"), "Trade now.").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let store = TemplateStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.keys(), vec!["all_system", "speculator_user_p6"]);
        assert!(store.contains("speculator_user_p6"));
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let store = TemplateStore::load_dir("/nonexistent/prompts").unwrap();
        assert!(store.keys().is_empty());
    }
}
