//! 能力解析级联
//!
//! 提示词：注册 → 约定方法 → `{role}_{kind}_p{phase}` → `{role}_{kind}`
//! → `all_{kind}_p{phase}` → `all_{kind}` → CapabilityNotFound。
//! 解析器 / 阶段处理器：注册 → 约定方法 → 内置默认实现。
//!
//! 结果按 (phase, aspect) 缓存；任何注册都会清空缓存，保证后注册的第 1 层优先。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::core::state::{GameState, PhaseId};
use crate::core::AgentError;
use crate::prompts::TemplateSource;
use crate::role::registry::{Aspect, Capability, HandlerRegistry, PhaseHandler};

/// 解析结果（带层级标签）
#[derive(Debug, Clone)]
pub enum Resolution {
    Registered(Capability),
    MethodBound(Capability),
    Template { key: String, tier: u8 },
    /// 内置默认实现（默认解析器 / 默认动作流程）
    Default,
}

impl Resolution {
    /// 级联层级（1-6）；内置默认实现没有层级
    pub fn tier(&self) -> Option<u8> {
        match self {
            Resolution::Registered(_) => Some(1),
            Resolution::MethodBound(_) => Some(2),
            Resolution::Template { tier, .. } => Some(*tier),
            Resolution::Default => None,
        }
    }
}

/// 模板键（层级 3-6），按查找顺序
pub fn template_keys(role_name: &str, phase: PhaseId, kind: &str) -> [(u8, String); 4] {
    let role = role_name.to_lowercase();
    [
        (3, format!("{role}_{kind}_p{phase}")),
        (4, format!("{role}_{kind}")),
        (5, format!("all_{kind}_p{phase}")),
        (6, format!("all_{kind}")),
    ]
}

/// 内置默认解析：JSON 解码；非法 JSON 不报错，返回带原文的错误对象
pub fn default_parse(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(e) => json!({
            "error": format!("Failed to parse response as JSON: {e}"),
            "raw_response": raw,
        }),
    }
}

/// 单个角色的能力解析器
pub struct CapabilityResolver {
    role_name: String,
    registry: HandlerRegistry,
    templates: Arc<dyn TemplateSource>,
    cache: Mutex<HashMap<(PhaseId, Aspect), Resolution>>,
}

impl CapabilityResolver {
    pub fn new(role_name: &str, registry: HandlerRegistry, templates: Arc<dyn TemplateSource>) -> Self {
        Self {
            role_name: role_name.to_string(),
            registry,
            templates,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 按级联解析；成功结果写入缓存
    pub fn resolve(&self, phase: PhaseId, aspect: Aspect) -> Result<Resolution, AgentError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&(phase, aspect)) {
                return Ok(hit.clone());
            }
        }

        let resolution = self.lookup(phase, aspect)?;
        tracing::debug!(
            role = %self.role_name,
            phase,
            aspect = %aspect,
            tier = ?resolution.tier(),
            "Capability resolved"
        );
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((phase, aspect), resolution.clone());
        Ok(resolution)
    }

    fn lookup(&self, phase: PhaseId, aspect: Aspect) -> Result<Resolution, AgentError> {
        if let Some(cap) = self.registry.registered(phase, aspect) {
            return Ok(Resolution::Registered(cap));
        }
        if let Some(cap) = self.registry.method(phase, aspect) {
            return Ok(Resolution::MethodBound(cap));
        }

        let Some(kind) = aspect.template_kind() else {
            return Ok(Resolution::Default);
        };
        for (tier, key) in template_keys(&self.role_name, phase, kind) {
            if self.templates.contains(&key) {
                return Ok(Resolution::Template { key, tier });
            }
        }

        Err(AgentError::CapabilityNotFound {
            role: self.role_name.clone(),
            phase,
            aspect,
        })
    }

    fn invalidate(&mut self) {
        self.cache.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn register_system_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) {
        self.registry.register_system_prompt(phase, f);
        self.invalidate();
    }

    pub fn register_user_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) {
        self.registry.register_user_prompt(phase, f);
        self.invalidate();
    }

    pub fn register_response_parser(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&str, &GameState) -> Result<Option<Value>, AgentError> + Send + Sync + 'static,
    ) {
        self.registry.register_response_parser(phase, f);
        self.invalidate();
    }

    pub fn register_phase_handler(&mut self, phase: PhaseId, handler: Arc<dyn PhaseHandler>) {
        self.registry.register_phase_handler(phase, handler);
        self.invalidate();
    }

    /// 解析并渲染系统 / 用户提示词
    pub fn render_prompt(
        &self,
        phase: PhaseId,
        aspect: Aspect,
        state: &GameState,
    ) -> Result<String, AgentError> {
        match self.resolve(phase, aspect)? {
            Resolution::Registered(Capability::Prompt(f))
            | Resolution::MethodBound(Capability::Prompt(f)) => f(state),
            Resolution::Template { key, .. } => self.templates.render(&key, state),
            other => Err(AgentError::HandlerFailed(format!(
                "{aspect} for phase {phase} resolved to {other:?}"
            ))),
        }
    }

    /// 解析并调用响应解析器；None 表示不发送
    pub fn parse_response(
        &self,
        phase: PhaseId,
        raw: &str,
        state: &GameState,
    ) -> Result<Option<Value>, AgentError> {
        match self.resolve(phase, Aspect::ResponseParser)? {
            Resolution::Registered(Capability::Parser(f))
            | Resolution::MethodBound(Capability::Parser(f)) => f(raw, state),
            Resolution::Default => Ok(Some(default_parse(raw))),
            other => Err(AgentError::HandlerFailed(format!(
                "response-parser for phase {phase} resolved to {other:?}"
            ))),
        }
    }

    /// 自定义阶段处理器；None 表示走默认动作流程
    pub fn phase_handler(&self, phase: PhaseId) -> Result<Option<Arc<dyn PhaseHandler>>, AgentError> {
        match self.resolve(phase, Aspect::PhaseHandler)? {
            Resolution::Registered(Capability::Handler(h))
            | Resolution::MethodBound(Capability::Handler(h)) => Ok(Some(h)),
            Resolution::Default => Ok(None),
            other => Err(AgentError::HandlerFailed(format!(
                "phase-handler for phase {phase} resolved to {other:?}"
            ))),
        }
    }
}
