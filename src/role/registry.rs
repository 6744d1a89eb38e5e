//! 能力注册表
//!
//! 每个角色一张表：(phase, aspect) → Capability。两层来源：
//! - **registered**: 运行前显式注册的回调（级联第 1 层）
//! - **methods**: 角色在构造时通过 `RoleBehavior::bind_methods` 绑定的约定方法（第 2 层），
//!   取代按方法名（如 `get_phase_2_system_prompt`）的运行时反射
//!
//! 注册接口按能力面分型，保证 aspect 与实现类型一致。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::state::{GameState, PhaseId};
use crate::core::AgentError;

/// 能力面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aspect {
    SystemPrompt,
    UserPrompt,
    ResponseParser,
    PhaseHandler,
}

impl Aspect {
    /// 模板键中的类别名；只有提示词有模板
    pub fn template_kind(&self) -> Option<&'static str> {
        match self {
            Aspect::SystemPrompt => Some("system"),
            Aspect::UserPrompt => Some("user"),
            Aspect::ResponseParser | Aspect::PhaseHandler => None,
        }
    }
}

impl std::fmt::Display for Aspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aspect::SystemPrompt => write!(f, "system-prompt"),
            Aspect::UserPrompt => write!(f, "user-prompt"),
            Aspect::ResponseParser => write!(f, "response-parser"),
            Aspect::PhaseHandler => write!(f, "phase-handler"),
        }
    }
}

/// 提示词构造：状态 → 文本
pub type PromptFn = Arc<dyn Fn(&GameState) -> Result<String, AgentError> + Send + Sync>;

/// 响应解析：原始响应 + 状态 → 待发送载荷（None 表示不发送）
pub type ParserFn =
    Arc<dyn Fn(&str, &GameState) -> Result<Option<Value>, AgentError> + Send + Sync>;

/// 自定义阶段处理器：完全接管该阶段的动作
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn handle(
        &self,
        phase: PhaseId,
        state: Arc<GameState>,
    ) -> Result<Option<Value>, AgentError>;
}

struct FnPhaseHandler<F>(F);

#[async_trait]
impl<F, Fut> PhaseHandler for FnPhaseHandler<F>
where
    F: Fn(PhaseId, Arc<GameState>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, AgentError>> + Send,
{
    async fn handle(
        &self,
        phase: PhaseId,
        state: Arc<GameState>,
    ) -> Result<Option<Value>, AgentError> {
        (self.0)(phase, state).await
    }
}

/// 用异步闭包构造阶段处理器
pub fn phase_handler_fn<F, Fut>(f: F) -> Arc<dyn PhaseHandler>
where
    F: Fn(PhaseId, Arc<GameState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, AgentError>> + Send + 'static,
{
    Arc::new(FnPhaseHandler(f))
}

/// 已绑定的实现
#[derive(Clone)]
pub enum Capability {
    Prompt(PromptFn),
    Parser(ParserFn),
    Handler(Arc<dyn PhaseHandler>),
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Prompt(_) => write!(f, "Capability::Prompt"),
            Capability::Parser(_) => write!(f, "Capability::Parser"),
            Capability::Handler(_) => write!(f, "Capability::Handler"),
        }
    }
}

type Bindings = HashMap<(PhaseId, Aspect), Capability>;

/// 约定方法表：角色构造时一次性填充
#[derive(Default)]
pub struct MethodTable {
    entries: Bindings,
}

impl MethodTable {
    pub fn system_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries
            .insert((phase, Aspect::SystemPrompt), Capability::Prompt(Arc::new(f)));
        self
    }

    pub fn user_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries
            .insert((phase, Aspect::UserPrompt), Capability::Prompt(Arc::new(f)));
        self
    }

    pub fn response_parser(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&str, &GameState) -> Result<Option<Value>, AgentError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries
            .insert((phase, Aspect::ResponseParser), Capability::Parser(Arc::new(f)));
        self
    }

    pub fn phase_handler(&mut self, phase: PhaseId, handler: Arc<dyn PhaseHandler>) -> &mut Self {
        self.entries
            .insert((phase, Aspect::PhaseHandler), Capability::Handler(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 角色行为：在构造时把按阶段的方法绑定进方法表
pub trait RoleBehavior: Send + Sync {
    fn bind_methods(&self, _table: &mut MethodTable) {}
}

/// 无约定方法的角色（完全依赖模板与默认流程）
pub struct TemplateOnly;

impl RoleBehavior for TemplateOnly {}

/// 注册表：显式注册 + 约定方法
#[derive(Default)]
pub struct HandlerRegistry {
    registered: Bindings,
    methods: Bindings,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_methods(behavior: &dyn RoleBehavior) -> Self {
        let mut table = MethodTable::default();
        behavior.bind_methods(&mut table);
        Self {
            registered: HashMap::new(),
            methods: table.entries,
        }
    }

    pub fn register_system_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) {
        self.registered
            .insert((phase, Aspect::SystemPrompt), Capability::Prompt(Arc::new(f)));
    }

    pub fn register_user_prompt(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&GameState) -> Result<String, AgentError> + Send + Sync + 'static,
    ) {
        self.registered
            .insert((phase, Aspect::UserPrompt), Capability::Prompt(Arc::new(f)));
    }

    pub fn register_response_parser(
        &mut self,
        phase: PhaseId,
        f: impl Fn(&str, &GameState) -> Result<Option<Value>, AgentError> + Send + Sync + 'static,
    ) {
        self.registered
            .insert((phase, Aspect::ResponseParser), Capability::Parser(Arc::new(f)));
    }

    pub fn register_phase_handler(&mut self, phase: PhaseId, handler: Arc<dyn PhaseHandler>) {
        self.registered
            .insert((phase, Aspect::PhaseHandler), Capability::Handler(handler));
    }

    /// 第 1 层
    pub fn registered(&self, phase: PhaseId, aspect: Aspect) -> Option<Capability> {
        self.registered.get(&(phase, aspect)).cloned()
    }

    /// 第 2 层
    pub fn method(&self, phase: PhaseId, aspect: Aspect) -> Option<Capability> {
        self.methods.get(&(phase, aspect)).cloned()
    }

    /// 返回已注册的 (phase, aspect) 列表，用于启动日志
    pub fn bound_keys(&self) -> Vec<(PhaseId, Aspect)> {
        let mut keys: Vec<_> = self
            .registered
            .keys()
            .chain(self.methods.keys())
            .copied()
            .collect();
        keys.sort_by_key(|(phase, aspect)| (*phase, aspect.to_string()));
        keys.dedup();
        keys
    }
}
