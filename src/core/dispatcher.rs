//! 事件分发
//!
//! 每条入站报文依次经过六个阶段（均可为空）：
//! 1. 全局前置钩子 2. 类型前置钩子 3. 全局处理器（内置状态更新在最前）
//! 4. 类型处理器 5. 类型后置钩子 6. 全局后置钩子
//!
//! 钩子出错只记录 (event_type, stage, kind) 并继续后续钩子与阶段。
//! 阶段 3 检测到阶段转换时，在阶段 4 之前通知 `TransitionListener`。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::state::{
    ApplyOutcome, GameState, PhaseId, PropertyMapping, StateDelta, StateHandler, StateHandlers,
    StateReader, StateWriter,
};
use crate::core::AgentError;
use crate::transport::{Message, Outbox};

/// 钩子可见的上下文：状态读端 + 出站信箱
#[derive(Clone)]
pub struct EventContext {
    pub state: StateReader,
    pub outbox: Outbox,
}

/// 事件钩子 / 处理器
#[async_trait]
pub trait EventHook: Send + Sync {
    async fn call(&self, message: &Message, ctx: &EventContext) -> Result<(), AgentError>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> EventHook for FnHook<F>
where
    F: Fn(Message, EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AgentError>> + Send,
{
    async fn call(&self, message: &Message, ctx: &EventContext) -> Result<(), AgentError> {
        (self.0)(message.clone(), ctx.clone()).await
    }
}

/// 用异步闭包构造钩子
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn EventHook>
where
    F: Fn(Message, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

/// 阶段转换监听（由管理器实现，驱动阶段动作与连续调度）
#[async_trait]
pub trait TransitionListener: Send + Sync {
    async fn on_transition(&self, outcome: &ApplyOutcome);
}

/// 钩子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    GlobalPre,
    TypePre,
    GlobalHandler,
    TypeHandler,
    TypePost,
    GlobalPost,
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookStage::GlobalPre => "global_pre",
            HookStage::TypePre => "type_pre",
            HookStage::GlobalHandler => "global_handler",
            HookStage::TypeHandler => "type_handler",
            HookStage::TypePost => "type_post",
            HookStage::GlobalPost => "global_post",
        };
        write!(f, "{name}")
    }
}

/// 单条报文的分发结果
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub transition: Option<ApplyOutcome>,
    /// 出错的钩子数
    pub failures: usize,
}

type Hooks = Vec<Arc<dyn EventHook>>;

/// 事件分发器：唯一持有状态写端
pub struct EventDispatcher {
    writer: StateWriter,
    ctx: EventContext,
    phase_event: String,
    phase_key: String,
    mappings: Vec<PropertyMapping>,
    state_handlers: StateHandlers,
    global_pre: Hooks,
    type_pre: HashMap<String, Hooks>,
    global_handlers: Hooks,
    type_handlers: HashMap<String, Hooks>,
    type_post: HashMap<String, Hooks>,
    global_post: Hooks,
    listener: Option<Arc<dyn TransitionListener>>,
}

impl EventDispatcher {
    pub fn new(writer: StateWriter, outbox: Outbox, phase_event: &str, phase_key: &str) -> Self {
        let ctx = EventContext {
            state: writer.reader(),
            outbox,
        };
        Self {
            writer,
            ctx,
            phase_event: phase_event.to_string(),
            phase_key: phase_key.to_string(),
            mappings: Vec::new(),
            state_handlers: HashMap::new(),
            global_pre: Vec::new(),
            type_pre: HashMap::new(),
            global_handlers: Vec::new(),
            type_handlers: HashMap::new(),
            type_post: HashMap::new(),
            global_post: Vec::new(),
            listener: None,
        }
    }

    pub fn reader(&self) -> StateReader {
        self.writer.reader()
    }

    pub fn context(&self) -> EventContext {
        self.ctx.clone()
    }

    pub fn add_mapping(&mut self, mapping: PropertyMapping) -> Result<(), AgentError> {
        mapping.validate()?;
        self.mappings.push(mapping);
        Ok(())
    }

    /// 为某事件类型注册自定义状态更新（替代该事件的映射更新）
    pub fn on_state_event(
        &mut self,
        event_type: &str,
        handler: impl Fn(&mut GameState, &Value) + Send + Sync + 'static,
    ) {
        let handler: StateHandler = Arc::new(handler);
        self.state_handlers.insert(event_type.to_string(), handler);
    }

    pub fn add_global_pre_hook(&mut self, hook: Arc<dyn EventHook>) {
        self.global_pre.push(hook);
    }

    pub fn add_pre_hook(&mut self, event_type: &str, hook: Arc<dyn EventHook>) {
        self.type_pre.entry(event_type.to_string()).or_default().push(hook);
    }

    pub fn add_global_handler(&mut self, hook: Arc<dyn EventHook>) {
        self.global_handlers.push(hook);
    }

    pub fn add_handler(&mut self, event_type: &str, hook: Arc<dyn EventHook>) {
        self.type_handlers
            .entry(event_type.to_string())
            .or_default()
            .push(hook);
    }

    pub fn add_post_hook(&mut self, event_type: &str, hook: Arc<dyn EventHook>) {
        self.type_post.entry(event_type.to_string()).or_default().push(hook);
    }

    pub fn add_global_post_hook(&mut self, hook: Arc<dyn EventHook>) {
        self.global_post.push(hook);
    }

    pub fn set_transition_listener(&mut self, listener: Arc<dyn TransitionListener>) {
        self.listener = Some(listener);
    }

    /// 按阶段顺序处理一条报文
    pub async fn dispatch(&self, message: &Message) -> DispatchOutcome {
        let event_type = message.event_type.as_str();
        let mut outcome = DispatchOutcome::default();

        outcome.failures += self.run_stage(HookStage::GlobalPre, &self.global_pre, message).await;
        if let Some(hooks) = self.type_pre.get(event_type) {
            outcome.failures += self.run_stage(HookStage::TypePre, hooks, message).await;
        }

        let applied = self.update_state(message);
        outcome.failures += self
            .run_stage(HookStage::GlobalHandler, &self.global_handlers, message)
            .await;
        if let Some(applied) = applied.filter(|a| a.transitioned) {
            tracing::info!(
                event_type,
                old_phase = applied.old_phase,
                new_phase = applied.new_phase,
                "Phase transition"
            );
            outcome.transition = Some(applied);
            if let Some(listener) = &self.listener {
                listener.on_transition(&applied).await;
            }
        }

        if let Some(hooks) = self.type_handlers.get(event_type) {
            outcome.failures += self.run_stage(HookStage::TypeHandler, hooks, message).await;
        }
        if let Some(hooks) = self.type_post.get(event_type) {
            outcome.failures += self.run_stage(HookStage::TypePost, hooks, message).await;
        }
        outcome.failures += self.run_stage(HookStage::GlobalPost, &self.global_post, message).await;

        outcome
    }

    async fn run_stage(&self, stage: HookStage, hooks: &[Arc<dyn EventHook>], message: &Message) -> usize {
        let mut failures = 0;
        for hook in hooks {
            if let Err(e) = hook.call(message, &self.ctx).await {
                failures += 1;
                tracing::warn!(
                    event_type = %message.event_type,
                    stage = %stage,
                    kind = e.kind(),
                    error = %e,
                    "Event handling failed"
                );
            }
        }
        failures
    }

    /// 内置状态更新：自定义状态处理器优先，否则按阶段事件 + 属性映射构造增量
    fn update_state(&self, message: &Message) -> Option<ApplyOutcome> {
        if let Some(handler) = self.state_handlers.get(&message.event_type) {
            let data = &message.data;
            return Some(self.writer.apply_with(|state| handler(state, data)));
        }

        let mut delta = StateDelta::new();
        if message.event_type == self.phase_event {
            match message.data.get(&self.phase_key).and_then(phase_value) {
                Some(phase) => delta.phase = Some(phase),
                None => tracing::warn!(
                    event_type = %message.event_type,
                    key = %self.phase_key,
                    "Phase transition event without a valid phase"
                ),
            }
        }

        let (current, _) = self.writer.current();
        for mapping in self.mappings.iter().filter(|m| m.applies_in(current)) {
            if let Some(value) = message.data.get(&mapping.event_key) {
                delta.push(mapping.section, &mapping.state_key, value.clone());
            }
        }

        if delta.is_empty() {
            return None;
        }
        Some(self.writer.apply(delta))
    }
}

fn phase_value(value: &Value) -> Option<PhaseId> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|p| PhaseId::try_from(p).ok())
}
