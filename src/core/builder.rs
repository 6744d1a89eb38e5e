//! Agent 管理器构建器：统一的初始化逻辑
//!
//! 收集角色、状态映射、事件钩子与阶段回调，`build()` 时一次性接线：
//! 状态对 → 分发器（持有写端）→ 执行器 / 连续调度 / 阶段驱动 → 管理器。

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::core::dispatcher::{hook_fn, EventDispatcher, EventHook, HookStage};
use crate::core::executor::TurnExecutor;
use crate::core::manager::{
    AgentManager, ConnectionState, ManagerSettings, PhaseDriver, PhaseHook, ScheduledAction,
};
use crate::core::scheduler::ContinuousScheduler;
use crate::core::state::{phase_state, value_to_id, GameState, PhaseId, PropertyMapping, StateHandler};
use crate::core::AgentError;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::prompts::TemplateSource;
use crate::role::{AgentRole, CapabilityResolver, RoleCatalog, RoleSlot, TemplateOnly};
use crate::transport::{Outbox, Transport, WebSocketTransport};

/// Agent 管理器构建器
pub struct AgentManagerBuilder {
    settings: ManagerSettings,
    transport: Option<Arc<dyn Transport>>,
    llm: Option<Arc<dyn LlmClient>>,
    roles: BTreeMap<u32, AgentRole>,
    initial_role: Option<u32>,
    initial_state: GameState,
    mappings: Vec<PropertyMapping>,
    state_handlers: Vec<(String, StateHandler)>,
    hooks: Vec<(HookStage, Option<String>, Arc<dyn EventHook>)>,
    start_hooks: Vec<PhaseHook>,
    end_hooks: Vec<PhaseHook>,
    shutdown: CancellationToken,
    errors: Vec<AgentError>,
}

impl AgentManagerBuilder {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            transport: None,
            llm: None,
            roles: BTreeMap::new(),
            initial_role: None,
            initial_state: GameState::default(),
            mappings: Vec::new(),
            state_handlers: Vec::new(),
            hooks: Vec::new(),
            start_hooks: Vec::new(),
            end_hooks: Vec::new(),
            shutdown: CancellationToken::new(),
            errors: Vec::new(),
        }
    }

    /// 从配置构建：[[roles]] 均为纯模板角色，[[mappings]] 作为状态映射，
    /// 传输为 [server] 指定的 WebSocket，推理后端按 [llm] 选择
    pub fn from_config(cfg: &AppConfig, templates: Arc<dyn TemplateSource>) -> Result<Self, AgentError> {
        cfg.validate()?;
        let mut builder = Self::new(ManagerSettings::from_config(cfg)?)
            .with_transport(Arc::new(WebSocketTransport::new(
                &cfg.server.url,
                cfg.server.login_payload.clone(),
            )))
            .with_llm(create_llm_from_config(cfg)?);

        for role_cfg in &cfg.roles {
            let role = role_cfg.to_role()?;
            builder = builder.with_role(AgentRole::with_behavior(role, &TemplateOnly, Arc::clone(&templates)));
        }
        if let Some(id) = cfg.agent.role {
            builder = builder.with_initial_role(id);
        }
        for mapping in &cfg.mappings {
            builder = builder.with_mapping(mapping.clone());
        }
        Ok(builder)
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 加入角色目录（同 id 覆盖）
    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.roles.insert(role.role().id(), role);
        self
    }

    /// 启动时持有的角色
    pub fn with_initial_role(mut self, id: u32) -> Self {
        self.initial_role = Some(id);
        self
    }

    /// 对目录中的角色追加注册（显式注册优先于约定方法与模板）
    pub fn configure_role(mut self, id: u32, f: impl FnOnce(&mut CapabilityResolver)) -> Self {
        match self.roles.get_mut(&id) {
            Some(role) => f(role.resolver_mut()),
            None => self
                .errors
                .push(AgentError::ConfigError(format!("Unknown role id {id}"))),
        }
        self
    }

    pub fn with_initial_state(mut self, state: GameState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_mapping(mut self, mapping: PropertyMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// 某事件类型的自定义状态更新
    pub fn on_state_event(
        mut self,
        event_type: &str,
        handler: impl Fn(&mut GameState, &Value) + Send + Sync + 'static,
    ) -> Self {
        let handler: StateHandler = Arc::new(handler);
        self.state_handlers.push((event_type.to_string(), handler));
        self
    }

    /// 在指定阶段注册钩子；类型相关阶段需要 event_type
    pub fn with_hook(mut self, stage: HookStage, event_type: Option<&str>, hook: Arc<dyn EventHook>) -> Self {
        let needs_type = matches!(
            stage,
            HookStage::TypePre | HookStage::TypeHandler | HookStage::TypePost
        );
        if needs_type != event_type.is_some() {
            self.errors.push(AgentError::ConfigError(format!(
                "Hook stage {stage} {} an event type",
                if needs_type { "requires" } else { "does not take" }
            )));
            return self;
        }
        self.hooks.push((stage, event_type.map(String::from), hook));
        self
    }

    /// 事件类型处理器（阶段 4）
    pub fn on_event(self, event_type: &str, hook: Arc<dyn EventHook>) -> Self {
        self.with_hook(HookStage::TypeHandler, Some(event_type), hook)
    }

    pub fn on_phase_start(mut self, hook: impl Fn(PhaseId) + Send + Sync + 'static) -> Self {
        self.start_hooks.push(Arc::new(hook));
        self
    }

    pub fn on_phase_end(mut self, hook: impl Fn(PhaseId) + Send + Sync + 'static) -> Self {
        self.end_hooks.push(Arc::new(hook));
        self
    }

    /// 外部关闭令牌（如 ShutdownManager::token）
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> Result<AgentManager, AgentError> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }
        let transport = self
            .transport
            .ok_or_else(|| AgentError::ConfigError("No transport configured".to_string()))?;
        let llm = self
            .llm
            .ok_or_else(|| AgentError::ConfigError("No LLM client configured".to_string()))?;
        let settings = self.settings;

        let mut catalog = RoleCatalog::new();
        for (_, role) in self.roles {
            tracing::debug!(
                role = role.role().name(),
                bindings = ?role.resolver().registry().bound_keys(),
                "Role registered"
            );
            catalog.insert(role);
        }
        let catalog = Arc::new(catalog);

        let mut initial_state = self.initial_state;
        if initial_state.meta.run_id.is_none() {
            initial_state.meta.run_id = settings.run_id.clone();
        }
        let roles = match self.initial_role {
            Some(id) => {
                let role = catalog
                    .get(id)
                    .ok_or_else(|| AgentError::ConfigError(format!("Unknown initial role id {id}")))?;
                initial_state.meta.role = Some(id);
                RoleSlot::with_role(role)
            }
            None => RoleSlot::new(),
        };

        let (writer, reader) = phase_state(initial_state, settings.reject_backward_phase);
        let outbox = Outbox::new(Arc::clone(&transport), settings.run_id.clone(), settings.send_policy);
        let executor = TurnExecutor::new(outbox.clone(), llm, reader.clone(), settings.infer_timeout);

        let scheduler = Arc::new(ContinuousScheduler::new(
            settings.delay,
            reader.clone(),
            Arc::new(ScheduledAction {
                roles: roles.clone(),
                executor: executor.clone(),
            }),
            self.shutdown.clone(),
        ));
        let driver = Arc::new(PhaseDriver {
            roles: roles.clone(),
            executor,
            scheduler,
            continuous: settings.continuous_phases.clone(),
            start_hooks: self.start_hooks,
            end_hooks: self.end_hooks,
            shutdown: self.shutdown.clone(),
            tasks: TaskTracker::new(),
            entered: AtomicBool::new(false),
        });

        let mut dispatcher = EventDispatcher::new(
            writer,
            outbox.clone(),
            &settings.phase_transition_event,
            &settings.phase_key,
        );
        for mapping in self.mappings {
            dispatcher.add_mapping(mapping)?;
        }
        register_builtin_handlers(&mut dispatcher, &settings, &catalog, &roles);
        for (event_type, handler) in self.state_handlers {
            dispatcher.on_state_event(&event_type, move |state, data| handler(state, data));
        }
        for (stage, event_type, hook) in self.hooks {
            match (stage, event_type) {
                (HookStage::GlobalPre, _) => dispatcher.add_global_pre_hook(hook),
                (HookStage::GlobalHandler, _) => dispatcher.add_global_handler(hook),
                (HookStage::GlobalPost, _) => dispatcher.add_global_post_hook(hook),
                (HookStage::TypePre, Some(e)) => dispatcher.add_pre_hook(&e, hook),
                (HookStage::TypeHandler, Some(e)) => dispatcher.add_handler(&e, hook),
                (HookStage::TypePost, Some(e)) => dispatcher.add_post_hook(&e, hook),
                (_, None) => {}
            }
        }
        dispatcher.set_transition_listener(driver.clone());

        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Ok(AgentManager {
            settings,
            transport,
            dispatcher: Mutex::new(dispatcher),
            state: reader,
            roles,
            catalog,
            outbox,
            driver,
            connection,
            shutdown: self.shutdown,
            closed: AtomicBool::new(false),
        })
    }
}

/// 内置事件：角色分配、名字分配（+ 就绪回复）
fn register_builtin_handlers(
    dispatcher: &mut EventDispatcher,
    settings: &ManagerSettings,
    catalog: &Arc<RoleCatalog>,
    roles: &RoleSlot,
) {
    if let Some(event) = &settings.role_assignment_event {
        dispatcher.on_state_event(event, |state, data| {
            if let Some(id) = role_id(data) {
                state.meta.role = Some(id);
            }
        });

        let catalog = Arc::clone(catalog);
        let roles = roles.clone();
        dispatcher.add_handler(
            event,
            hook_fn(move |message, _ctx| {
                let catalog = Arc::clone(&catalog);
                let roles = roles.clone();
                async move {
                    let id = role_id(&message.data).ok_or_else(|| {
                        AgentError::MalformedMessage("role assignment without a role id".to_string())
                    })?;
                    let role = catalog.get(id).ok_or_else(|| {
                        AgentError::HandlerFailed(format!(
                            "assigned role {id} is not in the role catalog {:?}",
                            catalog.ids()
                        ))
                    })?;
                    tracing::info!(role_id = id, role = role.role().name(), "Role assigned");
                    roles.set(role).await;
                    Ok::<(), AgentError>(())
                }
            }),
        );
    }

    if let Some(event) = &settings.name_assignment_event {
        dispatcher.on_state_event(event, |state, data| {
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                state.meta.player_name = Some(name.to_string());
            }
            if let Some(number) = data.get("number").and_then(Value::as_i64) {
                state.meta.player_number = Some(number);
            }
        });

        if let Some(ready) = settings.ready_message_type.clone() {
            dispatcher.add_handler(
                event,
                hook_fn(move |_message, ctx| {
                    let ready = ready.clone();
                    async move {
                        ctx.outbox.send(json!({ "type": ready })).await?;
                        tracing::info!(message_type = %ready, "Ready message sent");
                        Ok::<(), AgentError>(())
                    }
                }),
            );
        }
    }
}

fn role_id(data: &Value) -> Option<u32> {
    data.get("role")
        .and_then(value_to_id)
        .and_then(|id| id.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::prompts::TemplateStore;
    use crate::role::{PhaseSelection, Role};
    use crate::transport::MemoryTransport;

    fn build_err(builder: AgentManagerBuilder) -> AgentError {
        match builder.build() {
            Err(e) => e,
            Ok(_) => panic!("Expected build to fail"),
        }
    }

    fn settings() -> ManagerSettings {
        ManagerSettings::from_config(&AppConfig::default()).unwrap()
    }

    fn role(id: u32, name: &str) -> AgentRole {
        AgentRole::with_behavior(
            Role::new(id, name, PhaseSelection::Any),
            &TemplateOnly,
            Arc::new(TemplateStore::new()),
        )
    }

    #[test]
    fn test_build_requires_transport() {
        let err = build_err(AgentManagerBuilder::new(settings()).with_llm(Arc::new(MockLlmClient::new())));
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_unknown_initial_role_rejected() {
        let err = build_err(
            AgentManagerBuilder::new(settings())
                .with_transport(Arc::new(MemoryTransport::new()))
                .with_llm(Arc::new(MockLlmClient::new()))
                .with_role(role(1, "Owner"))
                .with_initial_role(2),
        );
        assert!(err.to_string().contains("Unknown initial role id 2"));
    }

    #[test]
    fn test_type_hook_without_event_rejected() {
        let hook = hook_fn(|_, _| async { Ok::<_, AgentError>(()) });
        let err = build_err(
            AgentManagerBuilder::new(settings())
                .with_transport(Arc::new(MemoryTransport::new()))
                .with_llm(Arc::new(MockLlmClient::new()))
                .with_hook(HookStage::TypePre, None, hook),
        );
        assert_eq!(err.kind(), "config_error");
    }

    #[tokio::test]
    async fn test_initial_role_is_held() {
        let manager = AgentManagerBuilder::new(settings())
            .with_transport(Arc::new(MemoryTransport::new()))
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_role(role(1, "Owner"))
            .with_role(role(2, "Developer"))
            .with_initial_role(2)
            .configure_role(1, |resolver| {
                resolver.register_user_prompt(1, |_| Ok("registered".to_string()))
            })
            .build()
            .unwrap_or_else(|e| panic!("build failed: {e}"));

        let held = manager.roles().get().await.unwrap();
        assert_eq!(held.role().name(), "Developer");
        assert_eq!(manager.state().snapshot().meta.role, Some(2));
        assert_eq!(manager.catalog().ids(), vec![1, 2]);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_role_id_accepts_string_and_number() {
        assert_eq!(role_id(&json!({"role": 3})), Some(3));
        assert_eq!(role_id(&json!({"role": "2"})), Some(2));
        assert_eq!(role_id(&json!({"role": "owner"})), None);
    }
}
