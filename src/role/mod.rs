//! 角色层：角色定义、能力注册表与解析级联
//!
//! - **Role**: id + 名称 + 行动阶段选择（包含集 / 排除集二选一）
//! - **registry**: (phase, aspect) → 实现 的显式注册表与约定方法表
//! - **resolver**: 注册 → 约定方法 → 四级模板 的级联解析与缓存
//! - **AgentRole / RoleCatalog / RoleSlot**: 运行时持有的角色及其能力

pub mod registry;
pub mod resolver;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::state::PhaseId;
use crate::core::AgentError;
use crate::prompts::TemplateSource;

pub use registry::{
    phase_handler_fn, Aspect, Capability, HandlerRegistry, MethodTable, ParserFn, PhaseHandler,
    PromptFn, RoleBehavior, TemplateOnly,
};
pub use resolver::{CapabilityResolver, Resolution};

/// 角色需要行动的阶段集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseSelection {
    /// 未声明任何集合：所有阶段都行动
    Any,
    /// 仅在这些阶段行动
    Only(BTreeSet<PhaseId>),
    /// 除这些阶段外都行动
    Except(BTreeSet<PhaseId>),
}

impl PhaseSelection {
    /// 从配置的两个列表构造；两者同时给出是配置错误
    pub fn from_lists(
        task_phases: Option<Vec<PhaseId>>,
        task_phases_excluded: Option<Vec<PhaseId>>,
    ) -> Result<Self, AgentError> {
        match (task_phases, task_phases_excluded) {
            (Some(_), Some(_)) => Err(AgentError::ConfigError(
                "Only one of task_phases or task_phases_excluded should be specified".to_string(),
            )),
            (Some(only), None) => Ok(PhaseSelection::Only(only.into_iter().collect())),
            (None, Some(except)) => Ok(PhaseSelection::Except(except.into_iter().collect())),
            (None, None) => Ok(PhaseSelection::Any),
        }
    }

    pub fn includes(&self, phase: PhaseId) -> bool {
        match self {
            PhaseSelection::Any => true,
            PhaseSelection::Only(set) => set.contains(&phase),
            PhaseSelection::Except(set) => !set.contains(&phase),
        }
    }
}

/// 角色：不可变的 id、名称与行动阶段声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    id: u32,
    name: String,
    phases: PhaseSelection,
}

impl Role {
    pub fn new(id: u32, name: &str, phases: PhaseSelection) -> Self {
        Self {
            id,
            name: name.to_string(),
            phases,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &PhaseSelection {
        &self.phases
    }

    /// 是否在该阶段行动（纯函数，只取决于声明与阶段号）
    pub fn is_eligible(&self, phase: PhaseId) -> bool {
        self.phases.includes(phase)
    }
}

/// 运行时角色：角色声明 + 该角色的能力解析器
pub struct AgentRole {
    role: Role,
    resolver: CapabilityResolver,
}

impl AgentRole {
    pub fn new(role: Role, resolver: CapabilityResolver) -> Self {
        Self { role, resolver }
    }

    /// 以约定方法表 + 模板源构建
    pub fn with_behavior(
        role: Role,
        behavior: &dyn RoleBehavior,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        let registry = HandlerRegistry::with_methods(behavior);
        let resolver = CapabilityResolver::new(role.name(), registry, templates);
        Self { role, resolver }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn resolver(&self) -> &CapabilityResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut CapabilityResolver {
        &mut self.resolver
    }
}

impl std::fmt::Debug for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRole").field("role", &self.role).finish()
    }
}

/// 角色目录：按 id 存储可分配的角色（用于 assign-role 事件）
#[derive(Default, Debug)]
pub struct RoleCatalog {
    roles: HashMap<u32, Arc<AgentRole>>,
}

impl RoleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: AgentRole) {
        self.roles.insert(role.role().id(), Arc::new(role));
    }

    pub fn get(&self, id: u32) -> Option<Arc<AgentRole>> {
        self.roles.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.roles.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// 当前 Agent 持有的角色（启动时或 assign-role 事件中设置）
#[derive(Clone, Default, Debug)]
pub struct RoleSlot {
    inner: Arc<RwLock<Option<Arc<AgentRole>>>>,
}

impl RoleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先持有某个角色
    pub fn with_role(role: Arc<AgentRole>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(role))),
        }
    }

    pub async fn get(&self) -> Option<Arc<AgentRole>> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, role: Arc<AgentRole>) {
        *self.inner.write().await = Some(role);
    }
}
