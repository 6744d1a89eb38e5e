//! Agent 管理器：连接生命周期 + 阶段驱动
//!
//! - **AgentManager**: 连接传输、按到达顺序分发入站报文，直到 stop 或连接关闭
//! - **PhaseDriver**: 监听阶段转换：结束旧阶段（停止连续循环、on_phase_end）→ on_phase_start
//!   → 非连续阶段触发一次动作；连续阶段启动循环并立即触发一次
//!
//! 连接状态：Disconnected → Connecting → Connected → Running → Stopping → Disconnected（不重连）。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::core::dispatcher::{EventDispatcher, TransitionListener};
use crate::core::executor::TurnExecutor;
use crate::core::scheduler::{ContinuousScheduler, DelayBounds, PhaseAction};
use crate::core::state::{ApplyOutcome, PhaseId, StateReader};
use crate::core::AgentError;
use crate::role::{RoleCatalog, RoleSlot};
use crate::transport::{Message, Outbox, SendPolicy, Transport};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Stopping,
}

/// 管理器运行参数（来自 [game] / [llm] / [transport]）
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub run_id: Option<String>,
    pub phase_transition_event: String,
    pub phase_key: String,
    pub continuous_phases: BTreeSet<PhaseId>,
    pub delay: DelayBounds,
    pub infer_timeout: Duration,
    pub send_policy: SendPolicy,
    pub reject_backward_phase: bool,
    pub role_assignment_event: Option<String>,
    pub name_assignment_event: Option<String>,
    pub ready_message_type: Option<String>,
}

impl ManagerSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let game = &cfg.game;
        Ok(Self {
            run_id: game.run_id.clone(),
            phase_transition_event: game.phase_transition_event.clone(),
            phase_key: game.phase_key.clone(),
            continuous_phases: game.continuous_phases.iter().copied().collect(),
            delay: DelayBounds::new(game.min_action_delay_secs, game.max_action_delay_secs)?,
            infer_timeout: Duration::from_secs(cfg.llm.timeouts.request),
            send_policy: SendPolicy::from_config(&cfg.transport),
            reject_backward_phase: game.reject_backward_phase,
            role_assignment_event: game.role_assignment_event.clone(),
            name_assignment_event: game.name_assignment_event.clone(),
            ready_message_type: game.ready_message_type.clone(),
        })
    }
}

/// 阶段生命周期回调
pub type PhaseHook = Arc<dyn Fn(PhaseId) + Send + Sync>;

/// 连续阶段中每次触发的动作：取当前角色执行一次
pub(crate) struct ScheduledAction {
    pub(crate) roles: RoleSlot,
    pub(crate) executor: TurnExecutor,
}

#[async_trait]
impl PhaseAction for ScheduledAction {
    async fn run(&self, phase: PhaseId, cancel: CancellationToken) {
        match self.roles.get().await {
            Some(agent) => {
                self.executor.execute(&agent, phase, &cancel).await;
            }
            None => tracing::warn!(phase, "No role assigned, skipping continuous action"),
        }
    }
}

/// 阶段驱动：阶段转换 → 钩子 / 单次动作 / 连续循环
pub(crate) struct PhaseDriver {
    pub(crate) roles: RoleSlot,
    pub(crate) executor: TurnExecutor,
    pub(crate) scheduler: Arc<ContinuousScheduler>,
    pub(crate) continuous: BTreeSet<PhaseId>,
    pub(crate) start_hooks: Vec<PhaseHook>,
    pub(crate) end_hooks: Vec<PhaseHook>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    /// 是否已进入过某个阶段（首次转换前没有可结束的阶段）
    pub(crate) entered: AtomicBool,
}

#[async_trait]
impl TransitionListener for PhaseDriver {
    async fn on_transition(&self, outcome: &ApplyOutcome) {
        let (old_phase, new_phase) = (outcome.old_phase, outcome.new_phase);

        if self.scheduler.active_phase().is_some_and(|p| p != new_phase) {
            self.scheduler.stop();
        }
        if self.entered.swap(true, Ordering::SeqCst) {
            for hook in &self.end_hooks {
                hook(old_phase);
            }
        }
        for hook in &self.start_hooks {
            hook(new_phase);
        }

        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(agent) = self.roles.get().await else {
            tracing::warn!(phase = new_phase, "No role assigned, skipping phase action");
            return;
        };
        if !agent.role().is_eligible(new_phase) {
            tracing::debug!(role = agent.role().name(), phase = new_phase, "Role does not act in this phase");
            return;
        }

        if self.continuous.contains(&new_phase) {
            self.scheduler.start(new_phase);
            self.scheduler.fire(new_phase);
            return;
        }

        let executor = self.executor.clone();
        let cancel = self.shutdown.child_token();
        self.tasks.spawn(async move {
            executor.execute(&agent, new_phase, &cancel).await;
        });
    }
}

/// Agent 管理器
pub struct AgentManager {
    pub(crate) settings: ManagerSettings,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) dispatcher: Mutex<EventDispatcher>,
    pub(crate) state: StateReader,
    pub(crate) roles: RoleSlot,
    pub(crate) catalog: Arc<RoleCatalog>,
    pub(crate) outbox: Outbox,
    pub(crate) driver: Arc<PhaseDriver>,
    pub(crate) connection: watch::Sender<ConnectionState>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) closed: AtomicBool,
}

impl AgentManager {
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn state(&self) -> StateReader {
        self.state.clone()
    }

    pub fn roles(&self) -> RoleSlot {
        self.roles.clone()
    }

    pub fn catalog(&self) -> &RoleCatalog {
        &self.catalog
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// 当前运行中的连续阶段
    pub fn continuous_phase(&self) -> Option<PhaseId> {
        self.driver.scheduler.active_phase()
    }

    fn set_connection(&self, state: ConnectionState) {
        tracing::debug!(?state, "Connection state");
        self.connection.send_replace(state);
    }

    /// 连接并处理入站报文，直到 stop 或连接关闭
    pub async fn start(&self) -> Result<(), AgentError> {
        let dispatcher = self
            .dispatcher
            .try_lock()
            .map_err(|_| AgentError::InvalidLifecycle("manager is already running".to_string()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::InvalidLifecycle("manager has been stopped".to_string()));
        }

        self.set_connection(ConnectionState::Connecting);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Err(e) = self.transport.connect(tx).await {
            tracing::error!(kind = e.kind(), error = %e, "Connect failed");
            self.set_connection(ConnectionState::Disconnected);
            return Err(e);
        }
        self.set_connection(ConnectionState::Connected);

        self.set_connection(ConnectionState::Running);
        let session = uuid::Uuid::new_v4();
        tracing::info!(%session, run_id = ?self.settings.run_id, "Agent manager running");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(text) => self.handle_raw(&dispatcher, &text).await,
                    None => {
                        tracing::info!(%session, "Connection closed");
                        break;
                    }
                },
            }
        }

        drop(dispatcher);
        self.stop().await;
        Ok(())
    }

    async fn handle_raw(&self, dispatcher: &EventDispatcher, text: &str) {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "Dropping malformed message");
                return;
            }
        };
        if !message.belongs_to(self.settings.run_id.as_deref()) {
            tracing::debug!(
                event_type = %message.event_type,
                run_id = ?message.run_id(),
                "Ignoring message for another run"
            );
            return;
        }
        dispatcher.dispatch(&message).await;
    }

    /// 停止：取消连续循环与在途动作，关闭连接（可重复调用）
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_connection(ConnectionState::Stopping);
        self.driver.scheduler.stop();
        self.shutdown.cancel();
        self.transport.close().await;
        self.set_connection(ConnectionState::Disconnected);
        let (prompt_tokens, completion_tokens, total_tokens) = self.driver.executor.token_usage();
        tracing::info!(prompt_tokens, completion_tokens, total_tokens, "Agent manager stopped");
    }

    /// 等待所有已触发的阶段动作结束
    pub async fn settle(&self) {
        self.driver.tasks.close();
        self.driver.tasks.wait().await;
        self.driver.tasks.reopen();
        self.driver.scheduler.settle().await;
    }
}
