//! 阶段动作执行
//!
//! 一次动作：资格检查 → 自定义阶段处理器，或默认流程（系统提示词 + 用户提示词 → 推理 → 解析）
//! → 附加 run id 发送。动作使用触发时的阶段号与状态快照；取消后不再发送。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::state::{GameState, PhaseId, StateReader};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::role::{AgentRole, Aspect, CapabilityResolver};
use crate::transport::Outbox;

/// 单次动作的结果
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// 已发送（附带实际发出的载荷）
    Sent(Value),
    /// 处理器 / 解析器没有产出可发送的内容
    Nothing,
    /// 角色在该阶段不行动
    Ineligible,
    /// 发送前已取消
    Cancelled,
    Failed(AgentError),
}

impl ActionOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, ActionOutcome::Sent(_))
    }
}

/// None、null 与空对象都表示不发送
fn sendable(payload: Option<Value>) -> Option<Value> {
    match payload {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        other => other,
    }
}

/// 阶段动作执行器
#[derive(Clone)]
pub struct TurnExecutor {
    outbox: Outbox,
    llm: Arc<dyn LlmClient>,
    state: StateReader,
    infer_timeout: Duration,
}

impl TurnExecutor {
    pub fn new(
        outbox: Outbox,
        llm: Arc<dyn LlmClient>,
        state: StateReader,
        infer_timeout: Duration,
    ) -> Self {
        Self {
            outbox,
            llm,
            state,
            infer_timeout,
        }
    }

    /// 推理后端的累计 token 用量 (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 执行一次动作；失败只记录日志，不向上传播
    pub async fn execute(
        &self,
        agent: &AgentRole,
        phase: PhaseId,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let role = agent.role().name();
        match self.run_action(agent, phase, cancel).await {
            Ok(outcome) => {
                match &outcome {
                    ActionOutcome::Sent(payload) => {
                        tracing::info!(role, phase, payload = %payload, "Phase action sent")
                    }
                    ActionOutcome::Nothing => {
                        tracing::debug!(role, phase, "Phase action produced nothing to send")
                    }
                    ActionOutcome::Ineligible => {
                        tracing::debug!(role, phase, "Role does not act in this phase")
                    }
                    ActionOutcome::Cancelled => {
                        tracing::debug!(role, phase, "Phase action cancelled before send")
                    }
                    ActionOutcome::Failed(_) => {}
                }
                outcome
            }
            Err(e) => {
                tracing::error!(
                    role,
                    phase,
                    aspect = ?e.aspect(),
                    kind = e.kind(),
                    error = %e,
                    "Phase action failed"
                );
                ActionOutcome::Failed(e)
            }
        }
    }

    pub async fn run_action(
        &self,
        agent: &AgentRole,
        phase: PhaseId,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, AgentError> {
        if !agent.role().is_eligible(phase) {
            return Ok(ActionOutcome::Ineligible);
        }

        let state = self.state.snapshot();
        let resolver = agent.resolver();
        let payload = match resolver.phase_handler(phase)? {
            Some(handler) => handler.handle(phase, Arc::clone(&state)).await?,
            None => self.default_pipeline(resolver, phase, &state).await?,
        };

        let Some(payload) = sendable(payload) else {
            return Ok(ActionOutcome::Nothing);
        };
        if cancel.is_cancelled() {
            return Ok(ActionOutcome::Cancelled);
        }

        let sent = self.outbox.send(payload).await?;
        Ok(ActionOutcome::Sent(sent))
    }

    async fn default_pipeline(
        &self,
        resolver: &CapabilityResolver,
        phase: PhaseId,
        state: &GameState,
    ) -> Result<Option<Value>, AgentError> {
        let system_prompt = resolver.render_prompt(phase, Aspect::SystemPrompt, state)?;
        let user_prompt = resolver.render_prompt(phase, Aspect::UserPrompt, state)?;

        let response = tokio::time::timeout(
            self.infer_timeout,
            self.llm.infer(&system_prompt, &user_prompt),
        )
        .await
        .map_err(|_| {
            AgentError::Timeout(format!("inference exceeded {}s", self.infer_timeout.as_secs()))
        })??;

        resolver.parse_response(phase, &response, state)
    }
}
