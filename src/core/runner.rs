//! 游戏运行器：同一局游戏中并发运行多个 Agent
//!
//! 每个 `[[agents]]` 条目（一个恢复码）对应一个独立的 AgentManager：各自的连接、状态与角色，
//! 连接后以 `{"gameId", "type": "join", "recovery"}` 登录。所有 Agent 并发运行，
//! 日志带 `agent_id` span 字段；全部结束后记录游戏结束。
//! 未配置 `[[agents]]` 时只运行一个 Agent（登录报文取 `[server] login_payload`）。

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::builder::AgentManagerBuilder;
use crate::core::manager::AgentManager;
use crate::core::AgentError;
use crate::prompts::TemplateSource;
use crate::transport::{join_payload, WebSocketTransport};

/// 多 Agent 运行器
pub struct GameRunner {
    game_id: Option<String>,
    agents: Vec<(u32, Arc<AgentManager>)>,
}

impl GameRunner {
    pub fn new(game_id: Option<String>) -> Self {
        Self {
            game_id,
            agents: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent_id: u32, manager: AgentManager) -> Self {
        self.agents.push((agent_id, Arc::new(manager)));
        self
    }

    /// 按配置为每个恢复码构建一个 Agent；各 Agent 的关闭令牌都是 `shutdown` 的子令牌，
    /// 单个 Agent 停止不影响其余 Agent
    pub fn from_config(
        cfg: &AppConfig,
        templates: Arc<dyn TemplateSource>,
        shutdown: &CancellationToken,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        let runner = Self::new(cfg.game.run_id.clone());

        if cfg.agents.is_empty() {
            let manager = AgentManagerBuilder::from_config(cfg, templates)?
                .with_shutdown_token(shutdown.child_token())
                .build()?;
            return Ok(runner.with_agent(1, manager));
        }

        let game_id = cfg.game.run_id.as_deref().ok_or_else(|| {
            AgentError::ConfigError("[[agents]] requires game.run_id".to_string())
        })?;
        let mut runner = runner;
        for (agent_id, entry) in (1u32..).zip(&cfg.agents) {
            let login = join_payload(game_id, &entry.recovery);
            let mut builder = AgentManagerBuilder::from_config(cfg, Arc::clone(&templates))?
                .with_transport(Arc::new(WebSocketTransport::new(&cfg.server.url, Some(login))))
                .with_shutdown_token(shutdown.child_token());
            if let Some(role) = entry.role {
                builder = builder.with_initial_role(role);
            }
            runner = runner.with_agent(agent_id, builder.build()?);
        }
        Ok(runner)
    }

    pub fn agents(&self) -> &[(u32, Arc<AgentManager>)] {
        &self.agents
    }

    /// 并发运行所有 Agent，直到全部结束；返回第一个出错 Agent 的错误
    pub async fn run(&self) -> Result<(), AgentError> {
        tracing::info!(game_id = ?self.game_id, agents = self.agents.len(), "Starting agents");

        let runs = self.agents.iter().map(|(agent_id, manager)| {
            let manager = Arc::clone(manager);
            async move {
                let result = manager.start().await;
                if let Err(e) = &result {
                    tracing::error!(kind = e.kind(), error = %e, "Agent stopped with error");
                }
                result
            }
            .instrument(tracing::info_span!("agent", agent_id = *agent_id))
        });
        let results = join_all(runs).await;

        tracing::info!(game_id = ?self.game_id, "Game finished");
        results.into_iter().collect()
    }

    pub async fn stop(&self) {
        for (_, manager) in &self.agents {
            manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentEntry;
    use crate::prompts::TemplateStore;

    fn cfg_with_agents(agents: &[(&str, Option<u32>)]) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.game.run_id = Some("1207".to_string());
        cfg.llm.provider = "mock".to_string();
        cfg.agents = agents
            .iter()
            .map(|(recovery, role)| AgentEntry {
                recovery: recovery.to_string(),
                role: *role,
            })
            .collect();
        cfg
    }

    #[test]
    fn test_one_agent_per_recovery_code() {
        let cfg = cfg_with_agents(&[("a1b2", None), ("c3d4", None), ("e5f6", None)]);
        let runner = GameRunner::from_config(&cfg, Arc::new(TemplateStore::new()), &CancellationToken::new())
            .unwrap_or_else(|e| panic!("runner failed: {e}"));
        let ids: Vec<u32> = runner.agents().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_without_agents_runs_single_agent() {
        let cfg = cfg_with_agents(&[]);
        let runner = GameRunner::from_config(&cfg, Arc::new(TemplateStore::new()), &CancellationToken::new())
            .unwrap_or_else(|e| panic!("runner failed: {e}"));
        assert_eq!(runner.agents().len(), 1);
    }

    #[test]
    fn test_unknown_agent_role_rejected() {
        let cfg = cfg_with_agents(&[("a1b2", Some(9))]);
        let result = GameRunner::from_config(&cfg, Arc::new(TemplateStore::new()), &CancellationToken::new());
        match result {
            Err(e) => assert_eq!(e.kind(), "config_error"),
            Ok(_) => panic!("Expected unknown role to fail"),
        }
    }
}
