//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__GAME__RUN_ID=42`）。

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::core::state::{PhaseId, PropertyMapping};
use crate::core::AgentError;
use crate::role::{PhaseSelection, Role};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub game: GameSection,
    pub agent: AgentSection,
    /// 同一局中并发运行的多个 Agent（每个对应一个恢复码）
    pub agents: Vec<AgentEntry>,
    pub roles: Vec<RoleConfig>,
    pub mappings: Vec<PropertyMapping>,
    pub llm: LlmSection,
    pub prompts: PromptsSection,
    pub transport: TransportSection,
}

/// [server] 段：实验服务器地址与登录报文
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub url: String,
    /// 连接建立后立即发送的 JSON 对象（如 join 报文）
    pub login_payload: Option<Value>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765/wss".to_string(),
            login_payload: None,
        }
    }
}

/// [game] 段：运行 id、阶段事件、连续阶段与内置事件名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameSection {
    /// 运行 / 游戏 id，用于入站过滤与出站标记
    pub run_id: Option<String>,
    pub phase_transition_event: String,
    /// 阶段号所在的 data 字段
    pub phase_key: String,
    pub continuous_phases: Vec<PhaseId>,
    pub min_action_delay_secs: f64,
    pub max_action_delay_secs: f64,
    /// 阶段号回退时拒绝（默认记录警告并接受）
    pub reject_backward_phase: bool,
    pub role_assignment_event: Option<String>,
    pub name_assignment_event: Option<String>,
    /// 收到名字后回复的就绪报文类型
    pub ready_message_type: Option<String>,
}

impl Default for GameSection {
    fn default() -> Self {
        Self {
            run_id: None,
            phase_transition_event: "phase-transition".to_string(),
            phase_key: "phase".to_string(),
            continuous_phases: Vec::new(),
            min_action_delay_secs: 10.0,
            max_action_delay_secs: 20.0,
            reject_backward_phase: false,
            role_assignment_event: None,
            name_assignment_event: None,
            ready_message_type: None,
        }
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentSection {
    /// 启动时持有的角色 id；不设置时等待 assign-role 事件
    pub role: Option<u32>,
}

/// [[agents]] 条目：以 `{"gameId", "type": "join", "recovery"}` 登录的一个 Agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub recovery: String,
    /// 覆盖 [agent] role
    #[serde(default)]
    pub role: Option<u32>,
}

/// [[roles]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub task_phases: Option<Vec<PhaseId>>,
    #[serde(default)]
    pub task_phases_excluded: Option<Vec<PhaseId>>,
}

impl RoleConfig {
    pub fn to_role(&self) -> Result<Role, AgentError> {
        let phases =
            PhaseSelection::from_lists(self.task_phases.clone(), self.task_phases_excluded.clone())?;
        Ok(Role::new(self.id, &self.name, phases))
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    /// 单次回复的最大 token 数
    pub max_tokens: Option<u32>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次推理超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [prompts] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptsSection {
    /// 模板目录，未设置时查找 config/prompts
    pub dir: Option<PathBuf>,
}

/// [transport] 段：发送重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub send_retries: u32,
    pub send_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            send_retries: 3,
            send_timeout_ms: 5_000,
            retry_backoff_ms: 500,
        }
    }
}

impl AppConfig {
    /// 校验跨字段约束（角色阶段集合、映射阶段集合、延迟区间）
    pub fn validate(&self) -> Result<(), AgentError> {
        for role in &self.roles {
            role.to_role()?;
        }
        for mapping in &self.mappings {
            mapping.validate()?;
        }
        if !self.agents.is_empty() && self.game.run_id.is_none() {
            return Err(AgentError::ConfigError(
                "[[agents]] requires game.run_id (the game id sent in each join message)".to_string(),
            ));
        }
        if self.agents.iter().any(|a| a.recovery.trim().is_empty()) {
            return Err(AgentError::ConfigError("[[agents]] entry with an empty recovery code".to_string()));
        }
        let (min, max) = (self.game.min_action_delay_secs, self.game.max_action_delay_secs);
        if !(min >= 0.0 && min <= max) {
            return Err(AgentError::ConfigError(format!(
                "Invalid action delay bounds: min={min} max={max}"
            )));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.game.phase_transition_event, "phase-transition");
        assert_eq!(cfg.game.phase_key, "phase");
        assert_eq!(cfg.transport.send_retries, 3);
        assert_eq!(cfg.llm.timeouts.request, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[game]
run_id = "1207"
continuous_phases = [6, 7]
min_action_delay_secs = 5
max_action_delay_secs = 8

[agent]
role = 1

[[agents]]
recovery = "a1b2"

[[agents]]
recovery = "c3d4"
role = 2

[[roles]]
id = 1
name = "Speculator"
task_phases = [2, 6]

[[roles]]
id = 2
name = "Owner"
task_phases_excluded = [3]

[[mappings]]
event_key = "winning_condition"
state_key = "winning_condition"
section = "public"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.game.run_id.as_deref(), Some("1207"));
        assert_eq!(cfg.game.continuous_phases, vec![6, 7]);
        assert_eq!(cfg.agent.role, Some(1));
        assert_eq!(cfg.roles.len(), 2);
        assert!(cfg.roles[0].to_role().unwrap().is_eligible(6));
        assert!(!cfg.roles[1].to_role().unwrap().is_eligible(3));
        assert_eq!(cfg.mappings.len(), 1);
        assert_eq!(cfg.agents.len(), 2);
        assert_eq!(cfg.agents[0].recovery, "a1b2");
        assert_eq!(cfg.agents[0].role, None);
        assert_eq!(cfg.agents[1].role, Some(2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_both_phase_lists_fail_validation() {
        let mut cfg = AppConfig::default();
        cfg.roles.push(RoleConfig {
            id: 3,
            name: "Developer".to_string(),
            task_phases: Some(vec![1]),
            task_phases_excluded: Some(vec![2]),
        });
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_agents_require_run_id() {
        let mut cfg = AppConfig::default();
        cfg.agents.push(AgentEntry {
            recovery: "a1b2".to_string(),
            role: None,
        });
        assert_eq!(cfg.validate().unwrap_err().kind(), "config_error");

        cfg.game.run_id = Some("1207".to_string());
        assert!(cfg.validate().is_ok());

        cfg.agents[0].recovery = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_delay_bounds_rejected() {
        let mut cfg = AppConfig::default();
        cfg.game.min_action_delay_secs = 30.0;
        assert!(cfg.validate().is_err());
    }
}
