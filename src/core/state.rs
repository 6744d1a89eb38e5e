//! 阶段状态：当前阶段号 + 游戏状态文档（meta / private / public）
//!
//! 单写多读：`phase_state` 返回唯一的 `StateWriter`（仅由事件分发器持有）与可克隆的 `StateReader`。
//! 底层为 `tokio::sync::watch`，写入以整份快照替换，读者永远看到完整提交后的状态。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::core::AgentError;

/// 阶段号
pub type PhaseId = u32;

/// 状态文档分区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Meta,
    #[default]
    Private,
    Public,
}

/// 元信息：阶段、角色、玩家身份；其余键落在 extra
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetaInformation {
    pub phase: PhaseId,
    pub run_id: Option<String>,
    pub role: Option<u32>,
    pub player_name: Option<String>,
    pub player_number: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetaInformation {
    /// 按键写入；已知键写入强类型字段，类型不符时退回 extra
    pub fn set(&mut self, key: &str, value: Value) {
        match key {
            "phase" => {
                if let Some(p) = value.as_u64().and_then(|p| PhaseId::try_from(p).ok()) {
                    self.phase = p;
                    return;
                }
            }
            "run_id" => {
                self.run_id = value_to_id(&value);
                return;
            }
            "role" => {
                if let Some(r) = value.as_u64().and_then(|r| u32::try_from(r).ok()) {
                    self.role = Some(r);
                    return;
                }
            }
            "player_name" => {
                if let Some(name) = value.as_str() {
                    self.player_name = Some(name.to_string());
                    return;
                }
            }
            "player_number" => {
                if let Some(n) = value.as_i64() {
                    self.player_number = Some(n);
                    return;
                }
            }
            _ => {}
        }
        self.extra.insert(key.to_string(), value);
    }
}

/// 游戏 / 运行状态文档
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GameState {
    pub meta: MetaInformation,
    pub private_information: Map<String, Value>,
    pub public_information: Map<String, Value>,
}

impl GameState {
    pub fn for_run(run_id: &str) -> Self {
        let mut state = Self::default();
        state.meta.run_id = Some(run_id.to_string());
        state
    }

    pub fn phase(&self) -> PhaseId {
        self.meta.phase
    }

    pub fn set(&mut self, section: Section, key: &str, value: Value) {
        match section {
            Section::Meta => self.meta.set(key, value),
            Section::Private => {
                self.private_information.insert(key.to_string(), value);
            }
            Section::Public => {
                self.public_information.insert(key.to_string(), value);
            }
        }
    }

    pub fn get(&self, section: Section, key: &str) -> Option<Value> {
        match section {
            Section::Meta => serde_json::to_value(&self.meta)
                .ok()
                .and_then(|v| v.get(key).cloned())
                .filter(|v| !v.is_null()),
            Section::Private => self.private_information.get(key).cloned(),
            Section::Public => self.public_information.get(key).cloned(),
        }
    }
}

/// 运行 id 可能是数字（gameId）或字符串，统一为字符串比较
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 一次局部更新：可选的新阶段号 + 各分区补丁
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub phase: Option<PhaseId>,
    pub patches: Vec<(Section, String, Value)>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(phase: PhaseId) -> Self {
        Self {
            phase: Some(phase),
            patches: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: PhaseId) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn set(mut self, section: Section, key: &str, value: Value) -> Self {
        self.push(section, key, value);
        self
    }

    /// meta.phase 视同阶段更新，其余进入补丁
    pub fn push(&mut self, section: Section, key: &str, value: Value) {
        if section == Section::Meta && key == "phase" {
            if let Some(p) = value.as_u64().and_then(|p| PhaseId::try_from(p).ok()) {
                self.phase = Some(p);
                return;
            }
        }
        self.patches.push((section, key.to_string(), value));
    }

    pub fn is_empty(&self) -> bool {
        self.phase.is_none() && self.patches.is_empty()
    }
}

/// 事件字段到状态字段的映射，可限定生效阶段（phases 与 exclude_phases 互斥）
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyMapping {
    pub event_key: String,
    pub state_key: String,
    #[serde(default)]
    pub section: Section,
    #[serde(default)]
    pub phases: Option<Vec<PhaseId>>,
    #[serde(default)]
    pub exclude_phases: Option<Vec<PhaseId>>,
}

impl PropertyMapping {
    pub fn new(event_key: &str, state_key: &str, section: Section) -> Self {
        Self {
            event_key: event_key.to_string(),
            state_key: state_key.to_string(),
            section,
            phases: None,
            exclude_phases: None,
        }
    }

    pub fn only_in(mut self, phases: Vec<PhaseId>) -> Self {
        self.phases = Some(phases);
        self
    }

    pub fn except_in(mut self, phases: Vec<PhaseId>) -> Self {
        self.exclude_phases = Some(phases);
        self
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.phases.is_some() && self.exclude_phases.is_some() {
            return Err(AgentError::ConfigError(format!(
                "Cannot specify both phases and exclude_phases for mapping '{}'",
                self.event_key
            )));
        }
        Ok(())
    }

    pub fn applies_in(&self, phase: PhaseId) -> bool {
        if let Some(phases) = &self.phases {
            return phases.contains(&phase);
        }
        if let Some(excluded) = &self.exclude_phases {
            return !excluded.contains(&phase);
        }
        true
    }
}

/// 按事件类型的自定义状态更新（替代该事件的映射更新）
pub type StateHandler = Arc<dyn Fn(&mut GameState, &Value) + Send + Sync>;

/// 自定义状态处理表
pub type StateHandlers = HashMap<String, StateHandler>;

/// apply 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub old_phase: PhaseId,
    pub new_phase: PhaseId,
    pub transitioned: bool,
}

/// 状态读端：非阻塞读取最新提交的快照
#[derive(Clone, Debug)]
pub struct StateReader {
    rx: watch::Receiver<Arc<GameState>>,
}

impl StateReader {
    /// (当前阶段, 完整快照)
    pub fn current(&self) -> (PhaseId, Arc<GameState>) {
        let snapshot = self.rx.borrow().clone();
        (snapshot.meta.phase, snapshot)
    }

    pub fn phase(&self) -> PhaseId {
        self.rx.borrow().meta.phase
    }

    pub fn snapshot(&self) -> Arc<GameState> {
        self.rx.borrow().clone()
    }

    /// 等待下一次提交
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// 状态写端：唯一写者，不可克隆
#[derive(Debug)]
pub struct StateWriter {
    tx: watch::Sender<Arc<GameState>>,
    reject_backward: bool,
}

/// 创建状态对（写端 + 读端）
pub fn phase_state(initial: GameState, reject_backward: bool) -> (StateWriter, StateReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (
        StateWriter {
            tx,
            reject_backward,
        },
        StateReader { rx },
    )
}

impl StateWriter {
    pub fn reader(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> (PhaseId, Arc<GameState>) {
        let snapshot = self.tx.borrow().clone();
        (snapshot.meta.phase, snapshot)
    }

    /// 合并局部更新；返回前新快照已对所有读者可见
    pub fn apply(&self, delta: StateDelta) -> ApplyOutcome {
        self.commit(|state| {
            for (section, key, value) in delta.patches {
                state.set(section, &key, value);
            }
            delta.phase
        })
    }

    /// 以闭包修改状态（自定义状态处理器），阶段号变化同样参与转换检测
    pub fn apply_with(&self, f: impl FnOnce(&mut GameState)) -> ApplyOutcome {
        self.commit(|state| {
            let before = state.meta.phase;
            f(state);
            let requested = state.meta.phase;
            state.meta.phase = before;
            (requested != before).then_some(requested)
        })
    }

    fn commit(&self, f: impl FnOnce(&mut GameState) -> Option<PhaseId>) -> ApplyOutcome {
        let current = self.tx.borrow().clone();
        let old_phase = current.meta.phase;
        let mut next = (*current).clone();

        let requested = f(&mut next);
        let mut new_phase = old_phase;
        if let Some(phase) = requested {
            if phase < old_phase {
                let conflict = AgentError::StateConflict {
                    from: old_phase,
                    to: phase,
                };
                if self.reject_backward {
                    tracing::warn!(kind = conflict.kind(), error = %conflict, "Rejected backward phase update");
                } else {
                    tracing::warn!(kind = conflict.kind(), error = %conflict, "Backward phase update, applying anyway");
                    new_phase = phase;
                }
            } else {
                new_phase = phase;
            }
        }
        next.meta.phase = new_phase;

        self.tx.send_replace(Arc::new(next));
        ApplyOutcome {
            old_phase,
            new_phase,
            transitioned: new_phase != old_phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_is_visible_to_readers() {
        let (writer, reader) = phase_state(GameState::default(), false);
        let other = reader.clone();

        let outcome = writer.apply(
            StateDelta::phase(2).set(Section::Public, "tax_rate", json!(0.1)),
        );

        assert!(outcome.transitioned);
        assert_eq!(outcome.old_phase, 0);
        assert_eq!(outcome.new_phase, 2);
        let (phase, state) = other.current();
        assert_eq!(phase, 2);
        assert_eq!(state.public_information.get("tax_rate"), Some(&json!(0.1)));
        assert_eq!(reader.phase(), 2);
    }

    #[test]
    fn test_same_phase_twice_does_not_transition() {
        let (writer, _reader) = phase_state(GameState::default(), false);
        assert!(writer.apply(StateDelta::phase(3)).transitioned);
        let second = writer.apply(StateDelta::phase(3));
        assert!(!second.transitioned);
        assert_eq!(second.new_phase, 3);
    }

    #[test]
    fn test_backward_phase_last_write_wins() {
        let (writer, reader) = phase_state(GameState::default(), false);
        writer.apply(StateDelta::phase(5));
        let outcome = writer.apply(StateDelta::phase(2));
        assert!(outcome.transitioned);
        assert_eq!(reader.phase(), 2);
    }

    #[test]
    fn test_backward_phase_rejected_keeps_patches() {
        let (writer, reader) = phase_state(GameState::default(), true);
        writer.apply(StateDelta::phase(5));
        let outcome = writer.apply(
            StateDelta::phase(2).set(Section::Private, "wallet", json!(100)),
        );
        assert!(!outcome.transitioned);
        let (phase, state) = reader.current();
        assert_eq!(phase, 5);
        assert_eq!(state.private_information.get("wallet"), Some(&json!(100)));
    }

    #[test]
    fn test_meta_phase_key_is_phase_update() {
        let delta = StateDelta::new().set(Section::Meta, "phase", json!(4));
        assert_eq!(delta.phase, Some(4));
        assert!(delta.patches.is_empty());
    }

    #[test]
    fn test_out_of_range_phase_is_not_truncated() {
        let delta = StateDelta::new().set(Section::Meta, "phase", json!(4_294_967_298u64));
        assert_eq!(delta.phase, None);

        let mut meta = MetaInformation::default();
        meta.set("phase", json!(4_294_967_298u64));
        meta.set("role", json!(4_294_967_299u64));
        assert_eq!(meta.phase, 0);
        assert_eq!(meta.role, None);
    }

    #[test]
    fn test_meta_set_typed_and_extra() {
        let mut meta = MetaInformation::default();
        meta.set("player_name", json!("Alice"));
        meta.set("role", json!(2));
        meta.set("round", json!(7));
        assert_eq!(meta.player_name.as_deref(), Some("Alice"));
        assert_eq!(meta.role, Some(2));
        assert_eq!(meta.extra.get("round"), Some(&json!(7)));
    }

    #[test]
    fn test_apply_with_detects_transition() {
        let (writer, reader) = phase_state(GameState::default(), false);
        let outcome = writer.apply_with(|state| {
            state.meta.phase = 6;
            state.meta.player_number = Some(3);
        });
        assert!(outcome.transitioned);
        assert_eq!(reader.snapshot().meta.player_number, Some(3));
    }

    #[test]
    fn test_mapping_phase_filters() {
        let only = PropertyMapping::new("signal", "signal", Section::Private).only_in(vec![2, 3]);
        assert!(only.applies_in(2));
        assert!(!only.applies_in(4));

        let except = PropertyMapping::new("signal", "signal", Section::Private).except_in(vec![4]);
        assert!(except.applies_in(2));
        assert!(!except.applies_in(4));

        let both = PropertyMapping::new("x", "x", Section::Public)
            .only_in(vec![1])
            .except_in(vec![2]);
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_get_meta_field() {
        let mut state = GameState::for_run("42");
        state.set(Section::Meta, "player_number", json!(7));
        assert_eq!(state.get(Section::Meta, "player_number"), Some(json!(7)));
        assert_eq!(state.get(Section::Meta, "run_id"), Some(json!("42")));
        assert_eq!(state.get(Section::Meta, "player_name"), None);
    }
}
