//! 报文格式
//!
//! 入站：`{"message_type": <run id>, "type": <event type>, "data": {...}}`（`msg_type` 为别名）。
//! 出站：载荷对象附加 `message_type` = run id。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::state::value_to_id;
use crate::core::AgentError;

/// 入站事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, alias = "msg_type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<Value>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            message_type: None,
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn with_run_id(mut self, run_id: Value) -> Self {
        self.message_type = Some(run_id);
        self
    }

    /// 解析原始文本；非 JSON 或缺少 `type` 视为 MalformedMessage
    pub fn parse(text: &str) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| AgentError::MalformedMessage(format!("invalid JSON: {e}")))?;
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(AgentError::MalformedMessage(
                "missing string field 'type'".to_string(),
            ));
        }
        let mut message: Message = serde_json::from_value(value)
            .map_err(|e| AgentError::MalformedMessage(e.to_string()))?;
        if message.data.is_null() {
            message.data = Value::Object(Map::new());
        }
        Ok(message)
    }

    pub fn run_id(&self) -> Option<String> {
        self.message_type.as_ref().and_then(value_to_id)
    }

    /// 未携带 run id 的报文视为本运行的报文
    pub fn belongs_to(&self, run_id: Option<&str>) -> bool {
        match (self.run_id(), run_id) {
            (Some(theirs), Some(ours)) => theirs == ours,
            _ => true,
        }
    }
}

/// run id 的线上形式：数字形式的 id 以数字发送
pub fn run_id_value(run_id: &str) -> Value {
    match run_id.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(run_id),
    }
}

/// 为出站载荷对象附加 run id（非对象由 Outbox 拒绝）
pub fn tag_outbound(mut payload: Value, run_id: Option<&str>) -> Value {
    let Some(run_id) = run_id else {
        return payload;
    };
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("message_type".to_string(), run_id_value(run_id));
    }
    payload
}

/// 多 Agent 运行时每个 Agent 的登录报文
pub fn join_payload(game_id: &str, recovery: &str) -> Value {
    serde_json::json!({
        "gameId": run_id_value(game_id),
        "type": "join",
        "recovery": recovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_with_alias() {
        let msg = Message::parse(r#"{"msg_type": 7, "type": "phase-transition", "data": {"phase": 2}}"#).unwrap();
        assert_eq!(msg.event_type, "phase-transition");
        assert_eq!(msg.run_id().as_deref(), Some("7"));
        assert_eq!(msg.data["phase"], 2);
    }

    #[test]
    fn test_parse_rejects_missing_type() {
        let err = Message::parse(r#"{"message_type": 7, "data": {}}"#).unwrap_err();
        assert_eq!(err.kind(), "malformed_message");
        let err = Message::parse("not json at all").unwrap_err();
        assert_eq!(err.kind(), "malformed_message");
    }

    #[test]
    fn test_missing_data_is_empty_object() {
        let msg = Message::parse(r#"{"type": "game-over"}"#).unwrap();
        assert_eq!(msg.data, json!({}));
        assert!(msg.belongs_to(Some("7")));
    }

    #[test]
    fn test_foreign_run_id() {
        let msg = Message::new("phase-transition", json!({})).with_run_id(json!("8"));
        assert!(!msg.belongs_to(Some("7")));
        assert!(msg.belongs_to(Some("8")));
        assert!(msg.belongs_to(None));
    }

    #[test]
    fn test_tag_outbound() {
        let tagged = tag_outbound(json!({"type": "bid", "value": 3}), Some("1207"));
        assert_eq!(tagged["message_type"], json!(1207));

        let tagged = tag_outbound(json!({"type": "bid"}), Some("run-a"));
        assert_eq!(tagged["message_type"], json!("run-a"));

        let untouched = tag_outbound(json!({"type": "bid"}), None);
        assert!(untouched.get("message_type").is_none());
    }

    #[test]
    fn test_join_payload() {
        assert_eq!(
            join_payload("1207", "a1b2"),
            json!({"gameId": 1207, "type": "join", "recovery": "a1b2"})
        );
        assert_eq!(join_payload("pilot", "x")["gameId"], json!("pilot"));
    }
}
