//! Hive - 按阶段编排的实验 Agent
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段状态、事件分发、阶段动作执行、连续调度、管理器生命周期
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **prompts**: Prompt 模板存储与渲染
//! - **role**: 角色、能力注册表与解析级联
//! - **transport**: 报文格式、传输抽象（WebSocket / 内存）与出站信箱

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod prompts;
pub mod role;
pub mod transport;

pub use crate::core::{AgentManager, AgentManagerBuilder};
