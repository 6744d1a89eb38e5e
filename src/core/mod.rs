//! 核心编排层：错误、阶段状态、事件分发、阶段动作、连续调度、管理器、多 Agent 运行与关闭

pub mod builder;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod manager;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod state;

pub use builder::AgentManagerBuilder;
pub use dispatcher::{hook_fn, DispatchOutcome, EventContext, EventDispatcher, EventHook, HookStage};
pub use error::AgentError;
pub use executor::{ActionOutcome, TurnExecutor};
pub use manager::{AgentManager, ConnectionState, ManagerSettings, PhaseHook};
pub use runner::GameRunner;
pub use scheduler::{ContinuousScheduler, DelayBounds, PhaseAction};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{GameState, PhaseId, PropertyMapping, StateDelta, StateReader};
