//! 连续阶段调度
//!
//! 连续阶段内按 uniform[min, max] 秒的随机间隔反复触发阶段动作，直到阶段改变或关闭：
//! - 任意时刻最多一个循环（`start` 先停止旧循环）
//! - 动作互不重叠：Semaphore(1) 许可被占用时跳过本次触发
//! - `stop` 同步生效：取消令牌并中止循环任务，等待中的循环不会再触发

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::state::{PhaseId, StateReader};
use crate::core::AgentError;

/// 触发间隔区间（秒）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayBounds {
    min: f64,
    max: f64,
}

impl DelayBounds {
    pub fn new(min_secs: f64, max_secs: f64) -> Result<Self, AgentError> {
        if !(min_secs >= 0.0 && min_secs <= max_secs) {
            return Err(AgentError::ConfigError(format!(
                "Invalid action delay bounds: min={min_secs} max={max_secs}"
            )));
        }
        Ok(Self {
            min: min_secs,
            max: max_secs,
        })
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return Duration::from_secs_f64(self.min);
        }
        let secs = rand::thread_rng().gen_range(self.min..=self.max);
        Duration::from_secs_f64(secs)
    }
}

/// 被调度的阶段动作
#[async_trait]
pub trait PhaseAction: Send + Sync {
    async fn run(&self, phase: PhaseId, cancel: CancellationToken);
}

struct ActiveLoop {
    phase: PhaseId,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 连续阶段调度器
pub struct ContinuousScheduler {
    bounds: DelayBounds,
    state: StateReader,
    action: Arc<dyn PhaseAction>,
    in_flight: Arc<Semaphore>,
    active: Mutex<Option<ActiveLoop>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ContinuousScheduler {
    pub fn new(
        bounds: DelayBounds,
        state: StateReader,
        action: Arc<dyn PhaseAction>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bounds,
            state,
            action,
            in_flight: Arc::new(Semaphore::new(1)),
            active: Mutex::new(None),
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveLoop>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 为 phase 启动循环（已有循环先停止）
    pub fn start(&self, phase: PhaseId) {
        self.stop();
        if self.shutdown.is_cancelled() {
            return;
        }

        let token = self.shutdown.child_token();
        let handle = tokio::spawn(run_loop(
            phase,
            self.bounds,
            self.state.clone(),
            Arc::clone(&self.action),
            Arc::clone(&self.in_flight),
            token.clone(),
            self.tasks.clone(),
        ));
        tracing::info!(phase, "Continuous loop started");
        *self.lock_active() = Some(ActiveLoop {
            phase,
            token,
            handle,
        });
    }

    /// 停止当前循环；返回后不会再有新的触发
    pub fn stop(&self) {
        if let Some(active) = self.lock_active().take() {
            active.token.cancel();
            active.handle.abort();
            tracing::info!(phase = active.phase, "Continuous loop stopped");
        }
    }

    pub fn active_phase(&self) -> Option<PhaseId> {
        self.lock_active().as_ref().map(|a| a.phase)
    }

    /// 立即触发一次（经过同一互斥许可）；动作已在进行时返回 false
    pub fn fire(&self, phase: PhaseId) -> bool {
        let token = match self.lock_active().as_ref() {
            Some(active) if active.phase == phase => active.token.clone(),
            _ => return false,
        };
        spawn_action(
            phase,
            &self.action,
            &self.in_flight,
            token,
            &self.tasks,
        )
    }

    /// 是否有动作正在执行
    pub fn is_busy(&self) -> bool {
        self.in_flight.available_permits() == 0
    }

    /// 等待所有已启动的动作结束（测试与关闭时使用）
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

impl Drop for ContinuousScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_action(
    phase: PhaseId,
    action: &Arc<dyn PhaseAction>,
    in_flight: &Arc<Semaphore>,
    token: CancellationToken,
    tasks: &TaskTracker,
) -> bool {
    let Ok(permit) = Arc::clone(in_flight).try_acquire_owned() else {
        tracing::debug!(phase, "Action still in flight, skipping tick");
        return false;
    };
    let action = Arc::clone(action);
    tasks.spawn(async move {
        action.run(phase, token).await;
        drop(permit);
    });
    true
}

async fn run_loop(
    phase: PhaseId,
    bounds: DelayBounds,
    state: StateReader,
    action: Arc<dyn PhaseAction>,
    in_flight: Arc<Semaphore>,
    token: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let delay = bounds.sample();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let current = state.phase();
        if current != phase {
            tracing::debug!(phase, current, "Phase changed, leaving continuous loop");
            break;
        }
        spawn_action(phase, &action, &in_flight, token.clone(), &tasks);
    }
}
