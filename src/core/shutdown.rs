//! 优雅关闭处理
//!
//! 运行时持有唯一的 `ShutdownManager`：调度循环、协议服务以及每次技能运行（包括经 `skill_run`
//! 发起的运行）都从它派生 token。收到 Ctrl+C / SIGTERM 或客户端断开后停止接收新任务，
//! 运行中的技能在下一个步骤边界结束（aborted），最后执行清理任务（如保存调度状态）。

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// stdin 关闭
    ClientDisconnected,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
            ShutdownReason::ClientDisconnected => "client disconnected",
        };
        f.write_str(s)
    }
}

/// 关闭信号管理器；只记录第一次关闭的原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭 token（调度循环、协议服务监听）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 单次技能运行的 token：关闭时随之取消，单独取消不影响其他运行
    pub fn run_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(reason = %reason, "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 依次执行清理任务，单个任务有超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.cleanup_tasks.push(task);
    }

    /// 单个任务超时或失败只记日志
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins_and_cancels_runs() {
        let manager = ShutdownManager::new();
        let run = manager.run_token();
        assert!(!run.is_cancelled());
        manager.shutdown(ShutdownReason::ClientDisconnected);
        manager.shutdown(ShutdownReason::Interrupt);
        assert!(manager.is_shutdown());
        assert!(run.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::ClientDisconnected));
    }

    #[test]
    fn test_run_token_cancel_is_local() {
        let manager = ShutdownManager::new();
        let run = manager.run_token();
        run.cancel();
        assert!(!manager.is_shutdown());
        assert!(manager.reason().is_none());
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
        stall: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_stalled_task_times_out() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let stalled = Arc::new(AtomicBool::new(false));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Arc::new(MockCleanup {
            called: stalled.clone(),
            stall: true,
        }));
        coordinator.register(Arc::new(MockCleanup {
            called: called.clone(),
            stall: false,
        }));
        coordinator.run_cleanup().await;
        assert!(!stalled.load(Ordering::SeqCst));
        assert!(called.load(Ordering::SeqCst));
    }
}
