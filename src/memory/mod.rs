//! 记忆层：当前状态（state/*，频繁覆盖）与经验（learned/*，追加为主）
//!
//! 所有组件只通过 [`Memory`] 的 load / save / update 访问，具体文件格式对外不可见。

pub mod store;

pub use store::{FileMemoryStore, InMemoryStore, Memory, MemoryError, MemoryStore};

/// 每个技能最近一次运行摘要（技能名 -> 摘要）
pub const LAST_RUNS_KEY: &str = "state/last_runs";
/// 技能运行历史（有上限）
pub const RUN_HISTORY_KEY: &str = "state/run_history";
/// 调度器的任务状态（上次触发分钟、上次轮询状态、上次运行结果）
pub const SCHEDULER_STATE_KEY: &str = "state/scheduler";
/// 持久化通知记录
pub const NOTIFICATIONS_KEY: &str = "state/notifications";
/// 故障记录（只追加，按保留策略裁剪）
pub const FAILURES_KEY: &str = "learned/failures";
/// 运行时学到的恢复规则
pub const PATTERNS_KEY: &str = "learned/patterns";
