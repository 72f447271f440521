//! 定时任务、轮询条件与通知目标的配置类型，以及任务的运行状态

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scheduler::cron::{CronError, CronSchedule};
use crate::workflow::types::RunStatus;

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    300
}

fn default_min_count() -> usize {
    1
}

/// `[[scheduler.jobs]]` 条目
///
/// `cron` 与 `poll` 二选一；`poll` 引用 `[scheduler.conditions.<name>]`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub skill: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub poll: Option<String>,
    /// 轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 固定输入
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 通知目标名，引用 `[scheduler.notify.<name>]`
    #[serde(default)]
    pub notify: Vec<String>,
}

/// 解析后的触发方式
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(CronSchedule),
    Poll { condition: String, interval_secs: i64 },
}

impl ScheduledJob {
    pub fn trigger(&self) -> Result<Trigger, String> {
        match (&self.cron, &self.poll) {
            (Some(expr), None) => CronSchedule::parse(expr)
                .map(Trigger::Cron)
                .map_err(|e: CronError| e.to_string()),
            (None, Some(condition)) => {
                let interval_secs = match i64::try_from(self.poll_interval_secs) {
                    Ok(0) => return Err("poll_interval_secs must be positive".to_string()),
                    Ok(secs) => secs,
                    Err(_) => return Err(format!("poll_interval_secs {} is too large", self.poll_interval_secs)),
                };
                Ok(Trigger::Poll {
                    condition: condition.clone(),
                    interval_secs,
                })
            }
            (Some(_), Some(_)) => Err("set either 'cron' or 'poll', not both".to_string()),
            (None, None) => Err("one of 'cron' or 'poll' is required".to_string()),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron(cron) => write!(f, "cron '{}'", cron),
            Trigger::Poll { condition, interval_secs } => {
                write!(f, "poll '{}' every {}s", condition, interval_secs)
            }
        }
    }
}

/// `[scheduler.conditions.<name>]`：调用一个工具取得数据集，再对其求谓词
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCondition {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    pub predicate: Predicate,
}

/// 数据集上的谓词
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    NonEmpty,
    CountAtLeast {
        min: usize,
    },
    CountAtMost {
        max: usize,
    },
    /// `field` 指向的时间（RFC 3339 或 Unix 秒）早于 now - secs 的条目数 ≥ min_count
    OlderThan {
        field: String,
        secs: i64,
        #[serde(default = "default_min_count")]
        min_count: usize,
    },
}

/// `[scheduler.notify.<name>]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifyTarget {
    Log,
    /// 追加到记忆 `state/notifications`
    Memory,
    Webhook { url: String },
}

/// 任务的运行状态，持久化到 `state/scheduler`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// 最近一次 cron 触发所在的分钟序号（本地时间）
    #[serde(default)]
    pub last_fired_minute: Option<i64>,
    /// 最近一次轮询的谓词结果
    #[serde(default)]
    pub last_poll_state: bool,
    /// 最近一次轮询的时间（Unix 秒）
    #[serde(default)]
    pub last_polled_at: Option<i64>,
    #[serde(default)]
    pub last_run_at: Option<String>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub fire_count: u64,
}
