//! 调度器：cron 定时任务与条件轮询任务
//!
//! 单一循环按固定间隔 tick；每个到期任务在独立的 tokio 任务中运行技能，
//! 运行结束后更新任务状态并分发通知。cron 任务同一分钟只触发一次，
//! 轮询任务只在谓词由 false 变为 true 时触发。禁用的任务完全不求值。

pub mod cron;
pub mod job;
pub mod notify;
pub mod poll;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerSection;
use crate::core::shutdown::ShutdownCleanup;
use crate::memory::{Memory, SCHEDULER_STATE_KEY};
use crate::workflow::types::{RunStatus, WorkflowError, WorkflowRun};

pub use cron::{CronError, CronSchedule, SchedulerTimezone};
pub use job::{JobState, NotifyTarget, PollCondition, Predicate, ScheduledJob, Trigger};
pub use notify::{DefaultSink, Notification, NotificationSink, NotifyError};
pub use poll::{PollEvaluator, ToolPollEvaluator};

/// 调度器运行技能的入口
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(
        &self,
        skill: &str,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError>;
}

struct JobSlot {
    job: ScheduledJob,
    trigger: Trigger,
}

/// `hive jobs` 的列表项
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub skill: String,
    pub trigger: String,
    pub enabled: bool,
    pub notify: Vec<String>,
    pub state: JobState,
}

pub struct Scheduler {
    jobs: Vec<JobSlot>,
    rejected: Vec<(String, String)>,
    conditions: BTreeMap<String, PollCondition>,
    targets: BTreeMap<String, NotifyTarget>,
    timezone: SchedulerTimezone,
    tick: Duration,
    state: Mutex<HashMap<String, JobState>>,
    runner: Arc<dyn JobRunner>,
    poller: Arc<dyn PollEvaluator>,
    sink: Arc<dyn NotificationSink>,
    memory: Option<Arc<Memory>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// 校验任务配置；无效任务记录告警后跳过，不影响其余任务
    pub fn new(
        section: &SchedulerSection,
        runner: Arc<dyn JobRunner>,
        poller: Arc<dyn PollEvaluator>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, CronError> {
        let timezone = SchedulerTimezone::parse(&section.timezone)?;
        let mut jobs = Vec::new();
        let mut rejected = Vec::new();

        for job in &section.jobs {
            let checked = job.trigger().and_then(|trigger| {
                if let Trigger::Poll { condition, .. } = &trigger {
                    if !section.conditions.contains_key(condition) {
                        return Err(format!("unknown poll condition '{}'", condition));
                    }
                }
                if jobs.iter().any(|s: &JobSlot| s.job.name == job.name) {
                    return Err("duplicate job name".to_string());
                }
                Ok(trigger)
            });
            match checked {
                Ok(trigger) => {
                    for target in &job.notify {
                        if !section.notify.contains_key(target) {
                            tracing::warn!(job = %job.name, target = %target, "unknown notify target");
                        }
                    }
                    jobs.push(JobSlot {
                        job: job.clone(),
                        trigger,
                    });
                }
                Err(reason) => {
                    tracing::warn!(job = %job.name, "skipping invalid job: {}", reason);
                    rejected.push((job.name.clone(), reason));
                }
            }
        }

        Ok(Self {
            jobs,
            rejected,
            conditions: section.conditions.clone(),
            targets: section.notify.clone(),
            timezone,
            tick: Duration::from_secs(section.tick_secs.max(1)),
            state: Mutex::new(HashMap::new()),
            runner,
            poller,
            sink,
            memory: None,
            cancel: CancellationToken::new(),
        })
    }

    /// 启用状态持久化（`state/scheduler`）
    pub fn with_memory(mut self, memory: Arc<Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 配置有误被跳过的任务：(任务名, 原因)
    pub fn rejected(&self) -> &[(String, String)] {
        &self.rejected
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        let state = self.state.lock().await;
        self.jobs
            .iter()
            .map(|slot| JobInfo {
                name: slot.job.name.clone(),
                skill: slot.job.skill.clone(),
                trigger: slot.trigger.to_string(),
                enabled: slot.job.enabled,
                notify: slot.job.notify.clone(),
                state: state.get(&slot.job.name).cloned().unwrap_or_default(),
            })
            .collect()
    }

    pub async fn job_state(&self, name: &str) -> Option<JobState> {
        self.state.lock().await.get(name).cloned()
    }

    /// 从记忆恢复任务状态；只保留仍在配置中的任务
    pub async fn restore(&self) {
        let Some(memory) = &self.memory else { return };
        match memory.load_as::<HashMap<String, JobState>>(SCHEDULER_STATE_KEY).await {
            Ok(Some(saved)) => {
                let mut state = self.state.lock().await;
                for slot in &self.jobs {
                    if let Some(s) = saved.get(&slot.job.name) {
                        state.insert(slot.job.name.clone(), s.clone());
                    }
                }
                tracing::debug!(jobs = state.len(), "scheduler state restored");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to restore scheduler state: {}", e),
        }
    }

    async fn persist(&self) {
        let Some(memory) = &self.memory else { return };
        let snapshot = self.state.lock().await.clone();
        if let Err(e) = memory.save_as(SCHEDULER_STATE_KEY, &snapshot).await {
            tracing::warn!("failed to persist scheduler state: {}", e);
        }
    }

    /// 求出 `now` 时刻到期的任务并更新触发状态（不运行技能）
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        let local = self.timezone.localize(now);
        let minute = cron::minute_key(&local);

        for slot in self.jobs.iter().filter(|s| s.job.enabled) {
            let name = &slot.job.name;
            match &slot.trigger {
                Trigger::Cron(schedule) => {
                    if !schedule.matches(&local) {
                        continue;
                    }
                    let mut state = self.state.lock().await;
                    let entry = state.entry(name.clone()).or_default();
                    if entry.last_fired_minute != Some(minute) {
                        entry.last_fired_minute = Some(minute);
                        due.push(name.clone());
                    }
                }
                Trigger::Poll { condition, interval_secs } => {
                    let last_polled = self.state.lock().await.get(name).and_then(|s| s.last_polled_at);
                    if let Some(at) = last_polled {
                        if now.timestamp().saturating_sub(at) < *interval_secs {
                            continue;
                        }
                    }
                    let Some(cond) = self.conditions.get(condition) else { continue };
                    let result = self.poller.evaluate(cond, now).await;

                    let mut state = self.state.lock().await;
                    let entry = state.entry(name.clone()).or_default();
                    entry.last_polled_at = Some(now.timestamp());
                    match result {
                        Ok(current) => {
                            if current && !entry.last_poll_state {
                                due.push(name.clone());
                            }
                            entry.last_poll_state = current;
                        }
                        Err(e) => {
                            tracing::warn!(job = %name, condition = %condition, "poll failed: {}", e);
                        }
                    }
                }
            }
        }
        due
    }

    /// 一次 tick：求到期任务，每个在独立任务中运行
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due = self.due_jobs(now).await;
        self.persist().await;
        due.into_iter()
            .map(|name| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.fire(&name).await })
            })
            .collect()
    }

    /// 运行任务的技能，更新状态并分发通知
    pub async fn fire(&self, name: &str) {
        let Some(slot) = self.jobs.iter().find(|s| s.job.name == name) else {
            tracing::warn!(job = %name, "fire requested for unknown job");
            return;
        };
        let job = &slot.job;
        tracing::info!(job = %job.name, skill = %job.skill, "job fired");

        let run = match self.runner.run_job(&job.skill, job.inputs.clone(), &self.cancel).await {
            Ok(run) => run,
            Err(e) => {
                let mut run = WorkflowRun::new(&job.skill, job.inputs.clone());
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                run.finished_at = Some(Utc::now().to_rfc3339());
                run
            }
        };

        {
            let mut state = self.state.lock().await;
            let entry = state.entry(job.name.clone()).or_default();
            entry.last_run_at = Some(run.finished_at.clone().unwrap_or_else(|| Utc::now().to_rfc3339()));
            entry.last_status = Some(run.status);
            entry.last_run_id = Some(run.id.clone());
            entry.fire_count += 1;
        }
        self.persist().await;

        let notification = Notification::from_run(&job.name, &run);
        for target_name in &job.notify {
            let Some(target) = self.targets.get(target_name) else {
                tracing::warn!(job = %job.name, target = %target_name, "unknown notify target");
                continue;
            };
            if let Err(e) = self.sink.dispatch(target, &notification).await {
                tracing::warn!(job = %job.name, target = %target_name, "notification dispatch failed: {}", e);
            }
        }
    }

    /// 调度主循环，直到取消
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.restore().await;
        tracing::info!(
            jobs = self.jobs.len(),
            tick_secs = self.tick.as_secs(),
            "scheduler started"
        );
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    let handles = self.tick(Utc::now()).await;
                    if !handles.is_empty() {
                        tracing::debug!(fired = handles.len(), running = in_flight.len(), "tick");
                    }
                    in_flight.extend(handles);
                }
            }
        }

        // 进行中的运行在下一个步骤边界结束（aborted）
        self.cancel.cancel();
        if !in_flight.is_empty() {
            tracing::info!(running = in_flight.len(), "waiting for in-flight job runs");
            join_all(in_flight).await;
        }
        tracing::info!("scheduler stopped");
    }
}

#[async_trait]
impl ShutdownCleanup for Scheduler {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.persist().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scheduler-state"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        runs: StdMutex<Vec<String>>,
        status: RunStatus,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run_job(
            &self,
            skill: &str,
            inputs: Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<WorkflowRun, WorkflowError> {
            if skill == "missing" {
                return Err(WorkflowError::SkillNotFound(skill.to_string()));
            }
            self.runs.lock().unwrap().push(skill.to_string());
            let mut run = WorkflowRun::new(skill, inputs);
            run.status = self.status;
            run.finished_at = Some(Utc::now().to_rfc3339());
            Ok(run)
        }
    }

    /// 按顺序返回预设结果
    struct ScriptedPoller {
        results: StdMutex<Vec<Result<bool, String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PollEvaluator for ScriptedPoller {
        async fn evaluate(&self, _c: &PollCondition, _now: DateTime<Utc>) -> Result<bool, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(false)
            } else {
                results.remove(0)
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(NotifyTarget, Notification)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn dispatch(&self, target: &NotifyTarget, n: &Notification) -> Result<(), NotifyError> {
            if let NotifyTarget::Webhook { url } = target {
                return Err(NotifyError::Webhook {
                    url: url.clone(),
                    reason: "unreachable".to_string(),
                });
            }
            self.sent.lock().unwrap().push((target.clone(), n.clone()));
            Ok(())
        }
    }

    fn section(toml_text: &str) -> SchedulerSection {
        toml::from_str(toml_text).unwrap()
    }

    const CONFIG: &str = r#"
timezone = "+08:00"

[[jobs]]
name = "morning"
skill = "coffee"
cron = "30 8 * * *"
notify = ["log", "hook"]

[[jobs]]
name = "stale_mrs"
skill = "review"
poll = "old_mrs"
poll_interval_secs = 60

[[jobs]]
name = "off"
skill = "review"
poll = "old_mrs"
enabled = false

[[jobs]]
name = "broken"
skill = "x"
poll = "nope"

[conditions.old_mrs]
tool = "gitlab_mr_list"
predicate = { kind = "non_empty" }

[notify.log]
kind = "log"

[notify.hook]
kind = "webhook"
url = "http://127.0.0.1:9/"
"#;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        runner: Arc<RecordingRunner>,
        poller: Arc<ScriptedPoller>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(config: &str, polls: Vec<Result<bool, String>>) -> Fixture {
        let runner = Arc::new(RecordingRunner {
            runs: StdMutex::new(Vec::new()),
            status: RunStatus::Succeeded,
        });
        let poller = Arc::new(ScriptedPoller {
            results: StdMutex::new(polls),
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(&section(config), runner.clone(), poller.clone(), sink.clone())
            .unwrap()
            .with_memory(Arc::new(Memory::in_memory()));
        Fixture {
            scheduler: Arc::new(scheduler),
            runner,
            poller,
            sink,
        }
    }

    #[tokio::test]
    async fn test_invalid_jobs_are_skipped() {
        let f = fixture(CONFIG, vec![]);
        let names: Vec<_> = f.scheduler.jobs().await.into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["morning", "stale_mrs", "off"]);
        assert_eq!(f.scheduler.rejected()[0].0, "broken");
    }

    #[tokio::test]
    async fn test_oversized_cron_step_rejects_only_that_job() {
        let config = r#"
[[jobs]]
name = "overflow"
skill = "x"
cron = "1/4294967295 * * * *"

[[jobs]]
name = "hourly"
skill = "x"
cron = "@hourly"
"#;
        let f = fixture(config, vec![]);
        let names: Vec<_> = f.scheduler.jobs().await.into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["hourly"]);
        assert_eq!(f.scheduler.rejected()[0].0, "overflow");
        assert!(f.scheduler.rejected()[0].1.contains("step"));
    }

    #[tokio::test]
    async fn test_cron_fires_once_per_minute() {
        let f = fixture(CONFIG, vec![]);
        // 08:30 (+08:00) == 00:30 UTC
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 29, 50).unwrap();
        let mut fired = Vec::new();
        for i in 0..9 {
            let now = start + chrono::Duration::seconds(10 * i);
            let due = f.scheduler.due_jobs(now).await;
            if due.contains(&"morning".to_string()) {
                fired.push(now);
            }
        }
        assert_eq!(fired, vec![Utc.with_ymd_and_hms(2024, 6, 3, 0, 30, 0).unwrap()]);

        // 第二天同一时刻再次触发
        let next_day = Utc.with_ymd_and_hms(2024, 6, 4, 0, 30, 20).unwrap();
        assert!(f.scheduler.due_jobs(next_day).await.contains(&"morning".to_string()));
    }

    #[tokio::test]
    async fn test_poll_fires_on_rising_edge() {
        let sequence = [false, false, true, true, false, true];
        let f = fixture(CONFIG, sequence.iter().map(|b| Ok(*b)).collect());
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap();

        let mut fired_at = Vec::new();
        for i in 0..sequence.len() {
            let now = start + chrono::Duration::seconds(60 * i as i64);
            if f.scheduler.due_jobs(now).await.contains(&"stale_mrs".to_string()) {
                fired_at.push(i);
            }
        }
        assert_eq!(fired_at, vec![2, 5]);
        // 禁用的任务从未求值
        assert_eq!(f.poller.calls.load(Ordering::SeqCst), sequence.len());
    }

    #[tokio::test]
    async fn test_poll_respects_interval_and_errors() {
        let f = fixture(CONFIG, vec![Err("timeout".to_string()), Ok(true)]);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap();

        assert!(f.scheduler.due_jobs(t0).await.is_empty());
        // 间隔未到，不求值
        assert!(f.scheduler.due_jobs(t0 + chrono::Duration::seconds(30)).await.is_empty());
        assert_eq!(f.poller.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.scheduler.due_jobs(t0 + chrono::Duration::seconds(60)).await,
            vec!["stale_mrs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fire_updates_state_and_notifies() {
        let f = fixture(CONFIG, vec![]);
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 0, 30, 0).unwrap();
        let handles = f.scheduler.tick(now).await;
        assert_eq!(handles.len(), 1);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*f.runner.runs.lock().unwrap(), vec!["coffee".to_string()]);
        let state = f.scheduler.job_state("morning").await.unwrap();
        assert_eq!(state.last_status, Some(RunStatus::Succeeded));
        assert_eq!(state.fire_count, 1);
        assert!(state.last_run_at.is_some());

        // webhook 失败只记日志，log 目标照常收到
        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NotifyTarget::Log);
        assert_eq!(sent[0].1.job, "morning");
    }

    #[tokio::test]
    async fn test_missing_skill_records_failure() {
        let config = r#"
[[jobs]]
name = "ghost"
skill = "missing"
cron = "* * * * *"
notify = ["mem"]

[notify.mem]
kind = "memory"
"#;
        let f = fixture(config, vec![]);
        f.scheduler.fire("ghost").await;
        let state = f.scheduler.job_state("ghost").await.unwrap();
        assert_eq!(state.last_status, Some(RunStatus::Failed));
        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent[0].1.status, RunStatus::Failed);
        assert!(sent[0].1.summary.contains("Skill not found"));
    }

    #[tokio::test]
    async fn test_state_persists_and_restores() {
        let memory = Arc::new(Memory::in_memory());
        let build = || {
            let runner = Arc::new(RecordingRunner {
                runs: StdMutex::new(Vec::new()),
                status: RunStatus::Succeeded,
            });
            let poller = Arc::new(ScriptedPoller {
                results: StdMutex::new(vec![]),
                calls: AtomicUsize::new(0),
            });
            Arc::new(
                Scheduler::new(&section(CONFIG), runner, poller, Arc::new(RecordingSink::default()))
                    .unwrap()
                    .with_memory(memory.clone()),
            )
        };

        let now = Utc.with_ymd_and_hms(2024, 6, 3, 0, 30, 0).unwrap();
        let first = build();
        for h in first.tick(now).await {
            h.await.unwrap();
        }

        // 重启后同一分钟不再重复触发
        let second = build();
        second.restore().await;
        assert_eq!(second.job_state("morning").await.unwrap().fire_count, 1);
        assert!(second.due_jobs(now + chrono::Duration::seconds(20)).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let f = fixture("tick_secs = 1", vec![]);
        let token = CancellationToken::new();
        let handle = tokio::spawn(f.scheduler.clone().run(token.clone()));
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
