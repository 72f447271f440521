//! 技能运行器
//!
//! 顺序执行步骤：解析参数模板 → 评估守卫（假则跳过）→ 经注册表调用（已包装恢复中间件）→
//! 成功则记录输出，失败按步骤策略处理（retry / skip / abort）。
//! 模板解析失败、未知操作、守卫求值错误属于工作流级错误：记为该步骤失败并立即结束运行。
//! 取消只在步骤边界检查，得到 aborted。运行结束后写入 state/last_runs 与 state/run_history。

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::memory::{Memory, LAST_RUNS_KEY, RUN_HISTORY_KEY};
use crate::tools::executor::{InvokeError, ToolExecutor};
use crate::workflow::template::{ParamTemplate, ResolveContext};
use crate::workflow::types::*;

/// 技能运行器
#[derive(Clone)]
pub struct SkillRunner {
    executor: ToolExecutor,
    memory: Arc<Memory>,
    history_limit: usize,
}

/// 单步执行结果（供主循环决定是否继续）
enum StepResult {
    Continue(StepOutcome),
    Warn(StepOutcome),
    Stop(StepOutcome, WorkflowError),
}

impl SkillRunner {
    pub fn new(executor: ToolExecutor, memory: Arc<Memory>) -> Self {
        Self {
            executor,
            memory,
            history_limit: 100,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// 运行技能；总是返回运行记录（失败原因在 `error` 字段）
    pub async fn run(&self, skill: &Skill, inputs: Map<String, Value>, cancel: &CancellationToken) -> WorkflowRun {
        let started = Instant::now();
        let mut run = WorkflowRun::new(&skill.name, inputs.clone());
        tracing::info!(skill = %skill.name, run_id = %run.id, "skill run started");

        match skill.bind_inputs(inputs) {
            Ok(bound) => {
                run.inputs = bound;
                run.status = RunStatus::Running;
                self.execute_steps(skill, &mut run, cancel).await;
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
            }
        }

        run.duration_ms = started.elapsed().as_millis() as u64;
        run.finished_at = Some(chrono::Utc::now().to_rfc3339());
        tracing::info!(
            skill = %skill.name,
            run_id = %run.id,
            status = %run.status,
            duration_ms = run.duration_ms,
            "skill run finished"
        );
        self.persist(&run).await;
        run
    }

    async fn execute_steps(&self, skill: &Skill, run: &mut WorkflowRun, cancel: &CancellationToken) {
        let mut outputs: Vec<(String, Option<Value>)> = Vec::with_capacity(skill.steps.len());
        let mut warnings = false;

        for step in &skill.steps {
            if cancel.is_cancelled() {
                run.status = RunStatus::Aborted;
                run.error = Some(WorkflowError::Aborted.to_string());
                return;
            }

            let result = self.execute_step(step, &run.inputs, &outputs).await;
            let outcome = match result {
                StepResult::Continue(o) => o,
                StepResult::Warn(o) => {
                    warnings = true;
                    o
                }
                StepResult::Stop(o, err) => {
                    tracing::warn!(skill = %skill.name, step = %step.name, "skill run failed: {}", err);
                    run.steps.push(o);
                    run.status = RunStatus::Failed;
                    run.error = Some(err.to_string());
                    return;
                }
            };
            outputs.push((outcome.name.clone(), outcome.output.clone()));
            run.steps.push(outcome);
        }

        run.status = if warnings {
            RunStatus::SucceededWithWarnings
        } else {
            RunStatus::Succeeded
        };
    }

    async fn execute_step(&self, step: &Step, inputs: &Map<String, Value>, outputs: &[(String, Option<Value>)]) -> StepResult {
        let started = Instant::now();
        let ctx = ResolveContext::new(inputs, outputs);
        let outcome = |status: StepStatus, output: Option<Value>, error: Option<String>| StepOutcome {
            name: step.name.clone(),
            tool: step.tool.clone(),
            status,
            output,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let args = match step.params.resolve(&ctx) {
            Ok(args) => args,
            Err(source) => {
                let err = WorkflowError::Resolve {
                    step: step.name.clone(),
                    source,
                };
                return StepResult::Stop(outcome(StepStatus::Failed, None, Some(err.to_string())), err);
            }
        };

        if let Some(guard) = &step.guard {
            match guard.evaluate(&ctx) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(step = %step.name, "guard false, skipping step");
                    return StepResult::Continue(outcome(StepStatus::Skipped, None, None));
                }
                Err(source) => {
                    let err = WorkflowError::Guard {
                        step: step.name.clone(),
                        source,
                    };
                    return StepResult::Stop(outcome(StepStatus::Failed, None, Some(err.to_string())), err);
                }
            }
        }

        let error = match self.invoke(step, &step.tool, args).await {
            Ok(output) => return StepResult::Continue(outcome(StepStatus::Succeeded, Some(output), None)),
            Err(StepError::Workflow(err)) => {
                return StepResult::Stop(outcome(StepStatus::Failed, None, Some(err.to_string())), err)
            }
            Err(StepError::Tool(error)) => error,
        };

        if let Some(fallback) = &step.fallback {
            tracing::info!(step = %step.name, fallback = %fallback.tool, "running fallback operation");
            match self.invoke_template(step, &fallback.tool, &fallback.params, &ctx).await {
                Ok(output) => {
                    return StepResult::Continue(outcome(StepStatus::FellBack, Some(output), Some(error)));
                }
                Err(StepError::Workflow(err)) => {
                    return StepResult::Stop(outcome(StepStatus::Failed, None, Some(err.to_string())), err)
                }
                Err(StepError::Tool(fb_error)) => {
                    let combined = format!("{}; fallback '{}' failed: {}", error, fallback.tool, fb_error);
                    return self.apply_policy(step, combined, outcome(StepStatus::Failed, None, None));
                }
            }
        }

        self.apply_policy(step, error, outcome(StepStatus::Failed, None, None))
    }

    fn apply_policy(&self, step: &Step, error: String, mut outcome: StepOutcome) -> StepResult {
        outcome.error = Some(error.clone());
        match step.on_failure {
            OnFailure::Skip => {
                tracing::warn!(step = %step.name, "step failed, continuing: {}", error);
                outcome.status = StepStatus::FailedIgnored;
                StepResult::Warn(outcome)
            }
            OnFailure::Retry | OnFailure::Abort => {
                outcome.status = StepStatus::Failed;
                StepResult::Stop(
                    outcome,
                    WorkflowError::StepFailed {
                        step: step.name.clone(),
                        error,
                    },
                )
            }
        }
    }

    async fn invoke_template(
        &self,
        step: &Step,
        tool: &str,
        params: &ParamTemplate,
        ctx: &ResolveContext<'_>,
    ) -> Result<Value, StepError> {
        let args = params.resolve(ctx).map_err(|source| {
            StepError::Workflow(WorkflowError::Resolve {
                step: step.name.clone(),
                source,
            })
        })?;
        self.invoke(step, tool, args).await
    }

    async fn invoke(&self, step: &Step, tool: &str, args: Value) -> Result<Value, StepError> {
        let args = if args.is_null() { Value::Object(Map::new()) } else { args };
        match self.executor.execute(tool, args).await {
            Ok(output) => Ok(parse_output(output)),
            Err(InvokeError::NotFound(_)) => Err(StepError::Workflow(WorkflowError::UnknownOperation {
                step: step.name.clone(),
                tool: tool.to_string(),
            })),
            Err(InvokeError::Failed(e)) => Err(StepError::Tool(e)),
        }
    }

    /// 写入最近一次运行与运行历史；写入失败只记日志
    async fn persist(&self, run: &WorkflowRun) {
        let summary = serde_json::json!({
            "run_id": run.id,
            "status": run.status,
            "finished_at": run.finished_at,
            "duration_ms": run.duration_ms,
            "error": run.error,
        });
        let skill = run.skill.clone();
        let result = self
            .memory
            .update(LAST_RUNS_KEY, move |doc| {
                let mut map = match doc {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                map.insert(skill, summary);
                Value::Object(map)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(skill = %run.skill, "failed to persist last run: {}", e);
        }

        match serde_json::to_value(run) {
            Ok(value) => {
                if let Err(e) = self.memory.append(RUN_HISTORY_KEY, value, Some(self.history_limit)).await {
                    tracing::warn!(skill = %run.skill, "failed to append run history: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to serialize run: {}", e),
        }
    }
}

enum StepError {
    /// 工作流级错误：立即结束运行
    Workflow(WorkflowError),
    /// 工具执行失败：按策略处理
    Tool(String),
}

/// 工具输出能解析为 JSON 时使用解析值，否则作为字符串
fn parse_output(output: String) -> Value {
    let trimmed = output.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(&output) {
            return v;
        }
    }
    Value::String(output)
}
