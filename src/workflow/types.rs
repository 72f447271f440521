//! 技能（工作流）类型定义
//!
//! SkillDefinition 是 TOML 中的原始声明；编译后得到 Skill（参数模板与条件已解析为 AST）。
//! WorkflowRun 是一次运行的完整记录，运行结束后写入记忆。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::condition::Guard;
use crate::workflow::template::{ParamTemplate, ResolveError};

pub type RunId = String;

/// 技能声明（skills 目录下一个 TOML 文件）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    /// 为空时取文件名
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<SkillInput>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// 技能输入声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// 步骤失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// 中间件已重试过；有备用操作则执行备用并继续，否则整个运行失败
    Retry,
    /// 记录失败并继续，最终状态为 succeeded_with_warnings
    Skip,
    /// 立即失败，后续步骤不执行
    #[default]
    Abort,
}

/// 备用操作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackDefinition {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 步骤声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    /// 守卫条件；为假时跳过该步骤
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub fallback: Option<FallbackDefinition>,
}

/// 编译后的步骤
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub tool: String,
    pub params: ParamTemplate,
    pub guard: Option<Guard>,
    pub on_failure: OnFailure,
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Clone)]
pub struct Fallback {
    pub tool: String,
    pub params: ParamTemplate,
}

/// 编译后的技能
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub inputs: Vec<SkillInput>,
    pub steps: Vec<Step>,
}

impl Skill {
    /// 合并默认值并检查必填输入；缺失时返回第一个缺失的输入名
    pub fn bind_inputs(&self, mut provided: Map<String, Value>) -> Result<Map<String, Value>, WorkflowError> {
        for input in &self.inputs {
            let present = matches!(provided.get(&input.name), Some(v) if !v.is_null());
            if present {
                continue;
            }
            match &input.default {
                Some(default) => {
                    provided.insert(input.name.clone(), default.clone());
                }
                None if input.required => return Err(WorkflowError::MissingInput(input.name.clone())),
                None => {}
            }
        }
        Ok(provided)
    }
}

/// 技能运行状态：pending → running → 终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    SucceededWithWarnings,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::SucceededWithWarnings)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::SucceededWithWarnings => "succeeded_with_warnings",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// 单个步骤的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// 守卫为假，未执行（不算警告）
    Skipped,
    /// 失败但策略为 skip，继续执行后续步骤
    FailedIgnored,
    /// 主操作失败，备用操作成功
    FellBack,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub tool: String,
    pub status: StepStatus,
    /// 工具输出；能解析为 JSON 时保存解析后的值
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// 一次技能运行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub skill: String,
    pub inputs: Map<String, Value>,
    pub steps: Vec<StepOutcome>,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl WorkflowRun {
    pub fn new(skill: &str, inputs: Map<String, Value>) -> Self {
        Self {
            id: format!("run_{}", uuid::Uuid::new_v4()),
            skill: skill.to_string(),
            inputs,
            steps: Vec::new(),
            status: RunStatus::Pending,
            error: None,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// 供通知使用的一行摘要
    pub fn summary(&self) -> String {
        let mut s = format!(
            "skill '{}' {} in {}ms ({} steps)",
            self.skill,
            self.status,
            self.duration_ms,
            self.steps.len()
        );
        if let Some(err) = &self.error {
            s.push_str(": ");
            s.push_str(err);
        }
        s
    }
}

/// 工作流错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Invalid skill '{skill}': {reason}")]
    InvalidDefinition { skill: String, reason: String },

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Step '{step}': {source}")]
    Resolve {
        step: String,
        #[source]
        source: ResolveError,
    },

    #[error("Step '{step}': unknown operation '{tool}'")]
    UnknownOperation { step: String, tool: String },

    #[error("Step '{step}': guard evaluation failed: {source}")]
    Guard {
        step: String,
        #[source]
        source: ResolveError,
    },

    #[error("Step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    #[error("Run aborted")]
    Aborted,

    #[error("Skill '{0}' is not available for the active persona")]
    NotAvailable(String),

    #[error("Failed to read skill '{skill}': {reason}")]
    Load { skill: String, reason: String },
}
