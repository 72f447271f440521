//! 错误恢复引擎
//!
//! 包装每个注册的工具：成功时原样返回；失败时按错误文本分类（classify），
//! 命中恢复规则则执行补救动作（remediate，如重新登录、重连），补救成功后重试原调用，
//! 重试次数由规则给出（默认 1 次）。未分类的错误立即返回，不做任何补救或重试。
//! 每次失败的处理结果都作为 FailureRecord 追加到 learned/failures。
//!
//! 规则来源：配置中的静态规则 + 运维人员确认修复后通过 `learn` 写入记忆的学习规则，
//! 分类时先查学习规则再查静态规则。

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{RecoveryError, ToolFailure};
use crate::memory::{Memory, FAILURES_KEY, PATTERNS_KEY};
use crate::tools::registry::{Operation, Tool, ToolMiddleware, ToolRegistry};

/// 常用错误类别标签
pub const CLASS_AUTHENTICATION: &str = "authentication";
pub const CLASS_CONNECTIVITY: &str = "connectivity";
pub const CLASS_CONFIRMATION_REQUIRED: &str = "interactive-confirmation-required";

tokio::task_local! {
    /// 补救动作执行期间置位：补救动作自身失败时不再触发恢复
    static REMEDIATING: ();
}

fn default_max_retries() -> u32 {
    1
}

/// 补救动作：调用注册表中的某个工具
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationAction {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 恢复规则：错误类别 + 匹配器 + 补救动作 + 作用范围 + 重试上限
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationRule {
    /// 错误类别标签，如 authentication / connectivity
    pub class: String,
    /// 匹配错误文本的子串（大小写不敏感）或正则
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    pub action: RemediationAction,
    /// 适用的外部系统（与工具所属模块比较）；为空表示适用于所有工具
    #[serde(default)]
    pub scope: Option<String>,
    /// 补救成功后的重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RemediationRule {
    pub fn new(class: impl Into<String>, pattern: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            pattern: pattern.into(),
            regex: false,
            action: RemediationAction {
                tool: tool.into(),
                args: Value::Null,
            },
            scope: None,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_regex(mut self) -> Self {
        self.regex = true;
        self
    }

    fn compile(&self) -> Result<CompiledRule, RecoveryError> {
        let matcher = if self.regex {
            Matcher::Regex(Regex::new(&self.pattern).map_err(|e| RecoveryError::InvalidRule {
                pattern: self.pattern.clone(),
                reason: e.to_string(),
            })?)
        } else {
            if self.pattern.trim().is_empty() {
                return Err(RecoveryError::InvalidRule {
                    pattern: self.pattern.clone(),
                    reason: "empty pattern".to_string(),
                });
            }
            Matcher::Substring(self.pattern.to_lowercase())
        };
        Ok(CompiledRule {
            rule: self.clone(),
            matcher,
        })
    }
}

#[derive(Debug)]
enum Matcher {
    Substring(String),
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledRule {
    rule: RemediationRule,
    matcher: Matcher,
}

impl CompiledRule {
    fn matches(&self, error_text: &str, scope_hint: Option<&str>) -> bool {
        if let (Some(scope), Some(hint)) = (&self.rule.scope, scope_hint) {
            if scope != hint {
                return false;
            }
        }
        match &self.matcher {
            Matcher::Substring(s) => error_text.to_lowercase().contains(s.as_str()),
            Matcher::Regex(re) => re.is_match(error_text),
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Classified(RemediationRule),
    Unclassified,
}

/// 补救动作的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemediationOutcome {
    pub action: String,
    pub success: bool,
    pub detail: String,
}

impl fmt::Display for RemediationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "ok" } else { "failed" };
        write!(f, "remediation '{}' {}: {}", self.action, status, self.detail)
    }
}

/// 一次失败处理的最终结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// 已分类、补救并重试成功
    Recovered,
    /// 已分类但补救或重试后仍失败
    StillFailing,
    /// 未分类，直接返回
    Unclassified,
}

/// 故障记录（只追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub tool: String,
    pub module: String,
    pub class: Option<String>,
    pub pattern: Option<String>,
    pub remediation: Option<RemediationOutcome>,
    pub outcome: RecoveryOutcome,
    pub error: String,
    pub timestamp: String,
}

/// 执行补救动作的执行者
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn remediate(&self, action: &RemediationAction, scope: Option<&str>) -> Result<String, String>;
}

/// 默认补救执行者：在注册表中按名调用补救工具（如 kube_login、vpn_connect）
pub struct ToolRemediator {
    registry: Weak<ToolRegistry>,
}

impl ToolRemediator {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Remediator for ToolRemediator {
    async fn remediate(&self, action: &RemediationAction, scope: Option<&str>) -> Result<String, String> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| "tool registry dropped".to_string())?;
        let mut args = match &action.args {
            Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        if let (Some(obj), Some(scope)) = (args.as_object_mut(), scope) {
            obj.entry("scope").or_insert_with(|| Value::String(scope.to_string()));
        }
        registry.execute(&action.tool, args).await
    }
}

/// 语义化错误恢复：分类 → 补救 → 有界重试 → 记录
#[derive(Clone)]
pub struct RecoveryEngine {
    memory: Arc<Memory>,
    static_rules: Arc<Vec<CompiledRule>>,
    remediator: Arc<dyn Remediator>,
    max_failure_records: usize,
}

impl RecoveryEngine {
    /// 静态规则中无法编译的条目会被跳过并告警
    pub fn new(memory: Arc<Memory>, rules: Vec<RemediationRule>, remediator: Arc<dyn Remediator>) -> Self {
        let static_rules = rules
            .iter()
            .filter_map(|r| match r.compile() {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(class = %r.class, "skipping recovery rule: {}", e);
                    None
                }
            })
            .collect();
        Self {
            memory,
            static_rules: Arc::new(static_rules),
            remediator,
            max_failure_records: 500,
        }
    }

    pub fn with_max_failure_records(mut self, max: usize) -> Self {
        self.max_failure_records = max.max(1);
        self
    }

    /// 从记忆读取学习到的规则
    pub async fn learned_rules(&self) -> Result<Vec<RemediationRule>, RecoveryError> {
        Ok(self
            .memory
            .load_as::<Vec<RemediationRule>>(PATTERNS_KEY)
            .await?
            .unwrap_or_default())
    }

    /// 按错误文本分类；学习规则优先于静态规则
    pub async fn classify(&self, error_text: &str, scope_hint: Option<&str>) -> Classification {
        let learned = match self.learned_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!("failed to read learned recovery rules: {}", e);
                Vec::new()
            }
        };
        for rule in &learned {
            match rule.compile() {
                Ok(c) if c.matches(error_text, scope_hint) => {
                    return Classification::Classified(c.rule);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("ignoring invalid learned rule: {}", e),
            }
        }
        self.static_rules
            .iter()
            .find(|c| c.matches(error_text, scope_hint))
            .map(|c| Classification::Classified(c.rule.clone()))
            .unwrap_or(Classification::Unclassified)
    }

    /// 执行补救动作
    pub async fn remediate(&self, rule: &RemediationRule, scope_hint: Option<&str>) -> RemediationOutcome {
        let scope = rule.scope.as_deref().or(scope_hint);
        tracing::info!(class = %rule.class, action = %rule.action.tool, "applying remediation");
        let result = REMEDIATING
            .scope((), self.remediator.remediate(&rule.action, scope))
            .await;
        match result {
            Ok(detail) => RemediationOutcome {
                action: rule.action.tool.clone(),
                success: true,
                detail: preview(&detail, 200),
            },
            Err(detail) => RemediationOutcome {
                action: rule.action.tool.clone(),
                success: false,
                detail: preview(&detail, 200),
            },
        }
    }

    /// 运维人员确认修复后登记新规则（无需重启，立即参与分类）；同类别同模式的旧规则被替换
    pub async fn learn(&self, rule: RemediationRule) -> Result<(), RecoveryError> {
        rule.compile()?;
        let rule_value = serde_json::to_value(&rule).map_err(crate::memory::MemoryError::from)?;
        self.memory
            .update(PATTERNS_KEY, move |doc| {
                let mut rules = match doc {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                rules.retain(|r| {
                    !(r.get("class") == rule_value.get("class") && r.get("pattern") == rule_value.get("pattern"))
                });
                rules.push(rule_value);
                Value::Array(rules)
            })
            .await?;
        tracing::info!(class = %rule.class, pattern = %rule.pattern, "learned recovery rule");
        Ok(())
    }

    /// 最近的故障记录（最新在后）
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, RecoveryError> {
        let records: Vec<FailureRecord> = self
            .memory
            .load_as::<Vec<FailureRecord>>(FAILURES_KEY)
            .await?
            .unwrap_or_default();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    async fn record(&self, record: FailureRecord) {
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("failed to serialize failure record: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .memory
            .append(FAILURES_KEY, value, Some(self.max_failure_records))
            .await
        {
            tracing::warn!(tool = %record.tool, "failed to persist failure record: {}", e);
        }
    }

    /// 工具首次调用失败后的处理流程
    async fn recover(&self, op: &Operation, inner: &Arc<dyn Tool>, args: Value, error: String) -> Result<String, String> {
        let tool = op.name().to_string();
        let module = op.module().to_string();
        let mut record = FailureRecord {
            tool: tool.clone(),
            module: module.clone(),
            class: None,
            pattern: None,
            remediation: None,
            outcome: RecoveryOutcome::Unclassified,
            error: preview(&error, 500),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let rule = match self.classify(&error, Some(&module)).await {
            Classification::Classified(rule) => rule,
            Classification::Unclassified => {
                tracing::debug!(tool = %tool, "unclassified tool failure, surfacing");
                self.record(record).await;
                return Err(ToolFailure::Unclassified(error).to_string());
            }
        };
        record.class = Some(rule.class.clone());
        record.pattern = Some(rule.pattern.clone());

        let outcome = self.remediate(&rule, Some(&module)).await;
        record.remediation = Some(outcome.clone());
        if !outcome.success {
            tracing::warn!(tool = %tool, class = %rule.class, "remediation failed");
            record.outcome = RecoveryOutcome::StillFailing;
            self.record(record).await;
            return Err(still_failing(&error, &rule, &outcome));
        }

        let mut last_error = error;
        for attempt in 1..=rule.max_retries {
            match inner.execute(args.clone()).await {
                Ok(output) => {
                    tracing::info!(tool = %tool, class = %rule.class, attempt, "tool recovered after remediation");
                    record.outcome = RecoveryOutcome::Recovered;
                    self.record(record).await;
                    return Ok(output);
                }
                Err(e) => last_error = e,
            }
        }

        tracing::warn!(tool = %tool, class = %rule.class, "tool still failing after remediation");
        record.outcome = RecoveryOutcome::StillFailing;
        record.error = preview(&last_error, 500);
        self.record(record).await;
        Err(still_failing(&last_error, &rule, &outcome))
    }

    /// 包装一个操作：返回的操作成功路径与原操作完全一致
    pub fn wrap(&self, op: Operation) -> Operation {
        let wrapped = RecoveringTool {
            op: op.clone(),
            inner: op.tool(),
            engine: self.clone(),
        };
        op.with_tool(Arc::new(wrapped))
    }
}

impl ToolMiddleware for RecoveryEngine {
    fn wrap(&self, op: Operation) -> Operation {
        RecoveryEngine::wrap(self, op)
    }
}

fn still_failing(error: &str, rule: &RemediationRule, outcome: &RemediationOutcome) -> String {
    ToolFailure::StillFailing {
        class: rule.class.clone(),
        error: error.to_string(),
        remediation: outcome.to_string(),
    }
    .to_string()
}

fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 带恢复能力的工具包装
struct RecoveringTool {
    op: Operation,
    inner: Arc<dyn Tool>,
    engine: RecoveryEngine,
}

#[async_trait]
impl Tool for RecoveringTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        match self.inner.execute(args.clone()).await {
            Ok(output) => Ok(output),
            Err(error) if REMEDIATING.try_with(|_| ()).is_ok() => Err(error),
            Err(error) => self.engine.recover(&self.op, &self.inner, args, error).await,
        }
    }
}
