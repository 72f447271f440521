//! 工具执行器
//!
//! 持有 ToolRegistry，execute(tool_name, args) 先在注册表中查找（读锁只在查找期间持有），
//! 再执行操作；找不到工具与工具失败分别映射为 InvokeError 的两个分支。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::tools::registry::{Lookup, ToolRegistry};

/// 一次调用的失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// 当前工具集中没有该名称
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// 工具执行失败（已经过恢复中间件）
    #[error("{0}")]
    Failed(String),
}

/// 工具执行器：技能运行、协议服务与调度器共用的调用入口
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具并输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<String, InvokeError> {
        let op = match self.registry.lookup(tool_name).await {
            Lookup::Found(op) => op,
            Lookup::NotFound => {
                tracing::warn!(tool = %tool_name, "tool not found in active set");
                return Err(InvokeError::NotFound(tool_name.to_string()));
            }
        };

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = op.execute(args).await;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "module": op.module(),
            "ok": result.is_ok(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result.map_err(InvokeError::Failed)
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::module::{ModuleCatalog, StaticModule};
    use crate::tools::registry::{Operation, Tool};
    use async_trait::async_trait;

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn name(&self) -> &str {
            "kube_pods"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Err("connection refused".to_string())
        }
    }

    #[tokio::test]
    async fn test_not_found_and_failed_are_distinct() {
        let registry = Arc::new(ToolRegistry::new());
        let mut catalog = ModuleCatalog::new();
        catalog.register(StaticModule::new("k8s", vec![Operation::new("k8s", Fails)]));
        registry.load(&catalog, &["k8s".to_string()]).await;

        let executor = ToolExecutor::new(registry);
        assert_eq!(
            executor.execute("git_log", Value::Null).await,
            Err(InvokeError::NotFound("git_log".to_string()))
        );
        assert_eq!(
            executor.execute("kube_pods", Value::Null).await,
            Err(InvokeError::Failed("connection refused".to_string()))
        );
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = Value::String("x".repeat(500));
        assert!(args_preview(&long).ends_with("..."));
    }
}
