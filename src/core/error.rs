//! 运行时错误类型
//!
//! 各子系统各有自己的错误枚举（RegistryError、WorkflowError、CronError、MemoryError），
//! 这里放跨子系统的部分：恢复引擎错误与运行时装配错误。

use thiserror::Error;

use crate::memory::MemoryError;
use crate::tools::registry::RegistryError;

/// 恢复引擎错误（规则非法、记忆读写失败）
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Invalid remediation rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// 运行时装配与人格切换错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// 切换失败：原工具集保持不变
    #[error("Persona switch to '{persona}' failed: {}", .errors.join("; "))]
    SwitchFailed { persona: String, errors: Vec<String> },

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// 经恢复中间件处理后仍然失败的工具调用
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolFailure {
    /// 已分类并执行过补救，重试后仍失败
    #[error("recovery attempted, still failing [{class}]: {error} ({remediation})")]
    StillFailing {
        class: String,
        error: String,
        remediation: String,
    },

    /// 未命中任何规则，原样返回
    #[error("{0}")]
    Unclassified(String),
}
