//! 核心层：错误类型、恢复中间件、运行时装配、优雅关闭

pub mod error;
pub mod recovery;
pub mod runtime;
pub mod shutdown;

pub use error::{HiveError, RecoveryError, ToolFailure};
pub use recovery::{RecoveryEngine, RemediationRule, Remediator, ToolRemediator};
pub use runtime::Runtime;
pub use shutdown::{ShutdownManager, ShutdownReason};
