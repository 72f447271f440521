//! Hive - 运维自动化运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、恢复中间件、运行时装配、优雅关闭
//! - **memory**: 持久化键值文档（state/* 与 learned/*）
//! - **observability**: tracing 订阅器
//! - **persona**: 人格（能力档案）切换
//! - **scheduler**: cron 与条件轮询任务
//! - **server**: stdio 上的工具协议服务（JSON-RPC 2.0）
//! - **skills**: 技能定义的读取与列表
//! - **tools**: 工具注册表、模块、命令 / HTTP 工具、核心工具
//! - **workflow**: 技能运行引擎（参数模板、守卫、失败策略）

pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod persona;
pub mod scheduler;
pub mod server;
pub mod skills;
pub mod tools;
pub mod workflow;

pub use crate::core::runtime::Runtime;
