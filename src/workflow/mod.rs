//! 工作流（技能）引擎：声明式步骤序列，参数模板、守卫、失败策略与运行记录

pub mod builder;
pub mod condition;
pub mod engine;
pub mod template;
pub mod types;

pub use builder::SkillBuilder;
pub use engine::SkillRunner;
pub use template::{ParamTemplate, ResolveContext, ResolveError};
pub use types::*;
