//! 技能系统：TOML 技能定义的发现与加载
//!
//! 目录结构：
//! ```text
//! config/skills/
//! ├── start_work.toml
//! └── coffee/
//!     └── skill.toml
//! ```

pub mod loader;

pub use loader::{SkillLoader, SkillSummary};
