//! 工具层：注册表、模块、命令 / HTTP 工具、核心工具与执行器

pub mod command;
pub mod core;
pub mod executor;
pub mod http;
pub mod module;
pub mod registry;
pub mod schema;

pub use command::CommandTool;
pub use executor::{InvokeError, ToolExecutor};
pub use http::HttpTool;
pub use module::{ConfiguredModule, ModuleCatalog, StaticModule, ToolModule};
pub use registry::{Lookup, Operation, RegistryError, SourceLocation, Tool, ToolRegistry};
