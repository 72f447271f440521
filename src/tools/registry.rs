//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），注册时包装成 [`Operation`]，
//! 附带声明它的模块与源码位置。注册表内容只能通过 load / unload / switch 修改：
//! 写操作持有写锁完成整次替换，查找拿读锁、克隆出 Operation 后立即释放，
//! 因此切换进行中的查找会等待切换完成，不会看到缺少核心工具的中间状态。

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::tools::module::ModuleCatalog;

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（调用时的 name 字段）
    fn name(&self) -> &str;

    /// 工具描述（供客户端理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；失败时返回错误文本（供恢复中间件分类）
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 源码位置（文件 + 行号），用于自省与调试
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// 调用者所在位置
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self::new(loc.file(), loc.line())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// 已注册的操作：工具本体 + 声明模块 + 源码位置。注册后不可变
#[derive(Clone)]
pub struct Operation {
    tool: Arc<dyn Tool>,
    module: String,
    source: SourceLocation,
}

impl Operation {
    /// 以调用处作为源码位置
    #[track_caller]
    pub fn new(module: impl Into<String>, tool: impl Tool + 'static) -> Self {
        Self {
            tool: Arc::new(tool),
            module: module.into(),
            source: SourceLocation::caller(),
        }
    }

    pub fn from_parts(module: impl Into<String>, tool: Arc<dyn Tool>, source: SourceLocation) -> Self {
        Self {
            tool,
            module: module.into(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    pub fn tool(&self) -> Arc<dyn Tool> {
        Arc::clone(&self.tool)
    }

    /// 替换工具本体（中间件包装用），保留模块与位置
    pub fn with_tool(&self, tool: Arc<dyn Tool>) -> Self {
        Self {
            tool,
            module: self.module.clone(),
            source: self.source.clone(),
        }
    }

    pub async fn execute(&self, args: Value) -> Result<String, String> {
        self.tool.execute(args).await
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.tool.description().to_string(),
            input_schema: self.tool.parameters_schema(),
            module: self.module.clone(),
            source: self.source.to_string(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name())
            .field("module", &self.module)
            .field("source", &self.source)
            .finish()
    }
}

/// 暴露给客户端的工具描述
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    pub module: String,
    pub source: String,
}

/// 按名查找的结果
#[derive(Debug)]
pub enum Lookup {
    Found(Operation),
    NotFound,
}

/// 注册表错误：加载失败、重名、未找到等，一律上报调用方，不做重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Module '{module}' failed to load: {reason}")]
    ModuleLoad { module: String, reason: String },

    #[error("Duplicate tool '{name}' declared by '{first}' and '{second}'")]
    DuplicateTool {
        name: String,
        first: String,
        second: String,
    },

    #[error("Unknown persona: {0}")]
    UnknownPersona(String),
}

/// 注册表快照：工具名 -> Operation（有序，便于稳定输出）
pub type Snapshot = BTreeMap<String, Operation>;

/// 中间件：在工具进入注册表前包装它（如恢复引擎）
pub trait ToolMiddleware: Send + Sync {
    fn wrap(&self, op: Operation) -> Operation;
}

/// 一次加载的结果：成功加载的工具数与每个模块的错误
#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadReport {
    pub loaded_tools: usize,
    pub loaded_modules: Vec<String>,
    pub errors: Vec<String>,
}

impl LoadReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    tools: Snapshot,
    core: HashSet<String>,
    /// 已加载模块（按加载顺序）
    modules: Vec<String>,
}

impl RegistryState {
    /// 只保留核心工具的副本
    fn core_only(&self) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| self.core.contains(*name))
                .map(|(name, op)| (name.clone(), op.clone()))
                .collect(),
            core: self.core.clone(),
            modules: Vec::new(),
        }
    }

    fn insert(&mut self, op: Operation) -> Result<(), RegistryError> {
        if let Some(existing) = self.tools.get(op.name()) {
            return Err(RegistryError::DuplicateTool {
                name: op.name().to_string(),
                first: existing.module().to_string(),
                second: op.module().to_string(),
            });
        }
        self.tools.insert(op.name().to_string(), op);
        Ok(())
    }
}

/// 工具注册表：按名称存储 Operation，支持 load / unload / switch / lookup
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    middleware: Option<Arc<dyn ToolMiddleware>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模块工具进入注册表前经过 middleware 包装；核心工具不包装
    pub fn with_middleware(middleware: Arc<dyn ToolMiddleware>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            middleware: Some(middleware),
        }
    }

    fn prepare(&self, op: Operation) -> Operation {
        match &self.middleware {
            Some(mw) => mw.wrap(op),
            None => op,
        }
    }

    /// 注册核心工具：任何切换都不会卸载它。
    ///
    /// 核心工具（如 `skill_run`）内部调用的模块工具已各自经过恢复，外层再包装会重复补救与重试。
    pub async fn register_core(&self, op: Operation) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let name = op.name().to_string();
        state.insert(op)?;
        state.core.insert(name);
        Ok(())
    }

    /// 向 state 中装入一个模块的全部工具；任一工具重名则整个模块不装入
    async fn install_module(
        &self,
        state: &mut RegistryState,
        catalog: &ModuleCatalog,
        module_id: &str,
    ) -> Result<usize, RegistryError> {
        let module = catalog
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;
        let ops = module.load().await.map_err(|reason| RegistryError::ModuleLoad {
            module: module_id.to_string(),
            reason,
        })?;

        let mut seen = HashSet::new();
        for op in &ops {
            if let Some(existing) = state.tools.get(op.name()) {
                return Err(RegistryError::DuplicateTool {
                    name: op.name().to_string(),
                    first: existing.module().to_string(),
                    second: module_id.to_string(),
                });
            }
            if !seen.insert(op.name().to_string()) {
                return Err(RegistryError::DuplicateTool {
                    name: op.name().to_string(),
                    first: module_id.to_string(),
                    second: module_id.to_string(),
                });
            }
        }

        let count = ops.len();
        for op in ops {
            state.insert(self.prepare(op))?;
        }
        state.modules.push(module_id.to_string());
        Ok(count)
    }

    /// 增量加载模块：已加载的模块跳过（幂等），失败的模块记录错误，其余照常加载
    pub async fn load(&self, catalog: &ModuleCatalog, module_ids: &[String]) -> LoadReport {
        let mut state = self.state.write().await;
        let mut report = LoadReport::default();
        for id in module_ids {
            if state.modules.iter().any(|m| m == id) {
                tracing::debug!(module = %id, "module already loaded, skipping");
                continue;
            }
            match self.install_module(&mut state, catalog, id).await {
                Ok(count) => {
                    report.loaded_tools += count;
                    report.loaded_modules.push(id.clone());
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }
        report
    }

    /// 卸载所有模块工具，只保留核心工具；返回卸载的工具数
    pub async fn unload(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.tools.len();
        *state = state.core_only();
        before - state.tools.len()
    }

    /// 原子切换：在同一个写锁内「卸载 + 加载」；任一模块失败则保留原快照并返回全部错误
    pub async fn switch(&self, catalog: &ModuleCatalog, module_ids: &[String]) -> Result<LoadReport, Vec<RegistryError>> {
        let mut state = self.state.write().await;
        let mut next = state.core_only();
        let mut report = LoadReport::default();
        let mut errors = Vec::new();

        for id in module_ids {
            if next.modules.iter().any(|m| m == id) {
                continue;
            }
            match self.install_module(&mut next, catalog, id).await {
                Ok(count) => {
                    report.loaded_tools += count;
                    report.loaded_modules.push(id.clone());
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        *state = next;
        Ok(report)
    }

    pub async fn lookup(&self, name: &str) -> Lookup {
        match self.state.read().await.tools.get(name) {
            Some(op) => Lookup::Found(op.clone()),
            None => Lookup::NotFound,
        }
    }


    pub async fn tool_names(&self) -> Vec<String> {
        self.state.read().await.tools.keys().cloned().collect()
    }

    pub async fn core_names(&self) -> HashSet<String> {
        self.state.read().await.core.clone()
    }

    pub async fn loaded_modules(&self) -> Vec<String> {
        self.state.read().await.modules.clone()
    }

    /// 供客户端列出的工具描述
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.state
            .read()
            .await
            .tools
            .values()
            .map(Operation::descriptor)
            .collect()
    }

    /// 按名执行；查找失败返回 NotFound，而不是 panic
    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        match self.lookup(name).await {
            Lookup::Found(op) => op.execute(args).await,
            Lookup::NotFound => Err(RegistryError::NotFound(name.to_string()).to_string()),
        }
    }
}
