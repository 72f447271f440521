//! 工具模块：一组一起加载 / 卸载的工具
//!
//! 人格（persona）按模块 id 列表描述可用工具；ModuleCatalog 保存进程内所有已知模块，
//! 加载时调用 [`ToolModule::load`] 取得 Operation 列表。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, ModuleEntry, ToolKind};
use crate::tools::command::{program_available, CommandTool};
use crate::tools::http::HttpTool;
use crate::tools::registry::{Operation, SourceLocation, Tool};

/// 工具模块 trait：id、描述、加载（返回该模块声明的全部操作）
#[async_trait]
pub trait ToolModule: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 加载模块；模块不可用（如外部程序缺失）时返回错误说明
    async fn load(&self) -> Result<Vec<Operation>, String>;
}

/// 代码中直接构造的模块
pub struct StaticModule {
    id: String,
    description: String,
    operations: Vec<Operation>,
}

impl StaticModule {
    pub fn new(id: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            operations,
        }
    }
}

#[async_trait]
impl ToolModule for StaticModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn load(&self) -> Result<Vec<Operation>, String> {
        Ok(self.operations.clone())
    }
}

/// 由配置 [modules.<id>] 声明的模块：每个条目是一个命令或 HTTP 工具
///
/// 加载时检查外部程序是否可用，任一工具不可用则整个模块加载失败。
/// 工具的源码位置取配置文件中声明它的行。
pub struct ConfiguredModule {
    id: String,
    entry: ModuleEntry,
    workspace: PathBuf,
    default_timeout_secs: u64,
    config_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl ConfiguredModule {
    pub fn new(id: impl Into<String>, entry: ModuleEntry, workspace: &Path, default_timeout_secs: u64) -> Self {
        Self {
            id: id.into(),
            entry,
            workspace: workspace.to_path_buf(),
            default_timeout_secs,
            config_path: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    fn build_tool(&self, tool: &crate::config::ToolEntry) -> Result<Arc<dyn Tool>, String> {
        let timeout = tool.timeout_secs.unwrap_or(self.default_timeout_secs);
        match tool.kind {
            ToolKind::Command => {
                let program = tool
                    .program
                    .as_deref()
                    .ok_or_else(|| format!("tool '{}': missing program", tool.name))?;
                if !program_available(program) {
                    return Err(format!("tool '{}': program '{}' not found", tool.name, program));
                }
                Ok(Arc::new(CommandTool::new(tool, program, &self.workspace, timeout)))
            }
            ToolKind::Http => {
                let url = tool
                    .url
                    .as_deref()
                    .ok_or_else(|| format!("tool '{}': missing url", tool.name))?;
                Ok(Arc::new(HttpTool::new(tool, url, &self.workspace, timeout, self.client.clone())?))
            }
        }
    }
}

/// 在配置文本中查找 `name = "<tool>"` 所在行（1 起）
fn declaration_line(config_text: &str, tool_name: &str) -> Option<u32> {
    config_text.lines().enumerate().find_map(|(i, line)| {
        let line = line.trim();
        let rest = line.strip_prefix("name")?.trim_start().strip_prefix('=')?.trim();
        let value = rest.trim_matches(|c| c == '"' || c == '\'');
        (value == tool_name).then_some(i as u32 + 1)
    })
}

#[async_trait]
impl ToolModule for ConfiguredModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.entry.description
    }

    async fn load(&self) -> Result<Vec<Operation>, String> {
        let config_text = match &self.config_path {
            Some(path) => tokio::fs::read_to_string(path).await.ok(),
            None => None,
        };
        let file = self
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<config>".to_string());

        let mut ops = Vec::with_capacity(self.entry.tools.len());
        for tool in &self.entry.tools {
            let built = self.build_tool(tool)?;
            let line = config_text
                .as_deref()
                .and_then(|text| declaration_line(text, &tool.name))
                .unwrap_or(0);
            ops.push(Operation::from_parts(self.id.clone(), built, SourceLocation::new(file.clone(), line)));
        }
        Ok(ops)
    }
}

/// 模块目录：模块 id -> 模块
#[derive(Default, Clone)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, Arc<dyn ToolModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块；同 id 的后注册者覆盖先注册者
    pub fn register(&mut self, module: impl ToolModule + 'static) {
        let id = module.id().to_string();
        if self.modules.insert(id.clone(), Arc::new(module)).is_some() {
            tracing::warn!(module = %id, "module registered twice, keeping the latest");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToolModule>> {
        self.modules.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// (id, description) 列表
    pub fn describe(&self) -> Vec<(String, String)> {
        self.modules
            .iter()
            .map(|(id, m)| (id.clone(), m.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 由配置中全部 [modules.*] 构建目录
    pub fn from_config(cfg: &AppConfig) -> Self {
        let workspace = cfg.workspace();
        let mut catalog = Self::new();
        for (id, entry) in &cfg.modules {
            catalog.register(
                ConfiguredModule::new(id.clone(), entry.clone(), &workspace, cfg.tools.tool_timeout_secs)
                    .with_config_path(cfg.source_path.clone()),
            );
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config_from_str, ToolEntry};

    #[test]
    fn test_declaration_line() {
        let text = "[modules.git]\n\n[[modules.git.tools]]\nname = \"git_log\"\nprogram = \"git\"\n";
        assert_eq!(declaration_line(text, "git_log"), Some(4));
        assert_eq!(declaration_line(text, "git_status"), None);
    }

    #[tokio::test]
    async fn test_configured_module_missing_program_fails() {
        let entry = ModuleEntry {
            description: "broken".to_string(),
            tools: vec![ToolEntry {
                name: "vpn_up".to_string(),
                description: String::new(),
                kind: ToolKind::Command,
                program: Some("definitely-not-a-real-binary-xyz".to_string()),
                args: vec![],
                url: None,
                method: None,
                body: None,
                params: vec![],
                timeout_secs: None,
            }],
        };
        let module = ConfiguredModule::new("vpn", entry, Path::new("."), 5);
        let err = module.load().await.unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_catalog_from_config() {
        let cfg = load_config_from_str(
            r#"
[modules.gitlab]
description = "GitLab API"
[[modules.gitlab.tools]]
name = "gitlab_mr_list"
kind = "http"
url = "https://gitlab.example.com/api/v4/merge_requests"
"#,
        )
        .unwrap();
        let catalog = ModuleCatalog::from_config(&cfg);
        assert_eq!(catalog.ids(), vec!["gitlab".to_string()]);
        let ops = catalog.get("gitlab").unwrap().load().await.unwrap();
        assert_eq!(ops[0].name(), "gitlab_mr_list");
        assert_eq!(ops[0].module(), "gitlab");
        assert_eq!(ops[0].source().file, "<config>");
    }
}
