//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__TICK_SECS=30`）。
//! 人格（personas）在每次切换时重新读取，因此修改配置文件后无需重启即可生效。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::recovery::RemediationRule;
use crate::scheduler::job::{NotifyTarget, PollCondition, ScheduledJob};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub registry: RegistrySection,
    pub tools: ToolsSection,
    /// [modules.<id>]：工具模块
    pub modules: BTreeMap<String, ModuleEntry>,
    /// [personas.<name>]：人格 = 模块列表 + 可用技能
    pub personas: BTreeMap<String, PersonaEntry>,
    pub recovery: RecoverySection,
    pub scheduler: SchedulerSection,
    /// 实际读取的配置文件（不参与反序列化）
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// [app] 段：工作目录、记忆目录、技能目录、启动人格
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工作根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 记忆目录，未设置时用 <workspace>/memory
    pub memory_dir: Option<PathBuf>,
    /// 技能定义目录，未设置时按 config/skills、../config/skills 查找
    pub skills_dir: Option<PathBuf>,
    /// 启动时加载的人格
    pub default_persona: Option<String>,
    /// 技能运行历史保留条数
    pub run_history_limit: usize,
    /// 退出时每个清理任务的超时（秒）
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: None,
            memory_dir: None,
            skills_dir: None,
            default_persona: None,
            run_history_limit: 100,
            shutdown_timeout_secs: 5,
        }
    }
}

/// [registry] 段：暴露给客户端的核心工具（任何人格下都保留）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub core_tools: Vec<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            core_tools: crate::tools::core::CORE_TOOL_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// [tools] 段：外部命令 / HTTP 调用的默认超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [modules.<id>] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModuleEntry {
    pub description: String,
    pub tools: Vec<ToolEntry>,
}

/// 工具实现方式
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// 执行外部程序（program + args 模板）
    #[default]
    Command,
    /// 调用 HTTP API（url 模板）
    Http,
}

/// [[modules.<id>.tools]]：一个外部操作
#[derive(Debug, Clone, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ToolKind,
    /// command：程序名或路径
    #[serde(default)]
    pub program: Option<String>,
    /// command：参数模板，{{key}} 取自调用参数，{{workspace}} 为工作目录
    #[serde(default)]
    pub args: Vec<String>,
    /// http：URL 模板
    #[serde(default)]
    pub url: Option<String>,
    /// http：方法，默认 GET
    #[serde(default)]
    pub method: Option<String>,
    /// http：请求体模板（JSON）
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// 参数声明（生成 JSON Schema）
    #[serde(default)]
    pub params: Vec<ParamEntry>,
    /// 覆盖 [tools].tool_timeout_secs
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// 工具参数声明
#[derive(Debug, Clone, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_param_type", rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
}

fn default_param_type() -> String {
    "string".to_string()
}

/// [personas.<name>] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PersonaEntry {
    pub description: String,
    /// 按顺序加载的模块 id
    pub modules: Vec<String>,
    /// 该人格下可用的技能名
    pub skills: Vec<String>,
}

/// [recovery] 段：静态恢复规则与故障记录保留数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub enabled: bool,
    pub rules: Vec<RemediationRule>,
    /// learned/failures 保留的最大条数
    pub max_failure_records: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            max_failure_records: 500,
        }
    }
}

/// [scheduler] 段：tick 间隔、时区、任务、轮询条件、通知目标
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    /// tick 间隔（秒）；时间触发的分辨率为分钟，默认 60
    pub tick_secs: u64,
    /// "UTC"、"local" 或固定偏移如 "+08:00"
    pub timezone: String,
    pub jobs: Vec<ScheduledJob>,
    pub conditions: BTreeMap<String, PollCondition>,
    pub notify: BTreeMap<String, NotifyTarget>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
            timezone: "UTC".to_string(),
            jobs: Vec::new(),
            conditions: BTreeMap::new(),
            notify: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// 工作目录：配置值或 ./workspace
    pub fn workspace(&self) -> PathBuf {
        self.app.workspace_root.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("workspace")
        })
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.app
            .memory_dir
            .clone()
            .unwrap_or_else(|| self.workspace().join("memory"))
    }

    pub fn skills_dir(&self) -> PathBuf {
        if let Some(dir) = &self.app.skills_dir {
            return dir.clone();
        }
        [PathBuf::from("config/skills"), PathBuf::from("../config/skills")]
            .into_iter()
            .find(|d| d.exists())
            .unwrap_or_else(|| PathBuf::from("config/skills"))
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();
    let mut source_path = None;

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            source_path = Some(PathBuf::from(path));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
            source_path = Some(path.to_path_buf());
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    cfg.source_path = source_path;
    Ok(cfg)
}

/// 只从给定的 TOML 文本加载（测试与内嵌配置）
pub fn load_config_from_str(toml_text: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from_str(toml_text, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
}
