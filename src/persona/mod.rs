//! 人格（Capability Profile）切换
//!
//! 人格 = 名称 + 描述 + 有序模块列表 + 可用技能。切换时重新读取能力来源（配置文件），
//! 因此新增人格或模块无需重启；注册表在同一个写锁内完成「卸载 + 加载」，
//! 成功后广播 [`CapabilityEvent::ToolsChanged`]，协议服务据此通知客户端刷新工具列表。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::{load_config, AppConfig};
use crate::core::error::HiveError;
use crate::tools::module::ModuleCatalog;
use crate::tools::registry::{LoadReport, RegistryError, ToolRegistry};

/// 人格档案
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PersonaProfile {
    pub name: String,
    pub description: String,
    pub modules: Vec<String>,
    pub skills: Vec<String>,
}

/// 能力变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    ToolsChanged { persona: String, tools: Vec<String> },
}

/// 一次读取得到的人格与模块
#[derive(Clone, Default)]
pub struct Capabilities {
    pub profiles: BTreeMap<String, PersonaProfile>,
    pub catalog: ModuleCatalog,
}

impl Capabilities {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let profiles = cfg
            .personas
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PersonaProfile {
                        name: name.clone(),
                        description: p.description.clone(),
                        modules: p.modules.clone(),
                        skills: p.skills.clone(),
                    },
                )
            })
            .collect();
        Self {
            profiles,
            catalog: ModuleCatalog::from_config(cfg),
        }
    }
}

/// 能力来源：每次切换都会调用 load，以便热更新
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn load(&self) -> Result<Capabilities, String>;
}

/// 固定能力（代码构造，测试用）
pub struct StaticCapabilities(pub Capabilities);

#[async_trait]
impl CapabilitySource for StaticCapabilities {
    async fn load(&self) -> Result<Capabilities, String> {
        Ok(self.0.clone())
    }
}

/// 每次切换重新读取配置文件
pub struct ConfigCapabilities {
    path: Option<PathBuf>,
}

impl ConfigCapabilities {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CapabilitySource for ConfigCapabilities {
    async fn load(&self) -> Result<Capabilities, String> {
        let cfg = load_config(self.path.as_deref()).map_err(|e| e.to_string())?;
        Ok(Capabilities::from_config(&cfg))
    }
}

/// 人格加载器：持有注册表与能力来源，串行化所有切换
pub struct PersonaLoader {
    registry: Arc<ToolRegistry>,
    source: Arc<dyn CapabilitySource>,
    current: RwLock<Option<PersonaProfile>>,
    events: broadcast::Sender<CapabilityEvent>,
    switching: Mutex<()>,
}

impl PersonaLoader {
    pub fn new(registry: Arc<ToolRegistry>, source: Arc<dyn CapabilitySource>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            registry,
            source,
            current: RwLock::new(None),
            events,
            switching: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.events.subscribe()
    }

    /// 切换到指定人格；失败时注册表保持切换前的内容
    pub async fn switch(&self, name: &str) -> Result<LoadReport, HiveError> {
        let _guard = self.switching.lock().await;
        let caps = self.source.load().await.map_err(HiveError::Config)?;
        let profile = caps
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPersona(name.to_string()))?;

        let report = self
            .registry
            .switch(&caps.catalog, &profile.modules)
            .await
            .map_err(|errors| {
                tracing::warn!(persona = %name, errors = errors.len(), "persona switch rolled back");
                HiveError::SwitchFailed {
                    persona: name.to_string(),
                    errors: errors.iter().map(|e| e.to_string()).collect(),
                }
            })?;

        *self.current.write().await = Some(profile);
        let tools = self.registry.tool_names().await;
        tracing::info!(persona = %name, tools = tools.len(), modules = ?report.loaded_modules, "persona switched");
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.events.send(CapabilityEvent::ToolsChanged {
            persona: name.to_string(),
            tools,
        });
        Ok(report)
    }

    pub async fn current(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|p| p.name.clone())
    }

    /// 当前人格可用的技能；未加载人格时返回 None（不过滤）
    pub async fn available_skills(&self) -> Option<Vec<String>> {
        self.current.read().await.as_ref().map(|p| p.skills.clone())
    }

    /// 列出所有人格（重新读取来源）
    pub async fn list(&self) -> Result<Vec<PersonaProfile>, HiveError> {
        let caps = self.source.load().await.map_err(HiveError::Config)?;
        Ok(caps.profiles.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::module::StaticModule;
    use crate::tools::registry::{Operation, Tool};
    use serde_json::Value;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            ""
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(String::new())
        }
    }

    fn profile(name: &str, modules: &[&str]) -> PersonaProfile {
        PersonaProfile {
            name: name.to_string(),
            description: String::new(),
            modules: modules.iter().map(|s| s.to_string()).collect(),
            skills: vec![format!("{}_skill", name)],
        }
    }

    fn loader() -> (PersonaLoader, Arc<ToolRegistry>) {
        let mut catalog = ModuleCatalog::new();
        catalog.register(StaticModule::new("git", vec![Operation::new("git", Named("git_log"))]));
        catalog.register(StaticModule::new("k8s", vec![Operation::new("k8s", Named("kube_pods"))]));
        let mut profiles = BTreeMap::new();
        profiles.insert("developer".to_string(), profile("developer", &["git"]));
        profiles.insert("ops".to_string(), profile("ops", &["k8s"]));
        profiles.insert("broken".to_string(), profile("broken", &["k8s", "missing"]));
        let registry = Arc::new(ToolRegistry::new());
        let loader = PersonaLoader::new(
            registry.clone(),
            Arc::new(StaticCapabilities(Capabilities { profiles, catalog })),
        );
        (loader, registry)
    }

    #[tokio::test]
    async fn test_switch_emits_event_and_tracks_current() {
        let (loader, registry) = loader();
        let mut rx = loader.subscribe();
        loader.switch("developer").await.unwrap();
        assert_eq!(loader.current().await.as_deref(), Some("developer"));
        assert_eq!(registry.tool_names().await, vec!["git_log".to_string()]);
        match rx.recv().await.unwrap() {
            CapabilityEvent::ToolsChanged { persona, tools } => {
                assert_eq!(persona, "developer");
                assert_eq!(tools, vec!["git_log".to_string()]);
            }
        }
        assert_eq!(loader.available_skills().await, Some(vec!["developer_skill".to_string()]));
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_previous_persona() {
        let (loader, registry) = loader();
        loader.switch("developer").await.unwrap();
        let err = loader.switch("broken").await.unwrap_err();
        assert!(matches!(err, HiveError::SwitchFailed { .. }));
        assert_eq!(loader.current().await.as_deref(), Some("developer"));
        assert_eq!(registry.tool_names().await, vec!["git_log".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_persona() {
        let (loader, registry) = loader();
        let err = loader.switch("nobody").await.unwrap_err();
        assert!(err.to_string().contains("Unknown persona: nobody"));
        assert!(registry.tool_names().await.is_empty());
        assert_eq!(loader.list().await.unwrap().len(), 3);
    }
}
