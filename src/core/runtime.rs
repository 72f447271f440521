//! 运行时装配
//!
//! 记忆 → 恢复引擎 → 注册表（模块工具经恢复中间件包装）→ 人格加载器 → 技能加载 / 运行 → 核心工具。
//! 补救动作通过注册表按名调用，注册表又持有恢复引擎，因此补救执行者只持有注册表的弱引用。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::HiveError;
use crate::core::recovery::{RecoveryEngine, ToolRemediator};
use crate::core::shutdown::ShutdownManager;
use crate::memory::{FileMemoryStore, Memory};
use crate::persona::{CapabilitySource, ConfigCapabilities, PersonaLoader};
use crate::scheduler::{CronError, DefaultSink, JobRunner, Scheduler, ToolPollEvaluator};
use crate::skills::{SkillLoader, SkillSummary};
use crate::tools::core::core_operations;
use crate::tools::executor::ToolExecutor;
use crate::tools::registry::ToolRegistry;
use crate::workflow::{SkillRunner, WorkflowError, WorkflowRun};

pub struct Runtime {
    config: AppConfig,
    memory: Arc<Memory>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    personas: PersonaLoader,
    skills: SkillLoader,
    runner: SkillRunner,
    shutdown: Arc<ShutdownManager>,
}

impl Runtime {
    /// 按配置装配：文件记忆、每次切换重读配置文件的人格来源
    pub async fn from_config(config: AppConfig) -> Result<Arc<Self>, HiveError> {
        let memory = Arc::new(Memory::new(Arc::new(FileMemoryStore::new(config.memory_dir()))));
        let source = Arc::new(ConfigCapabilities::new(config.source_path.clone()));
        Self::build(config, source, memory).await
    }

    pub async fn build(
        config: AppConfig,
        capabilities: Arc<dyn CapabilitySource>,
        memory: Arc<Memory>,
    ) -> Result<Arc<Self>, HiveError> {
        let rules = config.recovery.rules.clone();
        let max_records = config.recovery.max_failure_records;
        let make_engine = |registry: Weak<ToolRegistry>| {
            RecoveryEngine::new(memory.clone(), rules.clone(), Arc::new(ToolRemediator::new(registry)))
                .with_max_failure_records(max_records)
        };

        let (registry, recovery) = if config.recovery.enabled {
            let mut engine = None;
            let registry = Arc::new_cyclic(|weak: &Weak<ToolRegistry>| {
                let e = make_engine(weak.clone());
                engine = Some(e.clone());
                ToolRegistry::with_middleware(Arc::new(e))
            });
            let engine = engine.ok_or_else(|| HiveError::Config("recovery engine not initialised".to_string()))?;
            (registry, engine)
        } else {
            tracing::info!("recovery middleware disabled");
            let registry = Arc::new(ToolRegistry::new());
            let engine = make_engine(Arc::downgrade(&registry));
            (registry, engine)
        };

        let executor = ToolExecutor::new(registry.clone());
        let runner = SkillRunner::new(executor.clone(), memory.clone())
            .with_history_limit(config.app.run_history_limit);
        let runtime = Arc::new(Self {
            personas: PersonaLoader::new(registry.clone(), capabilities),
            skills: SkillLoader::new(config.skills_dir()),
            config,
            memory,
            registry,
            executor,
            recovery,
            runner,
            shutdown: Arc::new(ShutdownManager::new()),
        });

        let enabled = &runtime.config.registry.core_tools;
        for op in core_operations(&runtime) {
            if enabled.iter().any(|n| n == op.name()) {
                runtime.registry.register_core(op).await?;
            }
        }
        tracing::info!(
            core_tools = runtime.registry.core_names().await.len(),
            skills_dir = %runtime.skills.skills_dir().display(),
            "runtime ready"
        );
        Ok(runtime)
    }

    /// 加载默认人格（若配置了）
    pub async fn activate_default_persona(&self) -> Result<Option<String>, HiveError> {
        let Some(name) = self.config.app.default_persona.clone() else {
            return Ok(None);
        };
        self.personas.switch(&name).await?;
        Ok(Some(name))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn personas(&self) -> &PersonaLoader {
        &self.personas
    }

    pub fn skills(&self) -> &SkillLoader {
        &self.skills
    }

    /// 进程级关闭信号；技能运行从这里派生取消 token
    pub fn shutdown(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 当前人格可用的技能；人格未声明技能时列出全部
    pub async fn list_skills(&self) -> Vec<SkillSummary> {
        let all = self.skills.list().await;
        match self.personas.available_skills().await {
            Some(allowed) if !allowed.is_empty() => {
                all.into_iter().filter(|s| allowed.contains(&s.name)).collect()
            }
            _ => all,
        }
    }

    pub async fn ensure_skill_available(&self, name: &str) -> Result<(), WorkflowError> {
        match self.personas.available_skills().await {
            Some(allowed) if !allowed.is_empty() && !allowed.iter().any(|s| s == name) => {
                Err(WorkflowError::NotAvailable(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// 读取技能定义（每次重新读取文件）并运行
    pub async fn run_skill(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        let skill = self.skills.load(name).await?;
        Ok(self.runner.run(&skill, inputs, cancel).await)
    }

    /// 按配置构建调度器
    pub fn scheduler(self: &Arc<Self>) -> Result<Scheduler, CronError> {
        let scheduler = Scheduler::new(
            &self.config.scheduler,
            self.clone(),
            Arc::new(ToolPollEvaluator::new(self.executor.clone())),
            Arc::new(DefaultSink::new(self.memory.clone())),
        )?;
        Ok(scheduler.with_memory(self.memory.clone()))
    }
}

#[async_trait]
impl JobRunner for Runtime {
    async fn run_job(
        &self,
        skill: &str,
        inputs: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.run_skill(skill, inputs, cancel).await
    }
}
