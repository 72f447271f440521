//! 集成测试共用的工具与运行时构造

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use hive::config::load_config_from_str;
use hive::memory::Memory;
use hive::persona::{Capabilities, StaticCapabilities};
use hive::tools::{Operation, StaticModule, Tool, ToolModule};
use hive::Runtime;

/// 按顺序返回预设结果，用尽后重复最后一个；记录调用次数
pub struct ScriptedTool {
    name: String,
    results: Mutex<Vec<Result<String, String>>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedTool {
    pub fn new(name: &str, results: Vec<Result<&str, &str>>) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(
                results
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ok(name: &str, output: &str) -> Self {
        Self::new(name, vec![Ok(output)])
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().unwrap();
        if results.len() > 1 {
            results.remove(0)
        } else {
            results[0].clone()
        }
    }
}

/// 加载总是失败的模块
pub struct BrokenModule(pub &'static str);

#[async_trait]
impl ToolModule for BrokenModule {
    fn id(&self) -> &str {
        self.0
    }

    async fn load(&self) -> Result<Vec<Operation>, String> {
        Err("program 'missing-cli' not found".to_string())
    }
}

pub fn module(id: &str, tools: Vec<ScriptedTool>) -> StaticModule {
    StaticModule::new(id, tools.into_iter().map(|t| Operation::new(id, t)).collect())
}

/// 以 TOML 配置 + 代码构造的模块装配运行时（记忆在内存中）
pub async fn runtime_with(
    toml_text: &str,
    modules: Vec<StaticModule>,
    broken: Vec<&'static str>,
) -> (Arc<Runtime>, Arc<Memory>) {
    let config = load_config_from_str(toml_text).unwrap();
    let mut caps = Capabilities::from_config(&config);
    for m in modules {
        caps.catalog.register(m);
    }
    for id in broken {
        caps.catalog.register(BrokenModule(id));
    }
    let memory = Arc::new(Memory::in_memory());
    let runtime = Runtime::build(config, Arc::new(StaticCapabilities(caps)), memory.clone())
        .await
        .unwrap();
    (runtime, memory)
}
