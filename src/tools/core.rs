//! 核心工具：启动时注册，任何人格切换都不会卸载
//!
//! 人格切换、工具 / 技能列表、技能运行、记忆读写与经验学习都通过这些工具暴露给客户端。
//! 工具持有 `Weak<Runtime>`，避免注册表与运行时之间的引用环。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::ParamEntry;
use crate::core::recovery::RemediationRule;
use crate::core::runtime::Runtime;
use crate::tools::registry::{Operation, Tool};
use crate::tools::schema::{missing_required, schema_from_params};

/// 核心工具名；配置 `[registry].core_tools` 可取其子集
pub const CORE_TOOL_NAMES: &[&str] = &[
    "persona_list",
    "persona_load",
    "tool_list",
    "skill_list",
    "skill_run",
    "memory_read",
    "memory_write",
    "learn_pattern",
];

pub const CORE_MODULE: &str = "core";

fn param(name: &str, param_type: &str, required: bool, description: &str) -> ParamEntry {
    ParamEntry {
        name: name.to_string(),
        description: description.to_string(),
        param_type: param_type.to_string(),
        required,
    }
}

fn upgrade(runtime: &Weak<Runtime>) -> Result<Arc<Runtime>, String> {
    runtime.upgrade().ok_or_else(|| "runtime is shutting down".to_string())
}

fn check_args(params: &[ParamEntry], args: &Value) -> Result<(), String> {
    let missing = missing_required(params, args);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("Missing required argument(s): {}", missing.join(", ")))
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}

/// 生成全部核心工具
pub fn core_operations(runtime: &Arc<Runtime>) -> Vec<Operation> {
    let weak = Arc::downgrade(runtime);
    vec![
        Operation::new(CORE_MODULE, PersonaListTool { runtime: weak.clone() }),
        Operation::new(CORE_MODULE, PersonaLoadTool::new(weak.clone())),
        Operation::new(CORE_MODULE, ToolListTool { runtime: weak.clone() }),
        Operation::new(CORE_MODULE, SkillListTool { runtime: weak.clone() }),
        Operation::new(CORE_MODULE, SkillRunTool::new(weak.clone())),
        Operation::new(CORE_MODULE, MemoryReadTool::new(weak.clone())),
        Operation::new(CORE_MODULE, MemoryWriteTool::new(weak.clone())),
        Operation::new(CORE_MODULE, LearnPatternTool::new(weak)),
    ]
}

/// 列出人格，标出当前人格
pub struct PersonaListTool {
    runtime: Weak<Runtime>,
}

#[async_trait]
impl Tool for PersonaListTool {
    fn name(&self) -> &str {
        "persona_list"
    }

    fn description(&self) -> &str {
        "List available personas and the modules each one loads."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let rt = upgrade(&self.runtime)?;
        let current = rt.personas().current().await;
        let profiles = rt.personas().list().await.map_err(|e| e.to_string())?;
        let list: Vec<Value> = profiles
            .into_iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "description": p.description,
                    "modules": p.modules,
                    "skills": p.skills,
                    "active": current.as_deref() == Some(p.name.as_str()),
                })
            })
            .collect();
        pretty(&list)
    }
}

/// 切换人格
pub struct PersonaLoadTool {
    runtime: Weak<Runtime>,
    params: Vec<ParamEntry>,
}

impl PersonaLoadTool {
    fn new(runtime: Weak<Runtime>) -> Self {
        Self {
            runtime,
            params: vec![param("name", "string", true, "Persona to activate")],
        }
    }
}

#[async_trait]
impl Tool for PersonaLoadTool {
    fn name(&self) -> &str {
        "persona_load"
    }

    fn description(&self) -> &str {
        "Switch the active persona. Unloads all non-core tools and loads the persona's modules; on any module error the previous tool set is kept."
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        check_args(&self.params, &args)?;
        let name = str_arg(&args, "name").unwrap_or_default();
        let rt = upgrade(&self.runtime)?;
        let report = rt.personas().switch(name).await.map_err(|e| e.to_string())?;
        Ok(format!(
            "Persona '{}' active: {} tools from modules [{}]",
            name,
            report.loaded_tools,
            report.loaded_modules.join(", ")
        ))
    }
}

/// 列出当前工具集
pub struct ToolListTool {
    runtime: Weak<Runtime>,
}

#[async_trait]
impl Tool for ToolListTool {
    fn name(&self) -> &str {
        "tool_list"
    }

    fn description(&self) -> &str {
        "List the currently callable tools with their module and source location."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let rt = upgrade(&self.runtime)?;
        let list: Vec<Value> = rt
            .registry()
            .descriptors()
            .await
            .into_iter()
            .map(|d| json!({ "name": d.name, "module": d.module, "source": d.source, "description": d.description }))
            .collect();
        pretty(&list)
    }
}

/// 列出当前人格可用的技能
pub struct SkillListTool {
    runtime: Weak<Runtime>,
}

#[async_trait]
impl Tool for SkillListTool {
    fn name(&self) -> &str {
        "skill_list"
    }

    fn description(&self) -> &str {
        "List skills available under the active persona."
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let rt = upgrade(&self.runtime)?;
        pretty(&rt.list_skills().await)
    }
}

/// 运行技能，返回运行记录
pub struct SkillRunTool {
    runtime: Weak<Runtime>,
    params: Vec<ParamEntry>,
}

impl SkillRunTool {
    fn new(runtime: Weak<Runtime>) -> Self {
        Self {
            runtime,
            params: vec![
                param("name", "string", true, "Skill name"),
                param("inputs", "object", false, "Skill inputs"),
            ],
        }
    }
}

#[async_trait]
impl Tool for SkillRunTool {
    fn name(&self) -> &str {
        "skill_run"
    }

    fn description(&self) -> &str {
        "Run a skill (declarative workflow) with the given inputs and return the run record."
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        check_args(&self.params, &args)?;
        let name = str_arg(&args, "name").unwrap_or_default();
        let inputs = match args.get("inputs") {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(_) => return Err("'inputs' must be an object".to_string()),
        };
        let rt = upgrade(&self.runtime)?;
        rt.ensure_skill_available(name).await.map_err(|e| e.to_string())?;
        let run = rt
            .run_skill(name, inputs, &rt.shutdown().run_token())
            .await
            .map_err(|e| e.to_string())?;
        let body = pretty(&run)?;
        if run.status.is_success() {
            Ok(body)
        } else {
            Err(format!("{}\n{}", run.summary(), body))
        }
    }
}

/// 读取记忆文档
pub struct MemoryReadTool {
    runtime: Weak<Runtime>,
    params: Vec<ParamEntry>,
}

impl MemoryReadTool {
    fn new(runtime: Weak<Runtime>) -> Self {
        Self {
            runtime,
            params: vec![param("key", "string", true, "Document key, e.g. state/current_work")],
        }
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory_read"
    }

    fn description(&self) -> &str {
        "Read a memory document (state/... or learned/...)."
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        check_args(&self.params, &args)?;
        let key = str_arg(&args, "key").unwrap_or_default();
        let rt = upgrade(&self.runtime)?;
        let doc = rt.memory().load(key).await.map_err(|e| e.to_string())?;
        pretty(&doc.unwrap_or(Value::Null))
    }
}

/// 写记忆文档：replace 覆盖、merge 合并对象字段、append 追加到数组
pub struct MemoryWriteTool {
    runtime: Weak<Runtime>,
    params: Vec<ParamEntry>,
}

impl MemoryWriteTool {
    fn new(runtime: Weak<Runtime>) -> Self {
        Self {
            runtime,
            params: vec![
                param("key", "string", true, "Document key"),
                param("value", "object", true, "Value to write"),
                param("mode", "string", false, "replace (default), merge or append"),
            ],
        }
    }
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Write a memory document. mode: replace, merge (object fields) or append (list entry)."
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        check_args(&self.params, &args)?;
        let key = str_arg(&args, "key").unwrap_or_default();
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        let rt = upgrade(&self.runtime)?;
        let memory = rt.memory();
        let result = match str_arg(&args, "mode").unwrap_or("replace") {
            "replace" => memory.save(key, &value).await,
            "append" => memory.append(key, value, None).await,
            "merge" => {
                let Value::Object(patch) = value else {
                    return Err("merge requires an object value".to_string());
                };
                memory
                    .update(key, move |doc| {
                        let mut obj = match doc {
                            Some(Value::Object(obj)) => obj,
                            _ => Map::new(),
                        };
                        obj.extend(patch);
                        Value::Object(obj)
                    })
                    .await
                    .map(|_| ())
            }
            other => return Err(format!("unknown mode '{}'", other)),
        };
        result.map_err(|e| e.to_string())?;
        Ok(format!("Saved {}", key))
    }
}

/// 运维人员确认修复方法后，记录为新的恢复规则
pub struct LearnPatternTool {
    runtime: Weak<Runtime>,
    params: Vec<ParamEntry>,
}

impl LearnPatternTool {
    fn new(runtime: Weak<Runtime>) -> Self {
        Self {
            runtime,
            params: vec![
                param("class", "string", true, "Error class, e.g. authentication"),
                param("pattern", "string", true, "Substring (or regex) matched against error text"),
                param("tool", "string", true, "Remediation tool to run"),
                param("args", "object", false, "Arguments for the remediation tool"),
                param("scope", "string", false, "Module the rule applies to"),
                param("regex", "boolean", false, "Treat pattern as a regular expression"),
            ],
        }
    }
}

#[async_trait]
impl Tool for LearnPatternTool {
    fn name(&self) -> &str {
        "learn_pattern"
    }

    fn description(&self) -> &str {
        "Record a confirmed fix as a recovery rule. Takes effect immediately for all tools."
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        check_args(&self.params, &args)?;
        let mut rule = RemediationRule::new(
            str_arg(&args, "class").unwrap_or_default(),
            str_arg(&args, "pattern").unwrap_or_default(),
            str_arg(&args, "tool").unwrap_or_default(),
        );
        rule.action.args = args.get("args").cloned().unwrap_or(Value::Null);
        if let Some(scope) = str_arg(&args, "scope") {
            rule = rule.with_scope(scope);
        }
        if args.get("regex").and_then(Value::as_bool).unwrap_or(false) {
            rule = rule.with_regex();
        }
        let rt = upgrade(&self.runtime)?;
        rt.recovery().learn(rule.clone()).await.map_err(|e| e.to_string())?;
        Ok(format!(
            "Learned: [{}] '{}' -> {}",
            rule.class, rule.pattern, rule.action.tool
        ))
    }
}
