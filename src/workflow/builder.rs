//! 技能构建器
//!
//! `SkillDefinition::compile` 把 TOML 声明编译为 [`Skill`]：解析参数模板与守卫，
//! 校验步骤名唯一、步骤引用只指向前面的步骤。`SkillBuilder` 提供流畅 API，便于在代码中定义技能。

use std::collections::HashSet;

use serde_json::Value;

use crate::workflow::condition::Guard;
use crate::workflow::template::{ParamTemplate, StepRef};
use crate::workflow::types::*;

impl SkillDefinition {
    pub fn compile(&self) -> Result<Skill, WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidDefinition {
            skill: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is required".to_string()));
        }

        let mut seen_inputs = HashSet::new();
        for input in &self.inputs {
            if !seen_inputs.insert(input.name.as_str()) {
                return Err(invalid(format!("duplicate input '{}'", input.name)));
            }
        }

        let mut names: Vec<&str> = Vec::with_capacity(self.steps.len());
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, def) in self.steps.iter().enumerate() {
            if def.name.trim().is_empty() || def.tool.trim().is_empty() {
                return Err(invalid(format!("step {} needs a name and a tool", index)));
            }
            if names.contains(&def.name.as_str()) {
                return Err(invalid(format!("duplicate step '{}'", def.name)));
            }

            let params = ParamTemplate::parse(&def.args)
                .map_err(|e| invalid(format!("step '{}': {}", def.name, e)))?;
            let guard = def
                .when
                .as_deref()
                .map(Guard::parse)
                .transpose()
                .map_err(|e| invalid(format!("step '{}' guard: {}", def.name, e)))?;
            let fallback = match &def.fallback {
                Some(fb) => Some(Fallback {
                    tool: fb.tool.clone(),
                    params: ParamTemplate::parse(&fb.args)
                        .map_err(|e| invalid(format!("step '{}' fallback: {}", def.name, e)))?,
                }),
                None => None,
            };

            let mut templates: Vec<&ParamTemplate> = vec![&params];
            if let Some(g) = &guard {
                templates.extend(g.templates());
            }
            if let Some(fb) = &fallback {
                templates.push(&fb.params);
            }
            for r in templates.iter().flat_map(|t| t.step_refs()) {
                let earlier = match r {
                    StepRef::Name(n) => names.contains(&n.as_str()),
                    StepRef::Index(i) => *i < index,
                };
                if !earlier {
                    return Err(invalid(format!(
                        "step '{}' references step '{}' which does not run before it",
                        def.name, r
                    )));
                }
            }

            names.push(def.name.as_str());
            steps.push(Step {
                name: def.name.clone(),
                tool: def.tool.clone(),
                params,
                guard,
                on_failure: def.on_failure,
                fallback,
            });
        }

        Ok(Skill {
            name: self.name.clone(),
            description: self.description.clone(),
            inputs: self.inputs.clone(),
            steps,
        })
    }
}

/// 技能构建器
pub struct SkillBuilder {
    def: SkillDefinition,
}

impl SkillBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: SkillDefinition {
                name: name.into(),
                description: String::new(),
                inputs: Vec::new(),
                steps: Vec::new(),
            },
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.def.description = desc.into();
        self
    }

    /// 声明输入
    pub fn input(mut self, name: impl Into<String>, required: bool, default: Option<Value>) -> Self {
        self.def.inputs.push(SkillInput {
            name: name.into(),
            description: String::new(),
            required,
            default,
        });
        self
    }

    /// 追加步骤（失败策略默认 abort）
    pub fn step(mut self, name: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        self.def.steps.push(StepDefinition {
            name: name.into(),
            tool: tool.into(),
            args,
            when: None,
            on_failure: OnFailure::default(),
            fallback: None,
        });
        self
    }

    /// 设置最后一个步骤的失败策略
    pub fn on_failure(mut self, policy: OnFailure) -> Self {
        if let Some(step) = self.def.steps.last_mut() {
            step.on_failure = policy;
        }
        self
    }

    /// 设置最后一个步骤的守卫
    pub fn when(mut self, guard: impl Into<String>) -> Self {
        if let Some(step) = self.def.steps.last_mut() {
            step.when = Some(guard.into());
        }
        self
    }

    /// 设置最后一个步骤的备用操作
    pub fn fallback(mut self, tool: impl Into<String>, args: Value) -> Self {
        if let Some(step) = self.def.steps.last_mut() {
            step.fallback = Some(FallbackDefinition {
                tool: tool.into(),
                args,
            });
        }
        self
    }

    pub fn build(self) -> Result<Skill, WorkflowError> {
        self.def.compile()
    }
}
