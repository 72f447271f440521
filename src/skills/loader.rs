//! 技能加载器
//!
//! 从技能目录读取 TOML 定义：`<dir>/<name>.toml` 或 `<dir>/<name>/skill.toml`。
//! 每次运行前重新读取文件，修改技能无需重启；代码中注册的技能优先于文件。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::workflow::types::{Skill, SkillDefinition, SkillInput, WorkflowError};

/// 技能列表项
#[derive(Debug, Clone, Serialize)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
    pub inputs: Vec<SkillInput>,
    pub steps: usize,
}

impl From<&Skill> for SkillSummary {
    fn from(skill: &Skill) -> Self {
        Self {
            name: skill.name.clone(),
            description: skill.description.clone(),
            inputs: skill.inputs.clone(),
            steps: skill.steps.len(),
        }
    }
}

/// 技能加载器
pub struct SkillLoader {
    skills_dir: PathBuf,
    registered: RwLock<HashMap<String, Skill>>,
}

impl SkillLoader {
    pub fn new(skills_dir: impl AsRef<Path>) -> Self {
        Self {
            skills_dir: skills_dir.as_ref().to_path_buf(),
            registered: RwLock::new(HashMap::new()),
        }
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// 注册代码中构建的技能
    pub async fn register(&self, skill: Skill) {
        self.registered.write().await.insert(skill.name.clone(), skill);
    }

    fn candidate_paths(&self, name: &str) -> [PathBuf; 2] {
        [
            self.skills_dir.join(format!("{}.toml", name)),
            self.skills_dir.join(name).join("skill.toml"),
        ]
    }

    /// 按名加载并编译技能
    pub async fn load(&self, name: &str) -> Result<Skill, WorkflowError> {
        if let Some(skill) = self.registered.read().await.get(name) {
            return Ok(skill.clone());
        }
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(WorkflowError::SkillNotFound(name.to_string()));
        }

        for path in self.candidate_paths(name) {
            if path.is_file() {
                let skill = parse_skill_file(&path).await?;
                if skill.name != name {
                    tracing::warn!(file = %path.display(), declared = %skill.name, "skill name differs from file name");
                }
                return Ok(skill);
            }
        }
        Err(WorkflowError::SkillNotFound(name.to_string()))
    }

    /// 列出全部技能；无法解析的文件记录告警后跳过
    pub async fn list(&self) -> Vec<SkillSummary> {
        let mut out: HashMap<String, SkillSummary> = self
            .registered
            .read()
            .await
            .values()
            .map(|s| (s.name.clone(), SkillSummary::from(s)))
            .collect();

        let mut entries = match tokio::fs::read_dir(&self.skills_dir).await {
            Ok(entries) => entries,
            Err(_) => return sorted(out),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let file = if path.is_dir() {
                path.join("skill.toml")
            } else if path.extension().map(|e| e == "toml").unwrap_or(false) {
                path
            } else {
                continue;
            };
            if !file.is_file() {
                continue;
            }
            match parse_skill_file(&file).await {
                Ok(skill) => {
                    out.entry(skill.name.clone()).or_insert_with(|| SkillSummary::from(&skill));
                }
                Err(e) => tracing::warn!(file = %file.display(), "skipping skill: {}", e),
            }
        }
        sorted(out)
    }
}

fn sorted(map: HashMap<String, SkillSummary>) -> Vec<SkillSummary> {
    let mut list: Vec<_> = map.into_values().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    list
}

/// `<name>.toml` 取文件名，`<name>/skill.toml` 取目录名
fn skill_name_from_path(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if stem == "skill" {
        if let Some(dir) = path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
            return dir.to_string();
        }
    }
    stem.to_string()
}

async fn parse_skill_file(path: &Path) -> Result<Skill, WorkflowError> {
    let stem = skill_name_from_path(path);
    let load_err = |reason: String| WorkflowError::Load {
        skill: stem.clone(),
        reason,
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| load_err(e.to_string()))?;
    let mut def: SkillDefinition = toml::from_str(&text).map_err(|e| load_err(e.to_string()))?;
    if def.name.is_empty() {
        def.name = stem.clone();
    }
    def.compile()
}
