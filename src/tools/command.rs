//! 命令工具：运行「程序 + 参数模板」，把外部 CLI（git、kubectl、glab ...）暴露为操作
//!
//! 参数模板中 {{workspace}} 替换为工作目录，{{key}} 从调用参数取 key；
//! 引用了未提供的可选参数的模板项整体省略。执行时无 shell，直接 exec，带超时。
//! 非零退出码时把 stderr 作为错误文本返回，供恢复中间件分类。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::{ParamEntry, ToolEntry};
use crate::tools::registry::Tool;
use crate::tools::schema::{missing_required, schema_from_params};

/// 渲染模板：替换所有 {{key}}；引用了缺失参数时返回缺失的 key
pub(crate) fn render(template: &str, args: &Value, workspace: &Path) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = after[..end].trim();
        if key == "workspace" {
            out.push_str(&workspace.to_string_lossy());
        } else {
            match args.get(key) {
                None | Some(Value::Null) => return Err(key.to_string()),
                Some(Value::String(s)) => out.push_str(s),
                Some(v) => out.push_str(&v.to_string()),
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// 程序是否可执行：带路径分隔符时检查文件存在，否则在 PATH 中查找
pub(crate) fn program_available(program: &str) -> bool {
    if program.contains('/') || program.contains('\\') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// 从配置条目构建的外部命令工具
pub struct CommandTool {
    name: String,
    description: String,
    program: String,
    args_template: Vec<String>,
    params: Vec<ParamEntry>,
    workspace: PathBuf,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(entry: &ToolEntry, program: &str, workspace: &Path, timeout_secs: u64) -> Self {
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            program: program.to_string(),
            args_template: entry.args.clone(),
            params: entry.params.clone(),
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn substitute(&self, args: &Value) -> Vec<String> {
        self.args_template
            .iter()
            .filter_map(|tpl| match render(tpl, args, &self.workspace) {
                Ok(s) => Some(s),
                Err(key) => {
                    tracing::debug!(tool = %self.name, param = %key, "omitting argument for absent parameter");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        schema_from_params(&self.params)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let missing = missing_required(&self.params, &args);
        if !missing.is_empty() {
            return Err(format!("missing required parameter(s): {}", missing.join(", ")));
        }
        let argv = self.substitute(&args);
        tracing::debug!(tool = %self.name, program = %self.program, "command tool invoke");

        let cwd = if self.workspace.is_dir() {
            self.workspace.clone()
        } else {
            PathBuf::from(".")
        };
        let child = Command::new(&self.program)
            .args(&argv)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", self.program, e))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("'{}' timed out after {}s", self.program, self.timeout.as_secs()))?
            .map_err(|e| format!("'{}' wait failed: {}", self.program, e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            return Err(format!("exit {:?}: {}", output.status.code(), detail));
        }
        Ok(stdout.trim().to_string())
    }
}
