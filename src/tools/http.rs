//! HTTP 工具：按 URL 模板调用外部 API（GitLab、Jira、告警平台 ...）
//!
//! 非 2xx 响应返回 `HTTP <status>: <body>` 作为错误文本（如 `HTTP 401 Unauthorized: ...`），
//! 恢复规则可据此识别认证过期等错误类别。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ParamEntry, ToolEntry};
use crate::tools::command::render;
use crate::tools::registry::Tool;
use crate::tools::schema::{missing_required, schema_from_params};

const MAX_BODY_CHARS: usize = 4000;

pub struct HttpTool {
    name: String,
    description: String,
    method: reqwest::Method,
    url_template: String,
    body_template: Option<Value>,
    params: Vec<ParamEntry>,
    workspace: PathBuf,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpTool {
    /// method 非法时返回错误说明
    pub fn new(
        entry: &ToolEntry,
        url: &str,
        workspace: &Path,
        timeout_secs: u64,
        client: reqwest::Client,
    ) -> Result<Self, String> {
        let method = entry
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| format!("tool '{}': invalid HTTP method: {}", entry.name, e))?;
        Ok(Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            method,
            url_template: url.to_string(),
            body_template: entry.body.clone(),
            params: entry.params.clone(),
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
            client,
        })
    }

    /// 递归渲染请求体中的字符串模板
    fn render_body(&self, template: &Value, args: &Value) -> Result<Value, String> {
        Ok(match template {
            Value::String(s) => {
                let trimmed = s.trim();
                // 整个字符串就是一个占位符时保留原始 JSON 类型
                if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
                    let key = trimmed[2..trimmed.len() - 2].trim();
                    match args.get(key) {
                        Some(v) if !v.is_null() => v.clone(),
                        _ => return Err(key.to_string()),
                    }
                } else {
                    Value::String(render(s, args, &self.workspace)?)
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_body(v, args))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.render_body(v, args)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

#[async_trait]
impl Tool for HttpTool {
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
        let url = render(&self.url_template, &args, &self.workspace)
            .map_err(|key| format!("missing parameter for URL: {}", key))?;
        let mut request = self
            .client
            .request(self.method.clone(), &url)
            .timeout(self.timeout);
        if let Some(body) = &self.body_template {
            let body = self
                .render_body(body, &args)
                .map_err(|key| format!("missing parameter for body: {}", key))?;
            request = request.json(&body);
        }

        tracing::debug!(tool = %self.name, method = %self.method, url = %url, "http tool invoke");
        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("reading response from {} failed: {}", url, e))?;
        let text = if text.chars().count() > MAX_BODY_CHARS {
            format!("{}...", text.chars().take(MAX_BODY_CHARS).collect::<String>())
        } else {
            text
        };
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, text.trim()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolKind;
    use serde_json::json;

    fn entry(method: Option<&str>, body: Option<Value>) -> ToolEntry {
        ToolEntry {
            name: "mr_list".to_string(),
            description: String::new(),
            kind: ToolKind::Http,
            program: None,
            args: vec![],
            url: Some("http://localhost/projects/{{project}}".to_string()),
            method: method.map(str::to_string),
            body,
            params: vec![],
            timeout_secs: None,
        }
    }

    #[test]
    fn test_invalid_method_rejected() {
        let e = entry(Some("not a method"), None);
        assert!(HttpTool::new(&e, "http://x", Path::new("."), 5, reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_render_body_keeps_types() {
        let e = entry(Some("post"), None);
        let tool = HttpTool::new(&e, "http://x", Path::new("."), 5, reqwest::Client::new()).unwrap();
        let tpl = json!({"iid": "{{iid}}", "title": "MR {{iid}}: {{title}}", "labels": ["{{label}}"]});
        let body = tool
            .render_body(&tpl, &json!({"iid": 42, "title": "fix", "label": "ops"}))
            .unwrap();
        assert_eq!(body, json!({"iid": 42, "title": "MR 42: fix", "labels": ["ops"]}));
        assert_eq!(tool.render_body(&tpl, &json!({"iid": 1})).unwrap_err(), "title");
    }

    #[tokio::test]
    async fn test_missing_url_param() {
        let e = entry(None, None);
        let tool = HttpTool::new(&e, "http://localhost/projects/{{project}}", Path::new("."), 5, reqwest::Client::new()).unwrap();
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(err.contains("missing parameter for URL: project"));
    }
}
