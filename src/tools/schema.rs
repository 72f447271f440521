//! 工具参数 JSON Schema 生成
//!
//! 配置中的工具以 `params = [{ name, type, required, description }]` 声明参数，
//! 这里转换为 tools/list 返回的 inputSchema，并在调用前校验必填参数。

use serde_json::{json, Map, Value};

use crate::config::ParamEntry;

/// 由参数声明生成 JSON Schema（object）
pub fn schema_from_params(params: &[ParamEntry]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        let mut prop = Map::new();
        prop.insert("type".to_string(), Value::String(p.param_type.clone()));
        if !p.description.is_empty() {
            prop.insert("description".to_string(), Value::String(p.description.clone()));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// 校验必填参数；返回缺失的参数名
pub fn missing_required(params: &[ParamEntry], args: &Value) -> Vec<String> {
    params
        .iter()
        .filter(|p| p.required)
        .filter(|p| match args.get(&p.name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .map(|p| p.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(name: &str, ty: &str, required: bool) -> ParamEntry {
        ParamEntry {
            name: name.to_string(),
            description: String::new(),
            param_type: ty.to_string(),
            required,
        }
    }

    #[test]
    fn test_schema_from_params() {
        let schema = schema_from_params(&[param("repo", "string", true), param("limit", "integer", false)]);
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        assert_eq!(schema["required"], json!(["repo"]));
    }

    #[test]
    fn test_missing_required() {
        let params = [param("repo", "string", true), param("limit", "integer", false)];
        assert_eq!(missing_required(&params, &json!({})), vec!["repo".to_string()]);
        assert_eq!(missing_required(&params, &json!({"repo": ""})), vec!["repo".to_string()]);
        assert!(missing_required(&params, &json!({"repo": "/src/app"})).is_empty());
    }
}
