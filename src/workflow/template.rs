//! 步骤参数模板
//!
//! 语法：
//! - `{{inputs.x}}`：技能输入，可继续取字段 `{{inputs.x.field}}`
//! - `{{steps.<name|index>.output}}`：已完成步骤的输出，支持 `.field`、`[0]`、`.0` 路径
//! - 字符串内插：`"MR {{inputs.iid}}: {{steps.fetch.output.title}}"`
//!
//! 整个字符串恰好是一个占位符时保留原始 JSON 类型；混合文本时各值转为字符串拼接。
//! 模板在技能加载时解析为 [`ParamTemplate`]，运行时对 [`ResolveContext`] 求值。

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

/// 模板解析 / 求值错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("invalid template expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("unknown input '{0}'")]
    UnknownInput(String),

    #[error("step '{0}' has no output (not run, skipped, or failed)")]
    StepUnavailable(String),

    #[error("'{reference}': no field '{segment}'")]
    MissingField { reference: String, segment: String },
}

/// 路径段
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => f.write_str(k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// 步骤引用：按名称或按序号（0 起）
#[derive(Debug, Clone, PartialEq)]
pub enum StepRef {
    Name(String),
    Index(usize),
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Name(n) => f.write_str(n),
            StepRef::Index(i) => write!(f, "{}", i),
        }
    }
}

/// 占位符指向的值
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Input { name: String, path: Vec<PathSegment> },
    StepOutput { step: StepRef, path: Vec<PathSegment> },
}

impl Reference {
    /// 解析占位符内部文本（不含花括号）
    pub fn parse(expr: &str) -> Result<Self, ResolveError> {
        let syntax = |reason: &str| ResolveError::Syntax {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        let segments = parse_path(expr.trim()).map_err(|r| syntax(&r))?;
        let mut iter = segments.into_iter();
        match iter.next() {
            Some(PathSegment::Key(root)) if root == "inputs" || root == "input" => match iter.next() {
                Some(PathSegment::Key(name)) => Ok(Reference::Input {
                    name,
                    path: iter.collect(),
                }),
                _ => Err(syntax("expected inputs.<name>")),
            },
            Some(PathSegment::Key(root)) if root == "steps" => {
                let step = match iter.next() {
                    Some(PathSegment::Key(name)) => StepRef::Name(name),
                    Some(PathSegment::Index(i)) => StepRef::Index(i),
                    None => return Err(syntax("expected steps.<name|index>.output")),
                };
                match iter.next() {
                    Some(PathSegment::Key(k)) if k == "output" => Ok(Reference::StepOutput {
                        step,
                        path: iter.collect(),
                    }),
                    _ => Err(syntax("expected steps.<name|index>.output")),
                }
            }
            _ => Err(syntax("must start with 'inputs.' or 'steps.'")),
        }
    }

    fn describe(&self) -> String {
        match self {
            Reference::Input { name, .. } => format!("inputs.{}", name),
            Reference::StepOutput { step, .. } => format!("steps.{}.output", step),
        }
    }

    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Value, ResolveError> {
        let (root, path) = match self {
            Reference::Input { name, path } => (
                ctx.inputs
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownInput(name.clone()))?,
                path,
            ),
            Reference::StepOutput { step, path } => (
                ctx.step_output(step)
                    .ok_or_else(|| ResolveError::StepUnavailable(step.to_string()))?,
                path,
            ),
        };
        let mut current = root;
        for seg in path {
            current = navigate(current, seg).ok_or_else(|| ResolveError::MissingField {
                reference: self.describe(),
                segment: seg.to_string(),
            })?;
        }
        Ok(current.clone())
    }
}

/// 解析 `a.b[0].c` / `a.0.c` 形式的路径
fn parse_path(path: &str) -> Result<Vec<PathSegment>, String> {
    if path.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut out = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err("empty path segment".to_string());
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            match key.parse::<usize>() {
                Ok(i) => out.push(PathSegment::Index(i)),
                Err(_) => out.push(PathSegment::Key(key.to_string())),
            }
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| "unclosed '['".to_string())?;
            let idx = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid index '{}'", &rest[1..close]))?;
            out.push(PathSegment::Index(idx));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(format!("unexpected '{}' after index", rest));
            }
        }
    }
    Ok(out)
}

fn navigate<'v>(value: &'v Value, seg: &PathSegment) -> Option<&'v Value> {
    match (value, seg) {
        (Value::Object(map), PathSegment::Key(k)) => map.get(k),
        (Value::Object(map), PathSegment::Index(i)) => map.get(&i.to_string()),
        (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
        _ => None,
    }
}

/// 求值上下文：技能输入 + 已执行步骤的输出（按执行顺序）
pub struct ResolveContext<'a> {
    pub inputs: &'a Map<String, Value>,
    pub steps: &'a [(String, Option<Value>)],
}

impl<'a> ResolveContext<'a> {
    pub fn new(inputs: &'a Map<String, Value>, steps: &'a [(String, Option<Value>)]) -> Self {
        Self { inputs, steps }
    }

    fn step_output(&self, step: &StepRef) -> Option<&'a Value> {
        let entry = match step {
            StepRef::Name(name) => self.steps.iter().find(|(n, _)| n == name),
            StepRef::Index(i) => self.steps.get(*i),
        };
        entry.and_then(|(_, out)| out.as_ref())
    }
}

/// 字符串片段
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ref(Reference),
}

/// 参数模板 AST
#[derive(Debug, Clone, PartialEq)]
pub enum ParamTemplate {
    Literal(Value),
    /// 整个字符串是一个占位符：保留原始类型
    Ref(Reference),
    Interpolate(Vec<Segment>),
    Array(Vec<ParamTemplate>),
    Object(Vec<(String, ParamTemplate)>),
}

impl ParamTemplate {
    pub fn parse(value: &Value) -> Result<Self, ResolveError> {
        Ok(match value {
            Value::String(s) => Self::parse_str(s)?,
            Value::Array(items) => ParamTemplate::Array(items.iter().map(Self::parse).collect::<Result<_, _>>()?),
            Value::Object(map) => ParamTemplate::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                    .collect::<Result<_, ResolveError>>()?,
            ),
            other => ParamTemplate::Literal(other.clone()),
        })
    }

    pub fn parse_str(s: &str) -> Result<Self, ResolveError> {
        let segments = parse_segments(s)?;
        Ok(match segments.as_slice() {
            [] => ParamTemplate::Literal(Value::String(String::new())),
            [Segment::Text(t)] => ParamTemplate::Literal(Value::String(t.clone())),
            [Segment::Ref(r)] => ParamTemplate::Ref(r.clone()),
            _ => ParamTemplate::Interpolate(segments),
        })
    }

    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Value, ResolveError> {
        match self {
            ParamTemplate::Literal(v) => Ok(v.clone()),
            ParamTemplate::Ref(r) => r.resolve(ctx),
            ParamTemplate::Interpolate(segments) => {
                let mut out = String::new();
                for seg in segments {
                    match seg {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => out.push_str(&value_to_string(&r.resolve(ctx)?)),
                    }
                }
                Ok(Value::String(out))
            }
            ParamTemplate::Array(items) => Ok(Value::Array(
                items.iter().map(|t| t.resolve(ctx)).collect::<Result<_, _>>()?,
            )),
            ParamTemplate::Object(fields) => {
                let mut map = Map::new();
                for (k, t) in fields {
                    map.insert(k.clone(), t.resolve(ctx)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// 模板中引用的所有步骤（用于加载时校验引用顺序）
    pub fn step_refs(&self) -> Vec<&StepRef> {
        let mut out = Vec::new();
        self.collect_step_refs(&mut out);
        out
    }

    fn collect_step_refs<'s>(&'s self, out: &mut Vec<&'s StepRef>) {
        match self {
            ParamTemplate::Literal(_) => {}
            ParamTemplate::Ref(r) => push_step_ref(r, out),
            ParamTemplate::Interpolate(segments) => {
                for seg in segments {
                    if let Segment::Ref(r) = seg {
                        push_step_ref(r, out);
                    }
                }
            }
            ParamTemplate::Array(items) => items.iter().for_each(|t| t.collect_step_refs(out)),
            ParamTemplate::Object(fields) => fields.iter().for_each(|(_, t)| t.collect_step_refs(out)),
        }
    }
}

fn push_step_ref<'s>(r: &'s Reference, out: &mut Vec<&'s StepRef>) {
    if let Reference::StepOutput { step, .. } = r {
        out.push(step);
    }
}

fn parse_segments(s: &str) -> Result<Vec<Segment>, ResolveError> {
    let mut segments = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| ResolveError::Syntax {
            expr: s.to_string(),
            reason: "unclosed '{{'".to_string(),
        })?;
        segments.push(Segment::Ref(Reference::parse(&after[..end])?));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

/// 内插时的字符串形式：字符串原样，null 为空，其余为 JSON
pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> Map<String, Value> {
        json!({"issue": "OPS-12", "limit": 5, "meta": {"labels": ["a", "b"]}})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn steps() -> Vec<(String, Option<Value>)> {
        vec![
            ("fetch".to_string(), Some(json!({"title": "Fix login", "items": [{"name": "x"}]}))),
            ("skipped".to_string(), None),
        ]
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let (i, s) = (inputs(), steps());
        let ctx = ResolveContext::new(&i, &s);
        let t = ParamTemplate::parse(&json!({"n": "{{inputs.limit}}", "labels": "{{inputs.meta.labels}}"})).unwrap();
        assert_eq!(t.resolve(&ctx).unwrap(), json!({"n": 5, "labels": ["a", "b"]}));
    }

    #[test]
    fn test_interpolation_and_paths() {
        let (i, s) = (inputs(), steps());
        let ctx = ResolveContext::new(&i, &s);
        let t = ParamTemplate::parse_str("{{inputs.issue}}: {{steps.fetch.output.title}} / {{steps.0.output.items[0].name}}").unwrap();
        assert_eq!(t.resolve(&ctx).unwrap(), json!("OPS-12: Fix login / x"));
        let dotted = ParamTemplate::parse_str("{{steps.fetch.output.items.0.name}}").unwrap();
        assert_eq!(dotted.resolve(&ctx).unwrap(), json!("x"));
    }

    #[test]
    fn test_literals_untouched() {
        let t = ParamTemplate::parse(&json!({"force": true, "count": 3, "msg": "plain"})).unwrap();
        assert!(matches!(&t, ParamTemplate::Object(f) if f.iter().all(|(_, v)| matches!(v, ParamTemplate::Literal(_)))));
    }

    #[test]
    fn test_resolution_errors() {
        let (i, s) = (inputs(), steps());
        let ctx = ResolveContext::new(&i, &s);
        let err = |expr: &str| ParamTemplate::parse_str(expr).unwrap().resolve(&ctx).unwrap_err();
        assert_eq!(err("{{inputs.nope}}"), ResolveError::UnknownInput("nope".to_string()));
        assert_eq!(err("{{steps.skipped.output}}"), ResolveError::StepUnavailable("skipped".to_string()));
        assert_eq!(err("{{steps.later.output}}"), ResolveError::StepUnavailable("later".to_string()));
        assert!(matches!(err("{{steps.fetch.output.missing}}"), ResolveError::MissingField { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(ParamTemplate::parse_str("{{inputs.x").is_err());
        assert!(ParamTemplate::parse_str("{{env.HOME}}").is_err());
        assert!(ParamTemplate::parse_str("{{steps.fetch.result}}").is_err());
        assert!(ParamTemplate::parse_str("{{inputs.a[x]}}").is_err());
    }

    #[test]
    fn test_step_refs_collected() {
        let t = ParamTemplate::parse(&json!(["{{steps.fetch.output}}", {"x": "a {{steps.1.output}}"}])).unwrap();
        assert_eq!(t.step_refs(), vec![&StepRef::Name("fetch".to_string()), &StepRef::Index(1)]);
    }
}
