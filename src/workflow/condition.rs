//! 步骤守卫条件
//!
//! 支持：`{{ref}}`（真值判断）、`!expr` / `not expr`、`a == b`、`a != b`、`a contains b`。
//! 操作数可以是占位符、带引号的字符串、JSON 字面量（数字 / true / false / null），
//! 或不带花括号的 `inputs.x` / `steps.n.output` 引用。

use serde_json::Value;

use crate::workflow::template::{value_to_string, ParamTemplate, Reference, ResolveContext, ResolveError};

#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Truthy(ParamTemplate),
    Not(Box<Guard>),
    Eq(ParamTemplate, ParamTemplate),
    Ne(ParamTemplate, ParamTemplate),
    Contains(ParamTemplate, ParamTemplate),
}

impl Guard {
    pub fn parse(expr: &str) -> Result<Self, ResolveError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ResolveError::Syntax {
                expr: expr.to_string(),
                reason: "empty condition".to_string(),
            });
        }
        if let Some(rest) = expr.strip_prefix("not ") {
            return Ok(Guard::Not(Box::new(Guard::parse(rest)?)));
        }
        if let Some(rest) = expr.strip_prefix('!') {
            if !rest.starts_with('=') {
                return Ok(Guard::Not(Box::new(Guard::parse(rest)?)));
            }
        }
        let operators: [(&str, fn(ParamTemplate, ParamTemplate) -> Guard); 3] =
            [("==", Guard::Eq), ("!=", Guard::Ne), (" contains ", Guard::Contains)];
        for (op, build) in operators {
            if let Some(pos) = find_top_level(expr, op) {
                let left = parse_operand(&expr[..pos])?;
                let right = parse_operand(&expr[pos + op.len()..])?;
                return Ok(build(left, right));
            }
        }
        Ok(Guard::Truthy(parse_operand(expr)?))
    }

    pub fn evaluate(&self, ctx: &ResolveContext<'_>) -> Result<bool, ResolveError> {
        Ok(match self {
            Guard::Truthy(t) => truthy(&t.resolve(ctx)?),
            Guard::Not(g) => !g.evaluate(ctx)?,
            Guard::Eq(a, b) => loose_eq(&a.resolve(ctx)?, &b.resolve(ctx)?),
            Guard::Ne(a, b) => !loose_eq(&a.resolve(ctx)?, &b.resolve(ctx)?),
            Guard::Contains(a, b) => contains(&a.resolve(ctx)?, &b.resolve(ctx)?),
        })
    }

    pub fn templates(&self) -> Vec<&ParamTemplate> {
        match self {
            Guard::Truthy(t) => vec![t],
            Guard::Not(g) => g.templates(),
            Guard::Eq(a, b) | Guard::Ne(a, b) | Guard::Contains(a, b) => vec![a, b],
        }
    }
}

/// 在引号与 {{ }} 之外查找运算符
fn find_top_level(expr: &str, op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => {
                if bytes[i..].starts_with(b"{{") {
                    depth += 1;
                    i += 2;
                    continue;
                }
                if bytes[i..].starts_with(b"}}") && depth > 0 {
                    depth -= 1;
                    i += 2;
                    continue;
                }
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if depth == 0 && bytes[i..].starts_with(op.as_bytes()) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn parse_operand(raw: &str) -> Result<ParamTemplate, ResolveError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ResolveError::Syntax {
            expr: raw.to_string(),
            reason: "missing operand".to_string(),
        });
    }
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        return ParamTemplate::parse_str(&s[1..s.len() - 1]);
    }
    if s.contains("{{") {
        return ParamTemplate::parse_str(s);
    }
    if s.starts_with("inputs.") || s.starts_with("steps.") {
        return Ok(ParamTemplate::Ref(Reference::parse(s)?));
    }
    match serde_json::from_str::<Value>(s) {
        Ok(v) => Ok(ParamTemplate::Literal(v)),
        Err(_) => Ok(ParamTemplate::Literal(Value::String(s.to_string()))),
    }
}

/// 真值：null、false、0、空字符串、空数组 / 对象为假
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(_), Value::Number(_) | Value::Bool(_))
        | (Value::Number(_) | Value::Bool(_), Value::String(_)) => value_to_string(a) == value_to_string(b),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_to_string(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_string(needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn eval(expr: &str) -> Result<bool, ResolveError> {
        let inputs: Map<String, Value> = json!({"env": "prod", "dry_run": false, "count": 3, "tags": ["db", "api"]})
            .as_object()
            .cloned()
            .unwrap();
        let steps = vec![("status".to_string(), Some(json!("nothing to commit, working tree clean")))];
        Guard::parse(expr)?.evaluate(&ResolveContext::new(&inputs, &steps))
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("{{inputs.env}} == 'prod'").unwrap());
        assert!(eval("inputs.env != \"staging\"").unwrap());
        assert!(eval("{{inputs.count}} == 3").unwrap());
        assert!(eval("{{inputs.count}} == '3'").unwrap());
        assert!(eval("{{inputs.tags}} contains 'api'").unwrap());
        assert!(eval("{{steps.status.output}} contains 'working tree clean'").unwrap());
    }

    #[test]
    fn test_truthiness_and_negation() {
        assert!(!eval("{{inputs.dry_run}}").unwrap());
        assert!(eval("!{{inputs.dry_run}}").unwrap());
        assert!(eval("not inputs.dry_run").unwrap());
        assert!(eval("{{inputs.tags}}").unwrap());
    }

    #[test]
    fn test_operator_inside_quotes_ignored() {
        assert!(eval("'a == b'").unwrap());
        assert!(!eval("{{inputs.env}} == 'prod == prod'").unwrap());
    }

    #[test]
    fn test_errors() {
        assert_eq!(eval("{{inputs.missing}}").unwrap_err(), ResolveError::UnknownInput("missing".to_string()));
        assert!(Guard::parse("").is_err());
        assert!(Guard::parse("== 'x'").is_err());
    }
}
