//! 轮询条件求值
//!
//! 通过工具取得数据集（JSON 数组、带 `items` 的 JSON 对象，或非空文本行），
//! 再对其求谓词。触发只看 false → true 的跳变，由调度器负责记录上一次结果。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::scheduler::job::{PollCondition, Predicate};
use crate::tools::executor::ToolExecutor;

/// 轮询条件求值器
#[async_trait]
pub trait PollEvaluator: Send + Sync {
    async fn evaluate(&self, condition: &PollCondition, now: DateTime<Utc>) -> Result<bool, String>;
}

/// 通过注册表中的工具取数据
pub struct ToolPollEvaluator {
    executor: ToolExecutor,
}

impl ToolPollEvaluator {
    pub fn new(executor: ToolExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl PollEvaluator for ToolPollEvaluator {
    async fn evaluate(&self, condition: &PollCondition, now: DateTime<Utc>) -> Result<bool, String> {
        let args = if condition.args.is_null() {
            Value::Object(Default::default())
        } else {
            condition.args.clone()
        };
        let output = self
            .executor
            .execute(&condition.tool, args)
            .await
            .map_err(|e| e.to_string())?;
        let items = parse_items(&output);
        Ok(condition.predicate.evaluate(&items, now))
    }
}

/// 把工具输出解析为条目列表
pub fn parse_items(output: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(output.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut obj)) => match obj.remove("items") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(obj)],
        },
        Ok(Value::Null) => Vec::new(),
        _ => output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect(),
    }
}

fn timestamp_of(item: &Value, field: &str) -> Option<DateTime<Utc>> {
    let value = field.split('.').try_fold(item, |v, seg| v.get(seg))?;
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

impl Predicate {
    pub fn evaluate(&self, items: &[Value], now: DateTime<Utc>) -> bool {
        match self {
            Predicate::NonEmpty => !items.is_empty(),
            Predicate::CountAtLeast { min } => items.len() >= *min,
            Predicate::CountAtMost { max } => items.len() <= *max,
            Predicate::OlderThan { field, secs, min_count } => {
                // 超出时间范围的阈值：没有条目能比它更早
                let Some(cutoff) = chrono::Duration::try_seconds(*secs).and_then(|d| now.checked_sub_signed(d)) else {
                    return *min_count == 0;
                };
                let old = items
                    .iter()
                    .filter_map(|item| timestamp_of(item, field))
                    .filter(|t| *t < cutoff)
                    .count();
                old >= *min_count
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_items_shapes() {
        assert_eq!(parse_items("[1, 2, 3]").len(), 3);
        assert_eq!(parse_items(r#"{"items": [{"id": 1}], "total": 1}"#).len(), 1);
        assert_eq!(parse_items(r#"{"id": 1}"#), vec![json!({"id": 1})]);
        assert_eq!(parse_items("a\n\n  b  \n"), vec![json!("a"), json!("b")]);
        assert!(parse_items("").is_empty());
        assert!(parse_items("null").is_empty());
    }

    #[test]
    fn test_count_predicates() {
        let items = vec![json!(1), json!(2)];
        let now = Utc::now();
        assert!(Predicate::NonEmpty.evaluate(&items, now));
        assert!(!Predicate::NonEmpty.evaluate(&[], now));
        assert!(Predicate::CountAtLeast { min: 2 }.evaluate(&items, now));
        assert!(!Predicate::CountAtLeast { min: 3 }.evaluate(&items, now));
        assert!(Predicate::CountAtMost { max: 2 }.evaluate(&items, now));
    }

    #[test]
    fn test_older_than() {
        let now = DateTime::parse_from_rfc3339("2024-06-03T12:00:00Z").unwrap().with_timezone(&Utc);
        let items = vec![
            json!({"mr": {"created_at": "2024-06-01T12:00:00Z"}}),
            json!({"mr": {"created_at": "2024-06-03T11:00:00Z"}}),
            json!({"mr": {"created_at": now.timestamp() - 90_000}}),
            json!({"mr": {}}),
        ];
        let predicate = |min_count| Predicate::OlderThan {
            field: "mr.created_at".to_string(),
            secs: 86_400,
            min_count,
        };
        assert!(predicate(2).evaluate(&items, now));
        assert!(!predicate(3).evaluate(&items, now));

        let huge = Predicate::OlderThan {
            field: "mr.created_at".to_string(),
            secs: i64::MAX,
            min_count: 1,
        };
        assert!(!huge.evaluate(&items, now));
    }
}
