//! 恢复中间件：有界重试、未分类错误不补救、故障记录

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::ScriptedTool;
use hive::core::recovery::{
    Classification, FailureRecord, RecoveryEngine, RecoveryOutcome, RemediationAction, RemediationRule, Remediator,
};
use hive::memory::{Memory, FAILURES_KEY};
use hive::tools::Operation;

struct StubRemediator {
    calls: AtomicUsize,
    succeed: bool,
}

impl StubRemediator {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            succeed,
        })
    }
}

#[async_trait]
impl Remediator for StubRemediator {
    async fn remediate(&self, _action: &RemediationAction, _scope: Option<&str>) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok("reconnected".to_string())
        } else {
            Err("vpn down".to_string())
        }
    }
}

fn rules() -> Vec<RemediationRule> {
    vec![
        RemediationRule::new("connectivity", "connection reset", "vpn_connect"),
        RemediationRule::new("authentication", "401 Unauthorized", "gitlab_token_refresh").with_scope("gitlab"),
    ]
}

async fn failures(memory: &Memory) -> Vec<FailureRecord> {
    memory
        .load_list(FAILURES_KEY)
        .await
        .unwrap()
        .into_iter()
        .map(|v: Value| serde_json::from_value(v).unwrap())
        .collect()
}

#[tokio::test]
async fn classified_error_is_retried_exactly_once() {
    let memory = Arc::new(Memory::in_memory());
    let remediator = StubRemediator::new(true);
    let engine = RecoveryEngine::new(memory.clone(), rules(), remediator.clone());

    let tool = ScriptedTool::new("kube_pods", vec![Err("read: connection reset by peer")]);
    let attempts = tool.counter();
    let op = engine.wrap(Operation::new("k8s", tool));

    for round in 1..=3 {
        let err = op.execute(json!({})).await.unwrap_err();
        assert!(err.starts_with("recovery attempted, still failing [connectivity]"), "{}", err);
        // 每次调用最多 2 次尝试，不随进程内重复出现而增加
        assert_eq!(attempts.load(Ordering::SeqCst), 2 * round);
        assert_eq!(remediator.calls.load(Ordering::SeqCst), round);
    }

    let records = failures(&memory).await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.outcome == RecoveryOutcome::StillFailing));
}

#[tokio::test]
async fn unclassified_error_never_remediates() {
    let memory = Arc::new(Memory::in_memory());
    let remediator = StubRemediator::new(true);
    let engine = RecoveryEngine::new(memory.clone(), rules(), remediator.clone());

    let tool = ScriptedTool::new("kube_pods", vec![Err("error: the server doesn't have a resource type \"podz\"")]);
    let attempts = tool.counter();
    let op = engine.wrap(Operation::new("k8s", tool));

    let err = op.execute(json!({})).await.unwrap_err();
    assert_eq!(err, "error: the server doesn't have a resource type \"podz\"");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(remediator.calls.load(Ordering::SeqCst), 0);

    let records = failures(&memory).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, RecoveryOutcome::Unclassified);
    assert!(records[0].remediation.is_none());
}

#[tokio::test]
async fn scoped_rule_only_applies_to_its_module() {
    let memory = Arc::new(Memory::in_memory());
    let remediator = StubRemediator::new(true);
    let engine = RecoveryEngine::new(memory, rules(), remediator.clone());

    assert!(matches!(
        engine.classify("HTTP 401 Unauthorized", Some("gitlab")).await,
        Classification::Classified(r) if r.class == "authentication"
    ));
    assert!(matches!(
        engine.classify("HTTP 401 Unauthorized", Some("jira")).await,
        Classification::Unclassified
    ));

    let tool = ScriptedTool::new("jira_view_issue", vec![Err("HTTP 401 Unauthorized")]);
    let op = engine.wrap(Operation::new("jira", tool));
    assert!(op.execute(json!({})).await.is_err());
    assert_eq!(remediator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_remediation_skips_retry() {
    let memory = Arc::new(Memory::in_memory());
    let remediator = StubRemediator::new(false);
    let engine = RecoveryEngine::new(memory.clone(), rules(), remediator.clone());

    let tool = ScriptedTool::new("kube_pods", vec![Err("connection reset"), Ok("ok")]);
    let attempts = tool.counter();
    let op = engine.wrap(Operation::new("k8s", tool));

    let err = op.execute(json!({})).await.unwrap_err();
    assert!(err.contains("vpn down"), "{}", err);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(failures(&memory).await[0].outcome, RecoveryOutcome::StillFailing);
}

#[tokio::test]
async fn learned_rule_applies_without_restart() {
    let memory = Arc::new(Memory::in_memory());
    let remediator = StubRemediator::new(true);
    let engine = RecoveryEngine::new(memory.clone(), Vec::new(), remediator.clone());

    let tool = ScriptedTool::new(
        "kube_pods",
        vec![
            Err("Please confirm (y/N)"),
            Err("Please confirm (y/N)"),
            Ok("api-0 Running"),
        ],
    );
    let op = engine.wrap(Operation::new("k8s", tool));

    assert!(op.execute(json!({})).await.is_err());
    assert_eq!(remediator.calls.load(Ordering::SeqCst), 0);

    engine
        .learn(RemediationRule::new("interactive-confirmation-required", "please confirm", "kube_confirm"))
        .await
        .unwrap();
    assert_eq!(op.execute(json!({})).await.unwrap(), "api-0 Running");
    assert_eq!(remediator.calls.load(Ordering::SeqCst), 1);

    let records = failures(&memory).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].outcome, RecoveryOutcome::Recovered);
    assert_eq!(records[1].class.as_deref(), Some("interactive-confirmation-required"));
}
