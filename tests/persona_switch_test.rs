//! 人格切换：核心工具常驻、只暴露已加载模块的工具、失败回滚、未加载工具返回 NotFound

mod common;

use std::collections::BTreeSet;

use common::{module, runtime_with, ScriptedTool};
use hive::core::HiveError;
use hive::tools::{InvokeError, Lookup};

const CONFIG: &str = r#"
[personas.developer]
modules = ["git", "gitlab"]

[personas.ops]
modules = ["k8s"]

[personas.broken]
modules = ["k8s", "vault"]

[personas.redundant]
modules = ["git", "git"]
"#;

async fn setup() -> std::sync::Arc<hive::Runtime> {
    let modules = vec![
        module("git", vec![ScriptedTool::ok("git_log", "abc123"), ScriptedTool::ok("git_status", "clean")]),
        module("gitlab", vec![ScriptedTool::ok("gitlab_mr_list", "[]")]),
        module("k8s", vec![ScriptedTool::ok("kube_pods", "api-0 Running")]),
    ];
    runtime_with(CONFIG, modules, vec!["vault"]).await.0
}

#[tokio::test]
async fn switch_exposes_core_plus_loaded_modules_only() {
    let rt = setup().await;
    let core = rt.registry().core_names().await;

    for (persona, expected) in [
        ("developer", vec!["git_log", "git_status", "gitlab_mr_list"]),
        ("ops", vec!["kube_pods"]),
        ("redundant", vec!["git_log", "git_status"]),
    ] {
        rt.personas().switch(persona).await.unwrap();
        let names: BTreeSet<String> = rt.registry().tool_names().await.into_iter().collect();
        let mut want: BTreeSet<String> = core.iter().cloned().collect();
        want.extend(expected.iter().map(|s| s.to_string()));
        assert_eq!(names, want, "persona {}", persona);
    }
}

#[tokio::test]
async fn failed_switch_restores_previous_snapshot() {
    let rt = setup().await;
    rt.personas().switch("developer").await.unwrap();
    let before: Vec<String> = rt.registry().tool_names().await;

    let err = rt.personas().switch("broken").await.unwrap_err();
    match err {
        HiveError::SwitchFailed { persona, errors } => {
            assert_eq!(persona, "broken");
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("vault"));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(rt.registry().tool_names().await, before);
    assert_eq!(rt.personas().current().await.as_deref(), Some("developer"));
    assert_eq!(rt.registry().loaded_modules().await, vec!["git".to_string(), "gitlab".to_string()]);
}

#[tokio::test]
async fn tool_from_unloaded_module_is_not_found() {
    let rt = setup().await;
    rt.personas().switch("ops").await.unwrap();

    assert!(matches!(rt.registry().lookup("git_log").await, Lookup::NotFound));
    let err = rt
        .executor()
        .execute("git_log", serde_json::json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, InvokeError::NotFound("git_log".to_string()));

    assert_eq!(
        rt.executor().execute("kube_pods", serde_json::json!({})).await.unwrap(),
        "api-0 Running"
    );
}

#[tokio::test]
async fn unknown_persona_is_reported() {
    let rt = setup().await;
    let err = rt.personas().switch("nobody").await.unwrap_err();
    assert!(err.to_string().contains("nobody"));
    assert!(rt.personas().current().await.is_none());
}

#[tokio::test]
async fn switch_emits_capability_event() {
    let rt = setup().await;
    let mut events = rt.personas().subscribe();
    rt.personas().switch("ops").await.unwrap();
    let hive::persona::CapabilityEvent::ToolsChanged { persona, tools } = events.recv().await.unwrap();
    assert_eq!(persona, "ops");
    assert!(tools.contains(&"kube_pods".to_string()));

    // 失败的切换不发事件
    let _ = rt.personas().switch("broken").await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn persona_load_core_tool_switches() {
    let rt = setup().await;
    let out = rt
        .executor()
        .execute("persona_load", serde_json::json!({"name": "developer"}))
        .await
        .unwrap();
    assert!(out.contains("developer"));
    assert!(rt.registry().tool_names().await.contains(&"git_log".to_string()));
}
