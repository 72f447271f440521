//! 通知分发：日志、记忆记录、Webhook
//!
//! 分发失败只记录日志，不影响任务本身的成功与否。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{Memory, MemoryError, NOTIFICATIONS_KEY};
use crate::scheduler::job::NotifyTarget;
use crate::workflow::types::{RunStatus, WorkflowRun};

const MAX_NOTIFICATIONS: usize = 200;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("webhook {url}: {reason}")]
    Webhook { url: String, reason: String },
}

/// 一次任务触发的结果通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub job: String,
    pub skill: String,
    pub run_id: String,
    pub status: RunStatus,
    pub summary: String,
    pub timestamp: String,
}

impl Notification {
    pub fn from_run(job: &str, run: &WorkflowRun) -> Self {
        Self {
            job: job.to_string(),
            skill: run.skill.clone(),
            run_id: run.id.clone(),
            status: run.status,
            summary: run.summary(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, target: &NotifyTarget, notification: &Notification) -> Result<(), NotifyError>;
}

/// 内置的通知实现
pub struct DefaultSink {
    memory: Arc<Memory>,
    client: reqwest::Client,
}

impl DefaultSink {
    pub fn new(memory: Arc<Memory>) -> Self {
        Self {
            memory,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for DefaultSink {
    async fn dispatch(&self, target: &NotifyTarget, notification: &Notification) -> Result<(), NotifyError> {
        match target {
            NotifyTarget::Log => {
                if notification.status.is_success() {
                    tracing::info!(job = %notification.job, run_id = %notification.run_id, "{}", notification.summary);
                } else {
                    tracing::warn!(job = %notification.job, run_id = %notification.run_id, "{}", notification.summary);
                }
                Ok(())
            }
            NotifyTarget::Memory => {
                let entry = serde_json::to_value(notification).map_err(MemoryError::from)?;
                self.memory
                    .append(NOTIFICATIONS_KEY, entry, Some(MAX_NOTIFICATIONS))
                    .await?;
                Ok(())
            }
            NotifyTarget::Webhook { url } => {
                let webhook_err = |reason: String| NotifyError::Webhook {
                    url: url.clone(),
                    reason,
                };
                let resp = self
                    .client
                    .post(url)
                    .json(notification)
                    .send()
                    .await
                    .map_err(|e| webhook_err(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(webhook_err(format!("HTTP {}", resp.status())));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        let mut run = WorkflowRun::new("coffee", Default::default());
        run.status = RunStatus::Succeeded;
        Notification::from_run("morning", &run)
    }

    #[tokio::test]
    async fn test_memory_target_appends() {
        let memory = Arc::new(Memory::in_memory());
        let sink = DefaultSink::new(memory.clone());
        sink.dispatch(&NotifyTarget::Memory, &notification()).await.unwrap();
        sink.dispatch(&NotifyTarget::Log, &notification()).await.unwrap();

        let stored = memory.load_list(NOTIFICATIONS_KEY).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["job"], "morning");
        assert_eq!(stored[0]["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_webhook_failure_is_error() {
        let sink = DefaultSink::new(Arc::new(Memory::in_memory()));
        let target = NotifyTarget::Webhook {
            url: "http://127.0.0.1:9/hook".to_string(),
        };
        assert!(matches!(
            sink.dispatch(&target, &notification()).await,
            Err(NotifyError::Webhook { .. })
        ));
    }
}
