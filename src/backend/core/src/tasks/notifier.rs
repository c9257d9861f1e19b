//! Outbound notifications sent from background tasks.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Notification delivery failure.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Delivers a templated message to a recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Development notifier that writes each message to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        if template.is_empty() {
            return Err(NotifyError::UnknownTemplate(template.to_string()));
        }
        info!(recipient, template, data = %data, "Notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskTracker;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_notification_runs_as_tracked_task() {
        let tracker = TaskTracker::new();
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

        let data = serde_json::json!({ "userID": 7 });
        tracker.run("welcome_email", async move {
            notifier.send("alice@example.com", "user_welcome", &data).await
        });

        tracker.wait().await;
        assert_eq!(tracker.failed(), 0);
    }

    #[tokio::test]
    async fn test_empty_template_is_rejected() {
        let err = TracingNotifier
            .send("bob@example.com", "", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::UnknownTemplate(_)));
    }
}
