//! Fire-and-forget notifications on phase transitions.
//!
//! Failure to notify must never fail the pipeline operation it describes:
//! every send error is logged at WARN and swallowed.

use serde_json::json;
use tracing::{debug, warn};

use crate::models::{Deployment, Enhancement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    EnhancementStarted,
    PrCreated,
    EnhancementCompleted,
    EnhancementFailed,
    DeploymentSucceeded,
    DeploymentFailed,
}

impl Event {
    fn subject(&self) -> &'static str {
        match self {
            Self::EnhancementStarted => "Enhancement started",
            Self::PrCreated => "Pull request created",
            Self::EnhancementCompleted => "Enhancement completed",
            Self::EnhancementFailed => "Enhancement failed",
            Self::DeploymentSucceeded => "Deployment succeeded",
            Self::DeploymentFailed => "Deployment failed",
        }
    }
}

/// Sends email to the requestor and/or a chat webhook. Either channel may be
/// unconfigured; with neither configured the notifier is a no-op.
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    email_url: Option<String>,
    email_from: String,
}

impl Notifier {
    pub fn new(webhook_url: Option<&str>, email_url: Option<&str>, email_from: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.map(|u| u.to_string()),
            email_url: email_url.map(|u| u.to_string()),
            email_from: email_from.to_string(),
        }
    }

    /// A notifier with no channels configured; every send is a no-op.
    pub fn disabled() -> Self {
        Self::new(None, None, "conveyor@localhost")
    }

    pub async fn enhancement_event(&self, event: Event, enhancement: &Enhancement, detail: &str) {
        let text = format!(
            "{}: #{} \"{}\": {}",
            event.subject(),
            enhancement.id,
            enhancement.title,
            detail
        );
        self.send_webhook(&text).await;
        self.send_email(&enhancement.requested_by, event.subject(), &text)
            .await;
    }

    pub async fn deployment_event(
        &self,
        event: Event,
        deployment: &Deployment,
        requested_by: Option<&str>,
        detail: &str,
    ) {
        let text = format!(
            "{}: deployment {} (enhancement #{}): {}",
            event.subject(),
            deployment.id,
            deployment.enhancement_id,
            detail
        );
        self.send_webhook(&text).await;
        if let Some(to) = requested_by {
            self.send_email(to, event.subject(), &text).await;
        }
    }

    async fn send_webhook(&self, text: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = self
            .client
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!("webhook notification sent"),
            Err(e) => warn!(error = %e, "webhook notification failed"),
        }
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) {
        let Some(url) = &self.email_url else {
            return;
        };
        let result = self
            .client
            .post(url)
            .json(&json!({
                "to": to,
                "from": self.email_from,
                "subject": subject,
                "body": body,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!(to, "email notification sent"),
            Err(e) => warn!(to, error = %e, "email notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnhancementStatus;

    fn enhancement() -> Enhancement {
        Enhancement {
            id: 1,
            title: "Add VAT".to_string(),
            description: String::new(),
            status: EnhancementStatus::Processing,
            priority: 0,
            requested_by: "alice@example.com".to_string(),
            assigned_to: None,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            plan_json: None,
            error_message: None,
            notes: None,
            created_at: String::new(),
            updated_at: String::new(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_unconfigured_notifier_is_a_silent_noop() {
        let notifier = Notifier::new(None, None, "conveyor@localhost");
        // The contract is simply that nothing panics or errors.
        notifier
            .enhancement_event(Event::EnhancementStarted, &enhancement(), "claimed")
            .await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_never_propagate_errors() {
        // Ports in the dynamic range with nothing listening: sends fail, but
        // fire-and-forget means the calls still return normally.
        let notifier = Notifier::new(
            Some("http://127.0.0.1:9/webhook"),
            Some("http://127.0.0.1:9/email"),
            "conveyor@localhost",
        );
        notifier
            .enhancement_event(Event::EnhancementFailed, &enhancement(), "boom")
            .await;
    }

    #[test]
    fn test_event_subjects_are_distinct() {
        let subjects = [
            Event::EnhancementStarted.subject(),
            Event::PrCreated.subject(),
            Event::EnhancementCompleted.subject(),
            Event::EnhancementFailed.subject(),
            Event::DeploymentSucceeded.subject(),
            Event::DeploymentFailed.subject(),
        ];
        let unique: std::collections::HashSet<_> = subjects.iter().collect();
        assert_eq!(unique.len(), subjects.len());
    }
}
