//! Outbound Notifications
//!
//! Three delivery paths, all best-effort:
//!
//! - completion callbacks to the `webhook_url` an issue was submitted with
//!   (non-2xx is logged, never retried)
//! - escalation cards to the corporate chat incoming-webhook, HMAC-signed
//!   when a secret is configured
//! - follow-up comments on project-tracker issues after a webhook-triggered
//!   analysis completes

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::models::analysis::AnalysisResult;
use crate::models::issue::Issue;
use crate::models::task::Task;
use crate::storage::config::NotifyConfig;

/// Payload POSTed to an issue's callback URL on terminal states.
#[derive(Debug, Serialize)]
pub struct CallbackPayload<'a> {
    pub task_id: &'a str,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a AnalysisResult>,
}

pub struct Notifier {
    client: reqwest::Client,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// POST the terminal snapshot to the issue's callback URL, if any.
    pub async fn task_callback(&self, issue: &Issue, task: &Task, result: Option<&AnalysisResult>) {
        let Some(url) = issue.webhook_url.as_deref().filter(|u| !u.is_empty()) else {
            return;
        };
        let payload = CallbackPayload {
            task_id: &task.task_id,
            status: task.state.to_string(),
            error: task.error.as_deref(),
            result,
        };
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    task_id = %task.task_id,
                    status = %response.status(),
                    "callback webhook returned non-2xx; not retrying"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "callback webhook failed");
            }
        }
    }

    /// Whether chat escalation is configured at all.
    pub fn escalation_configured(&self) -> bool {
        self.config
            .chat_webhook_url
            .as_deref()
            .map(|u| !u.is_empty())
            .unwrap_or(false)
    }

    /// Fire an escalation card to the corporate chat webhook.
    /// Returns true when a message was sent.
    pub async fn escalate_issue(&self, issue: &Issue, result: Option<&AnalysisResult>) -> bool {
        let Some(url) = self.config.chat_webhook_url.as_deref().filter(|u| !u.is_empty()) else {
            return false;
        };

        let mut card = escalation_card(issue, result);
        if let Some(secret) = self.config.chat_webhook_secret.as_deref().filter(|s| !s.is_empty()) {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            card["timestamp"] = serde_json::json!(timestamp);
            card["sign"] = serde_json::json!(compute_signature(&timestamp, secret));
        }

        match self.client.post(url).json(&card).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "chat escalation returned non-2xx");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat escalation failed");
                false
            }
        }
    }

    /// Post the analysis summary back to a tracker issue as a comment.
    pub async fn tracker_comment(&self, external_issue_id: &str, body: &str) {
        let (Some(api_url), Some(token)) = (
            self.config.tracker_api_url.as_deref().filter(|u| !u.is_empty()),
            self.config.tracker_api_token.as_deref().filter(|t| !t.is_empty()),
        ) else {
            return;
        };

        let url = format!(
            "{}/issues/{}/comments",
            api_url.trim_end_matches('/'),
            external_issue_id
        );
        let payload = serde_json::json!({ "body": body });
        match self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    issue = %external_issue_id,
                    status = %response.status(),
                    "tracker comment returned non-2xx"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(issue = %external_issue_id, error = %e, "tracker comment failed");
            }
        }
    }

    /// The shared secret used to verify inbound tracker webhooks.
    pub fn tracker_webhook_secret(&self) -> Option<&str> {
        self.config
            .tracker_webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// The mention token that triggers analysis from tracker comments.
    pub fn tracker_mention(&self) -> &str {
        self.config
            .tracker_mention
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or("@ai-agent")
    }
}

/// Interactive-card message body for the chat service.
fn escalation_card(issue: &Issue, result: Option<&AnalysisResult>) -> serde_json::Value {
    let mut elements = vec![serde_json::json!({
        "tag": "div",
        "text": {
            "tag": "plain_text",
            "content": format!("Ticket: {} [{}]", issue.record_id, issue.priority.as_str())
        }
    })];
    elements.push(serde_json::json!({
        "tag": "div",
        "text": { "tag": "plain_text", "content": format!("Description: {}", issue.description) }
    }));
    if let Some(result) = result {
        elements.push(serde_json::json!({
            "tag": "div",
            "text": { "tag": "plain_text", "content": format!("Analysis: {}", result.summary_line()) }
        }));
    }
    if !issue.external_link.is_empty() {
        elements.push(serde_json::json!({
            "tag": "div",
            "text": { "tag": "plain_text", "content": format!("Link: {}", issue.external_link) }
        }));
    }

    serde_json::json!({
        "msg_type": "interactive",
        "card": {
            "header": {
                "title": { "tag": "plain_text", "content": "Ticket escalation" }
            },
            "elements": elements
        }
    })
}

/// HMAC-SHA256 over "timestamp\nsecret", base64-encoded (the chat service's
/// webhook signing scheme).
pub fn compute_signature(timestamp: &str, secret: &str) -> String {
    let string_to_sign = format!("{}\n{}", timestamp, secret);
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify an inbound tracker webhook signature (hex HMAC-SHA256 of the raw
/// body). Comparison is length-checked and byte-wise.
pub fn verify_tracker_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_hex: String = expected.iter().map(|b| format!("{:02x}", b)).collect();

    // Constant-time-ish comparison
    if expected_hex.len() != signature_hex.len() {
        return false;
    }
    expected_hex
        .bytes()
        .zip(signature_hex.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
