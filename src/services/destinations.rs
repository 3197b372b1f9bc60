//! `Destination` implementations.
//!
//! Two shapes are recognized: *chat* (a short block list posted to a
//! chatops webhook, e.g. Slack's incoming-webhook API) and *relay* (an
//! echo of the original Alertmanager v2 envelope with
//! `annotations.holmes_root_cause`/`holmes_category` populated, posted
//! onward to another Alertmanager-shaped receiver). Both are thin
//! `reqwest` clients with no retry logic of their own — retry lives in
//! `core::fanout::DestinationWorker` — grounded on
//! `services::starrocks_client::StarRocksClient`'s "one async method per
//! capability, no retry" shape.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use crate::core::fanout::{format_chat_summary, Destination, DeliveryError, Format};
use crate::core::model::{Alert, Group};
use crate::utils::TransportError;

/// Classifies a non-2xx HTTP response: 4xx is permanent (the request
/// itself is wrong and retrying it unchanged would only repeat the
/// rejection), anything else (5xx, unexpected status) is transient.
fn classify_status(url: &str, status: StatusCode) -> DeliveryError {
    let reason = TransportError(format!("POST {url}: status {status}"));
    if status.is_client_error() {
        DeliveryError::Permanent(reason)
    } else {
        DeliveryError::Transient(reason)
    }
}

/// Posts a one-line chat summary to a webhook-style chat integration
/// (Slack incoming webhooks and compatible receivers).
pub struct ChatDestination {
    name: String,
    webhook_url: String,
    client: reqwest::Client,
}

impl ChatDestination {
    pub fn new(name: impl Into<String>, webhook_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder never fails with these options");
        Self { name: name.into(), webhook_url: webhook_url.into(), client }
    }
}

#[async_trait]
impl Destination for ChatDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self, alert: &Alert, group: Option<&Group>) -> Format {
        let mut text = format_chat_summary(alert, group);
        if let Some(group) = group {
            if let Some(rule_id) = &group.rule_id {
                text.push_str(&format!(" (rule {rule_id})"));
            }
        }
        if let Some(enrichment) = &alert.enrichment {
            for evidence in enrichment.evidence.iter().take(3) {
                text.push_str(&format!("\n  • {}: {}", evidence.tool_name, evidence.summary));
            }
        }
        Format::Chat { text }
    }

    async fn deliver(&self, format: Format) -> Result<(), DeliveryError> {
        let Format::Chat { text } = format else {
            return Err(DeliveryError::Permanent(TransportError(
                "ChatDestination received a non-chat payload".to_string(),
            )));
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(TransportError(format!("POST {}: {e}", self.webhook_url))))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_status(&self.webhook_url, response.status()))
        }
    }
}

/// Re-posts the original alert, annotated with the enrichment's root
/// cause and category, to a downstream Alertmanager v2-shaped webhook
/// receiver.
pub struct RelayDestination {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RelayDestination {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder never fails with these options");
        Self { name: name.into(), endpoint: endpoint.into(), client }
    }
}

#[async_trait]
impl Destination for RelayDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self, alert: &Alert, group: Option<&Group>) -> Format {
        Format::Relay { alert: alert.clone(), group: group.cloned() }
    }

    async fn deliver(&self, format: Format) -> Result<(), DeliveryError> {
        let Format::Relay { mut alert, group } = format else {
            return Err(DeliveryError::Permanent(TransportError(
                "RelayDestination received a non-relay payload".to_string(),
            )));
        };

        if let Some(enrichment) = &alert.enrichment {
            if let Some(root_cause) = &enrichment.root_cause {
                alert.annotations.insert("holmes_root_cause".to_string(), root_cause.clone());
            }
            if let Some(category) = &enrichment.category {
                alert.annotations.insert("holmes_category".to_string(), format!("{category:?}").to_lowercase());
            }
        }

        let envelope = json!({
            "version": "4",
            "receiver": self.name,
            "status": match alert.status { crate::core::model::AlertStatus::Firing => "firing", crate::core::model::AlertStatus::Resolved => "resolved" },
            "alerts": [alert],
            "groupLabels": {},
            "commonLabels": {},
            "commonAnnotations": {},
            "externalURL": "",
            "groupId": group.as_ref().map(|g| g.id.clone()),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(TransportError(format!("POST {}: {e}", self.endpoint))))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(classify_status(&self.endpoint, response.status()))
        }
    }
}
