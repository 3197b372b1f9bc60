//! Fetcher (C1) — stateless translator from an Upstream endpoint to a
//! normalized sequence of `Alert`s.
//!
//! Grounded on `services::starrocks_client::StarRocksClient`'s
//! thin-client-over-reqwest shape: one async method per capability, no
//! retry or caching inside the client itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::model::{Alert, AlertStatus, Source};
use crate::utils::TransportError;

/// Comparison operator for a label matcher in a `Filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherOp {
    Equals,
    NotEquals,
    Matches,
    NotMatches,
}

#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub key: String,
    pub op: MatcherOp,
    pub value: String,
}

/// Query filter passed to `Fetcher::fetch`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub only_firing: bool,
    pub max_alerts: Option<usize>,
    pub label_matchers: Vec<LabelMatcher>,
    pub include_silenced: bool,
    pub include_inhibited: bool,
}

/// Pure translator from a Source descriptor to a finite, non-restartable
/// sequence of alerts in Upstream order.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, source: &Source, filter: &Filter) -> Result<Vec<Alert>, TransportError>;
}

/// HTTP implementation against an Alertmanager v2-shaped
/// `GET /api/v2/alerts` endpoint.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder never fails with these options");
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &Source, filter: &Filter) -> Result<Vec<Alert>, TransportError> {
        let mut query: Vec<(String, String)> = vec![
            ("active".to_string(), "true".to_string()),
            ("silenced".to_string(), filter.include_silenced.to_string()),
            ("inhibited".to_string(), filter.include_inhibited.to_string()),
        ];
        for m in &filter.label_matchers {
            let op = match m.op {
                MatcherOp::Equals => "=",
                MatcherOp::NotEquals => "!=",
                MatcherOp::Matches => "=~",
                MatcherOp::NotMatches => "!~",
            };
            query.push(("filter".to_string(), format!("{}{}{}", m.key, op, m.value)));
        }

        let url = format!("{}/api/v2/alerts", source.url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| TransportError(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(TransportError(format!("GET {url}: status {}", response.status())));
        }

        let raw: Vec<RawAlert> = response
            .json()
            .await
            .map_err(|e| TransportError(format!("decoding response from {url}: {e}")))?;

        let mut alerts: Vec<Alert> = raw
            .into_iter()
            .filter_map(|r| match r.into_alert() {
                Ok(alert) => Some(alert),
                Err(reason) => {
                    tracing::warn!(source = %source.id, reason, "dropping alert without fingerprint");
                    None
                },
            })
            .collect();

        if filter.only_firing {
            alerts.retain(|a| a.status == AlertStatus::Firing);
        }
        if let Some(max) = filter.max_alerts {
            alerts.truncate(max);
        }

        Ok(alerts)
    }
}

/// Wire shape of a single Alertmanager v2 alert entry.
///
/// Shared with `core::webhook`: the webhook envelope's `alerts` array uses
/// this exact per-alert shape, so both ingestion paths
/// normalize through the same type rather than duplicating the mapping.
#[derive(Debug, Deserialize)]
pub(crate) struct RawAlert {
    fingerprint: Option<String>,
    #[serde(default)]
    labels: indexmap::IndexMap<String, String>,
    #[serde(default)]
    annotations: indexmap::IndexMap<String, String>,
    #[serde(rename = "startsAt")]
    starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt")]
    ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt", default = "Utc::now")]
    updated_at: DateTime<Utc>,
    status: RawStatus,
    #[serde(rename = "generatorURL")]
    generator_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawStatus {
    state: String,
}

impl RawAlert {
    /// Converts to an `Alert`, rejecting entries without a fingerprint
    ///. Never synthesizes one.
    pub(crate) fn into_alert(self) -> Result<Alert, &'static str> {
        let fingerprint = self.fingerprint.filter(|f| !f.is_empty()).ok_or("missing fingerprint")?;
        let status = match self.status.state.as_str() {
            "resolved" => AlertStatus::Resolved,
            _ => AlertStatus::Firing,
        };
        // endsAt is a zero-sentinel while firing in the Alertmanager wire
        // format; normalize the sentinel to None rather than storing it.
        let ends_at = self.ends_at.filter(|t| t.timestamp() > 0 && status == AlertStatus::Resolved);

        Ok(Alert {
            fingerprint,
            labels: self.labels,
            annotations: self.annotations,
            starts_at: self.starts_at,
            ends_at,
            updated_at: self.updated_at,
            status,
            generator_url: self.generator_url,
            enrichment: None,
            group_id: None,
        })
    }
}
