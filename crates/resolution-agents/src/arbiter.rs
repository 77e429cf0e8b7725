//! Escalation arbiters.
//!
//! - [`PolicyArbiter`]: local fallback. Folds in the constraints the stuck
//!   contradictions suggest; when there are none, forces the last candidate
//!   through with every unresolved contradiction marked as a gap.
//! - [`HttpArbiter`]: forwards the escalation to a remote service as JSON.

use std::time::Duration;

use async_trait::async_trait;
use resolution::{ArbiterError, EscalationArbiter, EscalationRequest, EscalationRuling};
use tracing::{info, warn};

/// Marker appended to forced outputs, one per unresolved contradiction.
pub fn gap_marker(description: &str) -> String {
    format!("[GAP: Unresolved contradiction - {}]", description)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyArbiter;

impl PolicyArbiter {
    pub fn new() -> Self {
        Self
    }

    fn annotate(request: &EscalationRequest) -> String {
        let base = request
            .last_candidate
            .clone()
            .unwrap_or_else(|| request.last_record.input_cause.clone());
        request.unresolved.iter().fold(base, |mut out, c| {
            out.push('\n');
            out.push_str(&gap_marker(&c.description));
            out
        })
    }
}

#[async_trait]
impl EscalationArbiter for PolicyArbiter {
    async fn arbitrate(&self, request: &EscalationRequest) -> Result<EscalationRuling, ArbiterError> {
        let constraints = request.suggested_constraints();
        if !constraints.is_empty() {
            info!(
                agent = %request.agent_id,
                record = %request.record_id,
                constraints = ?constraints,
                "Policy ruling: fold suggested constraints"
            );
            return Ok(EscalationRuling::AdditionalConstraints { constraints });
        }

        info!(
            agent = %request.agent_id,
            record = %request.record_id,
            unresolved = request.unresolved.len(),
            "Policy ruling: force output with gap markers"
        );
        Ok(EscalationRuling::ForcedOutput {
            output: Self::annotate(request),
        })
    }
}

/// Remote arbiter reached over HTTP.
///
/// POSTs the [`EscalationRequest`] as JSON and expects an
/// [`EscalationRuling`] back. Connection failures and 5xx responses are
/// `Unavailable`; any other non-success status or an unreadable body is
/// `Rejected`.
#[derive(Debug, Clone)]
pub struct HttpArbiter {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpArbiter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EscalationArbiter for HttpArbiter {
    async fn arbitrate(&self, request: &EscalationRequest) -> Result<EscalationRuling, ArbiterError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, error = %e, "Arbiter request failed");
                ArbiterError::Unavailable(format!("POST {}: {}", self.url, e))
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ArbiterError::Unavailable(format!(
                "{} returned {}",
                self.url, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArbiterError::Rejected(format!("{}: {}", status, body.trim())));
        }

        response
            .json::<EscalationRuling>()
            .await
            .map_err(|e| ArbiterError::Rejected(format!("unreadable ruling: {}", e)))
    }
}
