//! Escalation arbiter boundary.
//!
//! A stuck agent hands its last record to an [`EscalationArbiter`] and
//! waits for an [`EscalationRuling`]. The arbiter itself (human, model
//! ensemble, policy table) lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::causation::{CausationRecord, RecordId};
use crate::contradiction::Contradiction;

/// Everything an arbiter needs to rule on a stuck request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub agent_id: String,
    pub record_id: RecordId,
    pub last_record: CausationRecord,
    pub unresolved: Vec<Contradiction>,
    /// Candidate produced by the last DRAFT or REVISE.
    pub last_candidate: Option<String>,
    pub stuck_counter: u32,
    pub iterations: u32,
    pub escalated_at: DateTime<Utc>,
}

impl EscalationRequest {
    /// Constraints suggested by the unresolved contradictions, deduplicated.
    pub fn suggested_constraints(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for suggestion in self
            .unresolved
            .iter()
            .filter_map(|c| c.suggested_constraint.as_ref())
        {
            if !out.contains(suggestion) {
                out.push(suggestion.clone());
            }
        }
        out
    }
}

/// An arbiter's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationRuling {
    /// Retry the request from DRAFT with these constraints added.
    AdditionalConstraints { constraints: Vec<String> },
    /// Commit this output as-is; the record is marked escalated.
    ForcedOutput { output: String },
}

impl std::fmt::Display for EscalationRuling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdditionalConstraints { constraints } => {
                write!(f, "additional_constraints({})", constraints.len())
            }
            Self::ForcedOutput { .. } => write!(f, "forced_output"),
        }
    }
}

/// Errors from an arbiter call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    #[error("arbiter unavailable: {0}")]
    Unavailable(String),

    #[error("arbiter rejected the escalation: {0}")]
    Rejected(String),
}

/// Resolves escalations.
#[async_trait]
pub trait EscalationArbiter: Send + Sync {
    async fn arbitrate(&self, request: &EscalationRequest) -> Result<EscalationRuling, ArbiterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contradiction::{SeverityRules, Violation};

    #[test]
    fn test_ruling_wire_format() {
        let ruling = EscalationRuling::AdditionalConstraints {
            constraints: vec!["forbid:never".into()],
        };
        let json = serde_json::to_value(&ruling).unwrap();
        assert_eq!(json["kind"], "additional_constraints");
        assert_eq!(json["constraints"][0], "forbid:never");

        let forced: EscalationRuling =
            serde_json::from_str(r#"{"kind":"forced_output","output":"final"}"#).unwrap();
        assert_eq!(
            forced,
            EscalationRuling::ForcedOutput {
                output: "final".into()
            }
        );
    }

    #[test]
    fn test_suggested_constraints_are_deduplicated() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        record.absorb(
            vec![
                Violation::new("consistency:always/never", "a").with_suggestion("forbid:never"),
                Violation::new("consistency:always/never", "b").with_suggestion("forbid:never"),
                Violation::new("require:x", "x missing"),
            ],
            vec![],
            1,
            &rules,
        );
        let request = EscalationRequest {
            agent_id: "twin_a".into(),
            record_id: record.record_id.clone(),
            unresolved: record.unresolved().to_vec(),
            last_record: record,
            last_candidate: None,
            stuck_counter: 3,
            iterations: 3,
            escalated_at: Utc::now(),
        };
        assert_eq!(request.suggested_constraints(), vec!["forbid:never".to_string()]);
    }
}
