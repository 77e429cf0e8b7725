//! Causation records: the cause, reasoning and effect trail of one request.
//!
//! A record is created when a request enters DRAFT, grows with every
//! iteration, and is sealed once it is committed to the ledger. The output
//! may only be set while no contradiction is unresolved, unless the record
//! went through escalation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::contradiction::{Contradiction, SeverityRules, Violation};

/// Identifier of a causation record.
pub type RecordId = String;

/// Errors raised when a record's invariants would be broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("{count} contradiction(s) still unresolved and record is not escalated")]
    UnresolvedContradictions { count: usize },

    #[error("record has no output and is not escalated")]
    MissingOutput,
}

/// Kind of knowledge gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    InsufficientEvidence,
    ContradictorySources,
    OutOfScope,
}

/// A gap as reported by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapNote {
    pub description: String,
    pub context: String,
    pub kind: GapKind,
}

/// An explicitly marked knowledge gap. Recorded for audit, never blocks commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub id: String,
    pub description: String,
    pub context: String,
    pub kind: GapKind,
    pub detected_at_cycle: u32,
}

/// Counts produced by folding one critique pass into a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CritiqueTally {
    /// Contradictions seen for the first time in this pass.
    pub new: usize,
    /// Previously unresolved contradictions that no longer hold.
    pub resolved: usize,
    /// Contradictions still unresolved after this pass.
    pub unresolved: usize,
}

/// Per-request causation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausationRecord {
    pub record_id: RecordId,
    pub agent_id: String,
    pub input_cause: String,
    pub reasoning_steps: Vec<String>,
    pub contradictions_found: Vec<Contradiction>,
    pub contradictions_unresolved: Vec<Contradiction>,
    #[serde(default)]
    pub gaps: Vec<Gap>,
    #[serde(default)]
    pub learned_rules: Vec<String>,
    pub output_effect: Option<String>,
    pub coherence_delta: f64,
    pub escalated: bool,
    /// Record id of an earlier ledger entry this record corrects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrects: Option<RecordId>,
    pub created_at: DateTime<Utc>,
}

impl CausationRecord {
    pub fn new(agent_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            input_cause: input.into(),
            reasoning_steps: Vec::new(),
            contradictions_found: Vec::new(),
            contradictions_unresolved: Vec::new(),
            gaps: Vec::new(),
            learned_rules: Vec::new(),
            output_effect: None,
            coherence_delta: 0.0,
            escalated: false,
            corrects: None,
            created_at: Utc::now(),
        }
    }

    /// Mark this record as a correction of an earlier one.
    pub fn correcting(mut self, original: impl Into<RecordId>) -> Self {
        self.corrects = Some(original.into());
        self
    }

    pub fn push_step(&mut self, step: impl Into<String>) {
        self.reasoning_steps.push(step.into());
    }

    pub fn push_learned_rule(&mut self, rule: impl Into<String>) {
        self.learned_rules.push(rule.into());
    }

    pub fn unresolved(&self) -> &[Contradiction] {
        &self.contradictions_unresolved
    }

    pub fn resolved_count(&self) -> usize {
        self.contradictions_found.iter().filter(|c| c.resolved).count()
    }

    /// Fold one critique pass into the record.
    ///
    /// Unresolved contradictions that were not reported again are marked
    /// resolved; reported violations that match no unresolved contradiction
    /// become new contradictions.
    pub fn absorb(
        &mut self,
        violations: Vec<Violation>,
        gaps: Vec<GapNote>,
        cycle: u32,
        rules: &SeverityRules,
    ) -> CritiqueTally {
        let mut tally = CritiqueTally::default();

        for contradiction in self.contradictions_found.iter_mut().filter(|c| !c.resolved) {
            if !violations.iter().any(|v| contradiction.matches(v)) {
                contradiction.mark_resolved(cycle);
                tally.resolved += 1;
            }
        }

        for violation in violations {
            let known = self
                .contradictions_found
                .iter()
                .any(|c| !c.resolved && c.matches(&violation));
            if known {
                continue;
            }
            self.open(violation, cycle, rules);
            tally.new += 1;
        }

        for note in gaps {
            let seen = self
                .gaps
                .iter()
                .any(|g| g.description == note.description && g.context == note.context);
            if seen {
                continue;
            }
            let id = format!("gap-{}-{}-{}", self.short_id(), cycle, self.gaps.len());
            self.gaps.push(Gap {
                id,
                description: note.description,
                context: note.context,
                kind: note.kind,
                detected_at_cycle: cycle,
            });
        }

        self.refresh_unresolved();
        tally.unresolved = self.contradictions_unresolved.len();
        tally
    }

    /// Fold a pass that produced no verdict. Open contradictions stay open
    /// and `blocking` is added unless it is already open; nothing resolves.
    pub fn hold_open(
        &mut self,
        blocking: Violation,
        cycle: u32,
        rules: &SeverityRules,
    ) -> CritiqueTally {
        let mut tally = CritiqueTally::default();
        let known = self
            .contradictions_found
            .iter()
            .any(|c| !c.resolved && c.matches(&blocking));
        if !known {
            self.open(blocking, cycle, rules);
            tally.new = 1;
        }
        self.refresh_unresolved();
        tally.unresolved = self.contradictions_unresolved.len();
        tally
    }

    /// Set the output. Refused while contradictions are open on a
    /// non-escalated record.
    pub fn set_output(&mut self, output: impl Into<String>) -> Result<(), RecordError> {
        if !self.escalated && !self.contradictions_unresolved.is_empty() {
            return Err(RecordError::UnresolvedContradictions {
                count: self.contradictions_unresolved.len(),
            });
        }
        self.output_effect = Some(output.into());
        Ok(())
    }

    pub fn mark_escalated(&mut self) {
        self.escalated = true;
    }

    /// Seal the record for the ledger.
    pub fn seal(self) -> Result<SealedRecord, RecordError> {
        if !self.escalated {
            if !self.contradictions_unresolved.is_empty() {
                return Err(RecordError::UnresolvedContradictions {
                    count: self.contradictions_unresolved.len(),
                });
            }
            if self.output_effect.is_none() {
                return Err(RecordError::MissingOutput);
            }
        }
        Ok(SealedRecord(self))
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            record_id: self.record_id.clone(),
            agent_id: self.agent_id.clone(),
            reasoning_steps: self.reasoning_steps.len(),
            contradictions_detected: self.contradictions_found.len(),
            contradictions_resolved: self.resolved_count(),
            contradictions_unresolved: self.contradictions_unresolved.len(),
            gaps_identified: self.gaps.len(),
            learned_rules: self.learned_rules.clone(),
            committed: self.output_effect.is_some(),
            escalated: self.escalated,
        }
    }

    fn open(&mut self, violation: Violation, cycle: u32, rules: &SeverityRules) {
        let id = format!(
            "contra-{}-{}-{}",
            self.short_id(),
            cycle,
            self.contradictions_found.len()
        );
        self.contradictions_found
            .push(Contradiction::from_violation(id, violation, cycle, rules));
    }

    fn refresh_unresolved(&mut self) {
        self.contradictions_unresolved = self
            .contradictions_found
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect();
    }

    fn short_id(&self) -> &str {
        self.record_id.get(..8).unwrap_or(&self.record_id)
    }
}

/// A record that passed sealing. Only the ledger stores these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedRecord(CausationRecord);

impl SealedRecord {
    pub fn into_inner(self) -> CausationRecord {
        self.0
    }
}

impl std::ops::Deref for SealedRecord {
    type Target = CausationRecord;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Compact audit view of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub record_id: RecordId,
    pub agent_id: String,
    pub reasoning_steps: usize,
    pub contradictions_detected: usize,
    pub contradictions_resolved: usize,
    pub contradictions_unresolved: usize,
    pub gaps_identified: usize,
    pub learned_rules: Vec<String>,
    pub committed: bool,
    pub escalated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(constraint: &str) -> Violation {
        Violation::new(constraint, format!("{} violated", constraint))
    }

    #[test]
    fn test_absorb_tracks_new_and_resolved() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");

        let tally = record.absorb(vec![v("require:a"), v("forbid:b")], vec![], 1, &rules);
        assert_eq!(tally, CritiqueTally { new: 2, resolved: 0, unresolved: 2 });

        let tally = record.absorb(vec![v("forbid:b")], vec![], 2, &rules);
        assert_eq!(tally, CritiqueTally { new: 0, resolved: 1, unresolved: 1 });

        let tally = record.absorb(vec![], vec![], 3, &rules);
        assert_eq!(tally, CritiqueTally { new: 0, resolved: 1, unresolved: 0 });
        assert_eq!(record.contradictions_found.len(), 2);
        assert_eq!(record.resolved_count(), 2);
    }

    #[test]
    fn test_absorb_deduplicates_within_a_pass() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        let tally = record.absorb(vec![v("require:a"), v("require:a")], vec![], 1, &rules);
        assert_eq!(tally.new, 1);
        assert_eq!(record.unresolved().len(), 1);
    }

    #[test]
    fn test_reappearing_condition_is_a_new_contradiction() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        record.absorb(vec![v("require:a")], vec![], 1, &rules);
        record.absorb(vec![], vec![], 2, &rules);
        let tally = record.absorb(vec![v("require:a")], vec![], 3, &rules);
        assert_eq!(tally.new, 1);
        assert_eq!(record.contradictions_found.len(), 2);
        assert_ne!(record.contradictions_found[0].id, record.contradictions_found[1].id);
    }

    #[test]
    fn test_hold_open_resolves_nothing() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        record.absorb(vec![v("require:a")], vec![], 1, &rules);

        let outage = v("evaluator:available").with_severity(crate::contradiction::Severity::Blocking);
        let tally = record.hold_open(outage.clone(), 2, &rules);
        assert_eq!(tally, CritiqueTally { new: 1, resolved: 0, unresolved: 2 });
        assert!(record.contradictions_found[0].resolved_at_cycle.is_none());

        // A second outage keeps matching the same blocking contradiction.
        let tally = record.hold_open(outage, 3, &rules);
        assert_eq!(tally, CritiqueTally { new: 0, resolved: 0, unresolved: 2 });
        assert_eq!(record.resolved_count(), 0);
    }

    #[test]
    fn test_gaps_are_recorded_once() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        let gap = GapNote {
            description: "unclear".into(),
            context: "the cause is unclear".into(),
            kind: GapKind::InsufficientEvidence,
        };
        record.absorb(vec![], vec![gap.clone()], 1, &rules);
        record.absorb(vec![], vec![gap], 2, &rules);
        assert_eq!(record.gaps.len(), 1);
        assert_eq!(record.gaps[0].detected_at_cycle, 1);
    }

    #[test]
    fn test_output_refused_while_unresolved() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        record.absorb(vec![v("require:a")], vec![], 1, &rules);

        let err = record.set_output("out").unwrap_err();
        assert_eq!(err, RecordError::UnresolvedContradictions { count: 1 });

        record.mark_escalated();
        record.set_output("forced").unwrap();
        let sealed = record.seal().unwrap();
        assert!(sealed.escalated);
        assert_eq!(sealed.unresolved().len(), 1);
    }

    #[test]
    fn test_seal_requires_output_unless_escalated() {
        let record = CausationRecord::new("twin_a", "input");
        assert_eq!(record.clone().seal().unwrap_err(), RecordError::MissingOutput);

        let mut escalated = record;
        escalated.mark_escalated();
        assert!(escalated.seal().is_ok());
    }

    #[test]
    fn test_summary_counts() {
        let rules = SeverityRules::default();
        let mut record = CausationRecord::new("twin_a", "input");
        record.push_step("draft");
        record.absorb(vec![v("require:a")], vec![], 1, &rules);
        record.absorb(vec![], vec![], 2, &rules);
        record.push_learned_rule("iteration 2: resolved 1 contradiction(s) by revision");
        record.set_output("done").unwrap();

        let summary = record.summary();
        assert_eq!(summary.contradictions_detected, 1);
        assert_eq!(summary.contradictions_resolved, 1);
        assert_eq!(summary.contradictions_unresolved, 0);
        assert_eq!(summary.learned_rules.len(), 1);
        assert!(summary.committed);
        assert!(!summary.escalated);
    }

    #[test]
    fn test_sealed_record_serializes_transparently() {
        let mut record = CausationRecord::new("twin_a", "input").correcting("orig-1");
        record.set_output("ok").unwrap();
        let sealed = record.clone().seal().unwrap();
        let a = serde_json::to_value(&sealed).unwrap();
        let b = serde_json::to_value(&record).unwrap();
        assert_eq!(a, b);
        assert_eq!(a["corrects"], "orig-1");
        assert_eq!(a["inputCause"], "input");
    }
}
