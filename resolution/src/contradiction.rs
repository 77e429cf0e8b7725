//! Contradictions: flagged inconsistencies between a candidate and its constraints.
//!
//! Evaluators report [`Violation`]s. The cycle engine turns them into
//! [`Contradiction`]s with a stable id, the cycle they were detected in, and a
//! severity assigned by [`SeverityRules`] when the evaluator left it open.

use serde::{Deserialize, Serialize};

/// How serious a contradiction is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic inconsistency.
    Minor,
    /// Real inconsistency; the default for anything unclassifiable.
    Major,
    /// Must never be committed unresolved.
    Blocking,
}

impl Severity {
    /// Whether this severity blocks commit on its own.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Blocking)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// A violation as reported by an evaluator, before the engine tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// The constraint that was violated (e.g. `forbid:never`).
    pub constraint: String,
    /// What is inconsistent.
    pub description: String,
    /// Severity, if the evaluator knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// A constraint that would make the violation go away, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_constraint: Option<String>,
}

impl Violation {
    pub fn new(constraint: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            constraint: constraint.into(),
            description: description.into(),
            severity: None,
            suggested_constraint: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_suggestion(mut self, constraint: impl Into<String>) -> Self {
        self.suggested_constraint = Some(constraint.into());
        self
    }
}

/// A tracked contradiction. Never deleted; only ever marked resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub id: String,
    pub description: String,
    pub constraint: String,
    pub severity: Severity,
    pub detected_at_cycle: u32,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_constraint: Option<String>,
}

impl Contradiction {
    /// Track a violation under the given id.
    pub fn from_violation(id: String, violation: Violation, cycle: u32, rules: &SeverityRules) -> Self {
        let severity = violation
            .severity
            .unwrap_or_else(|| rules.classify(&violation.constraint));
        Self {
            id,
            description: violation.description,
            constraint: violation.constraint,
            severity,
            detected_at_cycle: cycle,
            resolved: false,
            resolved_at_cycle: None,
            suggested_constraint: violation.suggested_constraint,
        }
    }

    /// Whether a freshly reported violation describes the same condition.
    pub fn matches(&self, violation: &Violation) -> bool {
        self.constraint == violation.constraint && self.description == violation.description
    }

    /// Mark the violating condition as no longer holding.
    pub fn mark_resolved(&mut self, cycle: u32) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at_cycle = Some(cycle);
        }
    }
}

impl std::fmt::Display for Contradiction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}][{}] {} (cycle {})",
            self.severity, self.constraint, self.description, self.detected_at_cycle
        )
    }
}

/// Prefix rule mapping a constraint family to a severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub prefix: String,
    pub severity: Severity,
}

/// Severity classification by constraint prefix. First match wins; anything
/// that matches no rule is [`Severity::Major`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRules {
    pub rules: Vec<SeverityRule>,
}

impl SeverityRules {
    pub fn classify(&self, constraint: &str) -> Severity {
        self.rules
            .iter()
            .find(|rule| constraint.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.severity)
            .unwrap_or(Severity::Major)
    }
}

impl Default for SeverityRules {
    fn default() -> Self {
        let rule = |prefix: &str, severity| SeverityRule {
            prefix: prefix.to_string(),
            severity,
        };
        Self {
            rules: vec![
                rule("forbid:", Severity::Blocking),
                rule("evaluator:", Severity::Blocking),
                rule("require:", Severity::Major),
                rule("consistency:", Severity::Major),
                rule("max_sentences:", Severity::Minor),
            ],
        }
    }
}
