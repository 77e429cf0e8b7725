//! Collaborator boundaries used inside a cycle.
//!
//! - [`Evaluator`] backs the CRITIQUE step.
//! - [`Composer`] backs DRAFT and REVISE (content generation lives outside
//!   this crate).
//!
//! Both are async traits so implementations can call out to remote services;
//! the engine applies its own timeout and retry policy around the evaluator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::causation::GapNote;
use crate::contradiction::{Contradiction, Severity, Violation};

/// Constraint family reported when the evaluator cannot be reached.
pub const EVALUATOR_UNAVAILABLE_CONSTRAINT: &str = "evaluator:available";

/// Blocking violation recorded for a pass whose evaluator never answered.
/// The description is fixed so repeated outages keep matching the same
/// contradiction.
pub fn unavailable_violation() -> Violation {
    Violation::new(
        EVALUATOR_UNAVAILABLE_CONSTRAINT,
        "evaluator did not return a verdict",
    )
    .with_severity(Severity::Blocking)
}

/// Errors from an evaluator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluatorError {
    /// Transient failure; the engine retries with backoff.
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),

    /// The candidate cannot be evaluated at all. Never retried.
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Errors from a composer call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("composer failed: {0}")]
    Failed(String),
}

/// Result of one critique pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub gaps: Vec<GapNote>,
}

impl Evaluation {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn with_violations(violations: Vec<Violation>) -> Self {
        Self {
            violations,
            gaps: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Where an active constraint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOrigin {
    /// Declared for the agent role.
    Declared,
    /// Folded in from an arbiter ruling for the current request.
    Ruling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub text: String,
    pub origin: ConstraintOrigin,
}

/// The active constraint set for one cycle. Duplicate texts are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_declared<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for text in texts {
            set.push(text, ConstraintOrigin::Declared);
        }
        set
    }

    /// Add a constraint; returns false when the text is already active.
    pub fn push(&mut self, text: impl Into<String>, origin: ConstraintOrigin) -> bool {
        let text = text.into();
        if text.trim().is_empty() || self.contains(&text) {
            return false;
        }
        self.constraints.push(Constraint { text, origin });
        true
    }

    pub fn extend(&mut self, other: &ConstraintSet) {
        for c in &other.constraints {
            self.push(c.text.clone(), c.origin);
        }
    }

    pub fn contains(&self, text: &str) -> bool {
        self.constraints.iter().any(|c| c.text == text)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().map(|c| c.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

/// CRITIQUE collaborator.
///
/// Repeated calls with identical candidate and constraints must report
/// violations of at least the same severity class.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        candidate: &str,
        constraints: &ConstraintSet,
    ) -> Result<Evaluation, EvaluatorError>;
}

/// DRAFT and REVISE collaborator.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Produce a candidate from the request input and active constraints.
    async fn draft(&self, input: &str, constraints: &ConstraintSet) -> Result<String, ComposeError>;

    /// Rewrite a candidate against its unresolved contradictions.
    async fn revise(
        &self,
        candidate: &str,
        unresolved: &[Contradiction],
        constraints: &ConstraintSet,
    ) -> Result<String, ComposeError>;
}

/// Drafts the input verbatim and never rewrites it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughComposer;

#[async_trait]
impl Composer for PassthroughComposer {
    async fn draft(&self, input: &str, _constraints: &ConstraintSet) -> Result<String, ComposeError> {
        Ok(input.to_string())
    }

    async fn revise(
        &self,
        candidate: &str,
        _unresolved: &[Contradiction],
        _constraints: &ConstraintSet,
    ) -> Result<String, ComposeError> {
        Ok(candidate.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_set_ignores_duplicates_and_blanks() {
        let mut set = ConstraintSet::from_declared(["forbid:x", "forbid:x"]);
        assert_eq!(set.len(), 1);
        assert!(!set.push("  ", ConstraintOrigin::Ruling));
        assert!(set.push("require:y", ConstraintOrigin::Ruling));
        assert!(!set.push("require:y", ConstraintOrigin::Declared));
        assert_eq!(set.texts().collect::<Vec<_>>(), vec!["forbid:x", "require:y"]);
    }

    #[test]
    fn test_unavailable_violation_is_blocking() {
        let violation = unavailable_violation();
        assert_eq!(violation.constraint, EVALUATOR_UNAVAILABLE_CONSTRAINT);
        assert_eq!(violation.severity, Some(Severity::Blocking));
    }

    #[tokio::test]
    async fn test_passthrough_composer() {
        let composer = PassthroughComposer;
        let set = ConstraintSet::new();
        assert_eq!(composer.draft("hello", &set).await.unwrap(), "hello");
        assert_eq!(composer.revise("hello", &[], &set).await.unwrap(), "hello");
    }
}
