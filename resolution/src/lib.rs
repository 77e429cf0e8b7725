//! Recursive contradiction-resolution library
//!
//! This library provides:
//! - A per-agent Draft -> Critique -> Revise -> Commit cycle with a bounded
//!   escalation policy
//! - Contradiction and causation bookkeeping with coherence scoring
//! - A hash-chained, append-only ledger of committed records
//! - Multi-agent coordination with escalation to an external arbiter, and
//!   convergence of several agents' outputs into one shared decision
//!
//! # Collaborators
//!
//! Content generation and checking live outside the crate, behind traits:
//! - [`Evaluator`]: critiques a candidate against active constraints
//! - [`Composer`]: drafts and revises candidates
//! - [`EscalationArbiter`]: rules on stuck requests
//!
//! # Usage
//!
//! ```ignore
//! let ledger = ContradictionLedger::open("ledger.jsonl")?.shared();
//! let engine = CycleEngine::new("twin_a", CycleConfig::default(), evaluator, composer, ledger.clone())
//!     .with_constraints(["forbid:never"]);
//! let mut orchestrator = CoordinationOrchestrator::new(ledger, arbiter, OrchestratorConfig::default());
//! orchestrator.register(engine)?;
//! let submission = orchestrator.submit("twin_a", "input").await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod arbiter;
pub mod causation;
pub mod coherence;
pub mod contradiction;
pub mod cycle;
pub mod evaluator;
pub mod ledger;
pub mod orchestrator;
pub mod retry;

// Re-export key record types
pub use causation::{
    CausationRecord, CritiqueTally, CycleSummary, Gap, GapKind, GapNote, RecordError, RecordId,
    SealedRecord,
};
pub use coherence::CoherenceTracker;
pub use contradiction::{Contradiction, Severity, SeverityRule, SeverityRules, Violation};

// Re-export collaborator boundaries
pub use arbiter::{ArbiterError, EscalationArbiter, EscalationRequest, EscalationRuling};
pub use evaluator::{
    unavailable_violation, ComposeError, Composer, Constraint, ConstraintOrigin, ConstraintSet,
    Evaluation, Evaluator, EvaluatorError, PassthroughComposer, EVALUATOR_UNAVAILABLE_CONSTRAINT,
};

// Re-export cycle types
pub use cycle::{
    AgentSnapshot, AgentState, CommitReceipt, CycleConfig, CycleEngine, CycleError, CycleOutcome,
    CyclePhase, CycleResult, RequestContext,
};

// Re-export ledger types
pub use ledger::{
    ContradictionLedger, IntegrityViolation, LedgerEntry, LedgerError, SharedLedger,
    ViolationKind, GENESIS_HASH,
};

// Re-export orchestration types
pub use orchestrator::{
    AgentFailure, CoordinationOrchestrator, OrchestratorConfig, OrchestratorError,
    SharedDecision, StalemateReport, Submission, SubmitError, COORDINATOR_ID,
};
pub use retry::RetryPolicy;
