//! Coordination orchestrator: owns one cycle engine per agent role and
//! routes escalations to the arbiter.
//!
//! Each engine sits behind its own async mutex, so a single agent handles
//! one request at a time while different agents run concurrently. The
//! ledger is the only state they share.
//!
//! [`converge`](CoordinationOrchestrator::converge) turns a broadcast into
//! one shared decision: the committed outputs are checked against each
//! other, and a cross-agent conflict goes to the arbiter like any stuck
//! cycle. The check only ever sees [`Submission`]s, never engine state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::arbiter::{ArbiterError, EscalationArbiter, EscalationRequest, EscalationRuling};
use crate::causation::{CausationRecord, RecordId};
use crate::contradiction::{Contradiction, SeverityRules};
use crate::cycle::{
    AgentSnapshot, CommitReceipt, CycleEngine, CycleError, CycleOutcome, CyclePhase,
    RequestContext,
};
use crate::evaluator::{unavailable_violation, ConstraintSet, Evaluation, Evaluator, EvaluatorError};
use crate::ledger::{IntegrityViolation, LedgerEntry, SharedLedger};

/// Agent id on ledger records written by the cross-agent check.
pub const COORDINATOR_ID: &str = "coordinator";

/// Configuration for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long to wait for an arbiter ruling, in milliseconds.
    pub arbiter_timeout_ms: u64,
    /// Stuck counter at which an in-flight agent counts as stalled.
    pub stall_threshold: u32,
    /// Timeout for one cross-agent check, in milliseconds.
    pub cross_check_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            arbiter_timeout_ms: 30_000,
            stall_threshold: 1,
            cross_check_timeout_ms: 5_000,
        }
    }
}

/// A committed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub agent_id: String,
    pub receipt: CommitReceipt,
    /// Ruling applied, if the request went through escalation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruling: Option<EscalationRuling>,
}

/// An agent whose part of a broadcast failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFailure {
    pub agent_id: String,
    pub error: String,
}

/// Outcome of [`CoordinationOrchestrator::converge`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDecision {
    pub input: String,
    /// Latest committed submission per agent, in agent order.
    pub submissions: Vec<Submission>,
    pub failures: Vec<AgentFailure>,
    /// Cross-agent contradictions found before any ruling.
    pub conflicts: Vec<Contradiction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruling: Option<EscalationRuling>,
    pub decision: String,
    /// Ledger entry of the coordinator record; only written when the
    /// outputs conflicted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

/// Errors from [`CoordinationOrchestrator::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error(
        "agent {agent_id} escalated twice for record {record_id}; {} contradiction(s) unresolved",
        .unresolved.len()
    )]
    UnresolvableContradiction {
        agent_id: String,
        record_id: RecordId,
        unresolved: Vec<Contradiction>,
    },

    #[error("arbiter did not rule within {timeout_ms}ms for agent {agent_id} (record {record_id})")]
    EscalationTimeout {
        agent_id: String,
        record_id: RecordId,
        timeout_ms: u64,
    },

    #[error("arbiter failed for agent {agent_id} (record {record_id}): {source}")]
    ArbiterFailed {
        agent_id: String,
        record_id: RecordId,
        #[source]
        source: ArbiterError,
    },

    #[error("cancelled during {phase}")]
    Cancelled { phase: CyclePhase },

    #[error("no agent committed an output ({failed} failed)")]
    NothingCommitted { failed: usize },

    #[error(transparent)]
    Cycle(CycleError),
}

impl From<CycleError> for SubmitError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::MalformedInput(msg) => Self::MalformedInput(msg),
            CycleError::Cancelled { phase } => Self::Cancelled { phase },
            other => Self::Cycle(other),
        }
    }
}

/// Errors from orchestrator management calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("agent {0} is already registered")]
    DuplicateAgent(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {0} writes to a different ledger")]
    ForeignLedger(String),
}

/// Every in-flight agent is stalled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalemateReport {
    pub agents: Vec<AgentSnapshot>,
    pub detected_at: DateTime<Utc>,
}

struct AgentSlot {
    engine: Mutex<CycleEngine>,
    snapshots: watch::Receiver<AgentSnapshot>,
}

/// Runs N cycle engines against one ledger and one arbiter.
pub struct CoordinationOrchestrator {
    agents: BTreeMap<String, AgentSlot>,
    arbiter: Arc<dyn EscalationArbiter>,
    cross_check: Option<Arc<dyn Evaluator>>,
    ledger: SharedLedger,
    config: OrchestratorConfig,
}

impl CoordinationOrchestrator {
    pub fn new(
        ledger: SharedLedger,
        arbiter: Arc<dyn EscalationArbiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            agents: BTreeMap::new(),
            arbiter,
            cross_check: None,
            ledger,
            config,
        }
    }

    /// Evaluator that checks committed outputs of different agents against
    /// each other in [`converge`](Self::converge). Without one, outputs are
    /// merged unchecked.
    pub fn with_cross_check(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.cross_check = Some(evaluator);
        self
    }

    /// Add an engine. It must write to this orchestrator's ledger.
    pub fn register(&mut self, engine: CycleEngine) -> Result<(), OrchestratorError> {
        let agent_id = engine.agent_id().to_string();
        if self.agents.contains_key(&agent_id) {
            return Err(OrchestratorError::DuplicateAgent(agent_id));
        }
        if !Arc::ptr_eq(engine.ledger(), &self.ledger) {
            return Err(OrchestratorError::ForeignLedger(agent_id));
        }

        let snapshots = engine.subscribe();
        info!(agent = %agent_id, "Agent registered");
        self.agents.insert(
            agent_id,
            AgentSlot {
                engine: Mutex::new(engine),
                snapshots,
            },
        );
        Ok(())
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Submit one request to one agent.
    pub async fn submit(&self, agent_id: &str, input: &str) -> Result<Submission, SubmitError> {
        self.submit_with_cancel(agent_id, input, &CancellationToken::new())
            .await
    }

    /// Submit with a cancellation token. Cancellation takes effect only
    /// while the agent drafts or critiques.
    pub async fn submit_with_cancel(
        &self,
        agent_id: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<Submission, SubmitError> {
        self.submit_in_context(agent_id, input, RequestContext::default(), cancel)
            .await
    }

    /// Submit with request-scoped constraints on top of the agent's own.
    pub async fn submit_in_context(
        &self,
        agent_id: &str,
        input: &str,
        context: RequestContext,
        cancel: &CancellationToken,
    ) -> Result<Submission, SubmitError> {
        let slot = self
            .agents
            .get(agent_id)
            .ok_or_else(|| SubmitError::UnknownAgent(agent_id.to_string()))?;
        let mut engine = slot.engine.lock().await;

        let request = match engine.run_cycle_with(input, context, cancel).await? {
            CycleOutcome::Committed(receipt) => {
                return Ok(Submission {
                    agent_id: agent_id.to_string(),
                    receipt,
                    ruling: None,
                })
            }
            CycleOutcome::Escalated(request) => request,
        };

        let ruling = match self.arbitrate(&request).await {
            Ok(ruling) => ruling,
            Err(err) => {
                record_failure(&mut engine, &err);
                return Err(err);
            }
        };

        match engine.resume(ruling.clone(), cancel).await? {
            CycleOutcome::Committed(receipt) => Ok(Submission {
                agent_id: agent_id.to_string(),
                receipt,
                ruling: Some(ruling),
            }),
            CycleOutcome::Escalated(second) => {
                let err = SubmitError::UnresolvableContradiction {
                    agent_id: agent_id.to_string(),
                    record_id: second.record_id.clone(),
                    unresolved: second.unresolved.clone(),
                };
                record_failure(&mut engine, &err);
                Err(err)
            }
        }
    }

    /// Send the same input to every agent concurrently.
    pub async fn submit_all(&self, input: &str) -> Vec<(String, Result<Submission, SubmitError>)> {
        let runs = self.agents.keys().map(|agent_id| async move {
            let result = self.submit(agent_id, input).await;
            (agent_id.clone(), result)
        });
        join_all(runs).await
    }

    /// Broadcast `input` and reconcile the committed outputs into one
    /// decision.
    ///
    /// Conflicting outputs escalate once. `AdditionalConstraints` re-runs
    /// every committed agent with the ruling's constraints, each new record
    /// correcting the agent's earlier one, and checks again; a second
    /// conflict is `UnresolvableContradiction`. `ForcedOutput` becomes the
    /// decision. Every escalated check lands on the ledger as a
    /// [`COORDINATOR_ID`] record, with no output when it failed.
    pub async fn converge(&self, input: &str) -> Result<SharedDecision, SubmitError> {
        let (mut submissions, mut failures) = partition(self.submit_all(input).await);
        if submissions.is_empty() {
            return Err(SubmitError::NothingCommitted {
                failed: failures.len(),
            });
        }

        let combined = merge_outputs(&submissions);
        let evaluation = self.cross_check(&submissions, &combined).await?;
        if evaluation.is_clean() {
            info!(agents = submissions.len(), "Outputs agree");
            return Ok(SharedDecision {
                input: input.to_string(),
                submissions,
                failures,
                conflicts: Vec::new(),
                ruling: None,
                decision: combined,
                sequence_number: None,
            });
        }

        let rules = SeverityRules::default();
        let mut record = CausationRecord::new(COORDINATOR_ID, input);
        record.push_step(format!(
            "cross-check: {} output(s) from {}",
            submissions.len(),
            agent_list(&submissions)
        ));
        record.absorb(evaluation.violations, evaluation.gaps, 1, &rules);
        let conflicts = record.unresolved().to_vec();
        record.mark_escalated();
        warn!(conflicts = conflicts.len(), "Agent outputs conflict");

        let request = EscalationRequest {
            agent_id: COORDINATOR_ID.to_string(),
            record_id: record.record_id.clone(),
            unresolved: conflicts.clone(),
            last_record: record.clone(),
            last_candidate: Some(combined),
            stuck_counter: 1,
            iterations: 1,
            escalated_at: Utc::now(),
        };
        let ruling = match self.arbitrate(&request).await {
            Ok(ruling) => ruling,
            Err(err) => {
                record.push_step(format!("failed: {}", err));
                self.append_coordinator(record)?;
                return Err(err);
            }
        };

        let decision = match &ruling {
            EscalationRuling::ForcedOutput { output } => {
                record.push_step("arbiter ruling: forced output");
                output.clone()
            }
            EscalationRuling::AdditionalConstraints { constraints } => {
                record.push_step(format!(
                    "arbiter ruling: {} additional constraint(s); re-running {} agent(s)",
                    constraints.len(),
                    submissions.len()
                ));
                let reruns = submissions.iter().map(|previous| {
                    let context = RequestContext {
                        constraints: constraints.clone(),
                        corrects: Some(previous.receipt.record_id.clone()),
                    };
                    let agent_id = previous.agent_id.clone();
                    async move {
                        let result = self
                            .submit_in_context(&agent_id, input, context, &CancellationToken::new())
                            .await;
                        (agent_id, result)
                    }
                });
                let (rerun, rerun_failures) = partition(join_all(reruns).await);
                failures.extend(rerun_failures);
                if rerun.is_empty() {
                    record.push_step("failed: no agent committed after the ruling");
                    self.append_coordinator(record)?;
                    return Err(SubmitError::NothingCommitted {
                        failed: failures.len(),
                    });
                }
                submissions = rerun;

                let combined = merge_outputs(&submissions);
                let second = self.cross_check(&submissions, &combined).await?;
                let tally = record.absorb(second.violations, second.gaps, 2, &rules);
                record.push_step(format!(
                    "cross-check 2: {} new, {} resolved, {} unresolved",
                    tally.new, tally.resolved, tally.unresolved
                ));
                if tally.unresolved > 0 {
                    let err = SubmitError::UnresolvableContradiction {
                        agent_id: COORDINATOR_ID.to_string(),
                        record_id: record.record_id.clone(),
                        unresolved: record.unresolved().to_vec(),
                    };
                    record.push_step(format!("failed: {}", err));
                    self.append_coordinator(record)?;
                    return Err(err);
                }
                combined
            }
        };

        record.set_output(decision.clone()).map_err(CycleError::from)?;
        let entry = self.append_coordinator(record)?;
        info!(
            seq = entry.sequence_number(),
            ruling = %ruling,
            agents = submissions.len(),
            "Shared decision committed"
        );
        Ok(SharedDecision {
            input: input.to_string(),
            submissions,
            failures,
            conflicts,
            ruling: Some(ruling),
            decision,
            sequence_number: Some(entry.sequence_number()),
        })
    }

    /// Ledger entries from `sequence` on.
    pub fn ledger_from(&self, sequence: u64) -> impl Stream<Item = Arc<LedgerEntry>> + Send + 'static {
        self.ledger.stream_from(sequence)
    }

    pub fn verify_ledger(&self) -> Result<(), IntegrityViolation> {
        self.ledger.verify_integrity()
    }

    /// Coherence of one agent, from its latest snapshot.
    pub fn coherence(&self, agent_id: &str) -> Option<f64> {
        self.agents
            .get(agent_id)
            .map(|slot| slot.snapshots.borrow().coherence)
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents
            .get(agent_id)
            .map(|slot| slot.snapshots.borrow().clone())
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents
            .values()
            .map(|slot| slot.snapshots.borrow().clone())
            .collect()
    }

    /// Watch one agent's snapshots.
    pub fn subscribe(&self, agent_id: &str) -> Option<watch::Receiver<AgentSnapshot>> {
        self.agents.get(agent_id).map(|slot| slot.snapshots.clone())
    }

    /// Report when every agent with a request in flight is stalled.
    pub fn detect_stalemate(&self) -> Option<StalemateReport> {
        let in_flight: Vec<AgentSnapshot> = self
            .snapshots()
            .into_iter()
            .filter(|s| s.phase.is_active() || s.phase == CyclePhase::Escalated)
            .collect();
        if in_flight.is_empty() {
            return None;
        }

        let threshold = self.config.stall_threshold;
        let all_stalled = in_flight
            .iter()
            .all(|s| s.phase == CyclePhase::Escalated || s.stuck_counter >= threshold);
        if !all_stalled {
            return None;
        }

        warn!(agents = in_flight.len(), "Stalemate: every in-flight agent is stalled");
        Some(StalemateReport {
            agents: in_flight,
            detected_at: Utc::now(),
        })
    }

    /// Start a new incarnation of one agent, resetting its coherence.
    pub async fn reinitialize(&self, agent_id: &str) -> Result<(), OrchestratorError> {
        let slot = self
            .agents
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.to_string()))?;
        slot.engine.lock().await.reinitialize();
        Ok(())
    }

    /// Check committed outputs against each other. Identical outputs, a
    /// single agent, or no configured evaluator mean nothing to check. An
    /// evaluator that never answers yields the blocking
    /// `evaluator:available` conflict.
    async fn cross_check(
        &self,
        submissions: &[Submission],
        combined: &str,
    ) -> Result<Evaluation, SubmitError> {
        let Some(evaluator) = &self.cross_check else {
            return Ok(Evaluation::clean());
        };
        if distinct_outputs(submissions).len() < 2 {
            return Ok(Evaluation::clean());
        }

        let timeout_ms = self.config.cross_check_timeout_ms;
        let checked = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            evaluator.evaluate(combined, &ConstraintSet::new()),
        )
        .await;
        match checked {
            Ok(Ok(evaluation)) => Ok(evaluation),
            Ok(Err(EvaluatorError::Malformed(msg))) => Err(SubmitError::MalformedInput(msg)),
            Ok(Err(EvaluatorError::Unavailable(reason))) => {
                warn!(reason = %reason, "Cross-check evaluator unavailable");
                Ok(Evaluation::with_violations(vec![unavailable_violation()]))
            }
            Err(_) => {
                warn!(timeout_ms, "Cross-check evaluator timed out");
                Ok(Evaluation::with_violations(vec![unavailable_violation()]))
            }
        }
    }

    fn append_coordinator(&self, record: CausationRecord) -> Result<Arc<LedgerEntry>, SubmitError> {
        let sealed = record.seal().map_err(CycleError::from)?;
        let entry = self.ledger.append(sealed).map_err(CycleError::from)?;
        Ok(entry)
    }

    async fn arbitrate(&self, request: &EscalationRequest) -> Result<EscalationRuling, SubmitError> {
        let timeout_ms = self.config.arbiter_timeout_ms;
        info!(
            agent = %request.agent_id,
            record = %request.record_id,
            unresolved = request.unresolved.len(),
            "Escalating to arbiter"
        );

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.arbiter.arbitrate(request),
        )
        .await
        {
            Ok(Ok(ruling)) => {
                info!(agent = %request.agent_id, ruling = %ruling, "Arbiter ruled");
                Ok(ruling)
            }
            Ok(Err(source)) => Err(SubmitError::ArbiterFailed {
                agent_id: request.agent_id.clone(),
                record_id: request.record_id.clone(),
                source,
            }),
            Err(_) => Err(SubmitError::EscalationTimeout {
                agent_id: request.agent_id.clone(),
                record_id: request.record_id.clone(),
                timeout_ms,
            }),
        }
    }
}

fn partition(
    results: Vec<(String, Result<Submission, SubmitError>)>,
) -> (Vec<Submission>, Vec<AgentFailure>) {
    let mut committed = Vec::new();
    let mut failed = Vec::new();
    for (agent_id, result) in results {
        match result {
            Ok(submission) => committed.push(submission),
            Err(err) => failed.push(AgentFailure {
                agent_id,
                error: err.to_string(),
            }),
        }
    }
    (committed, failed)
}

/// Outputs in agent order with duplicates dropped.
fn distinct_outputs(submissions: &[Submission]) -> Vec<&str> {
    let mut outputs: Vec<&str> = Vec::new();
    for submission in submissions {
        let output = submission.receipt.output.as_str();
        if !outputs.contains(&output) {
            outputs.push(output);
        }
    }
    outputs
}

fn merge_outputs(submissions: &[Submission]) -> String {
    distinct_outputs(submissions).join("\n")
}

fn agent_list(submissions: &[Submission]) -> String {
    submissions
        .iter()
        .map(|s| s.agent_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn record_failure(engine: &mut CycleEngine, err: &SubmitError) {
    if let Err(e) = engine.record_failure(&err.to_string()) {
        error!(agent = %engine.agent_id(), error = %e, "Could not record failed request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleConfig;
    use crate::evaluator::{ConstraintSet, Evaluation, Evaluator, EvaluatorError, PassthroughComposer};
    use crate::ledger::ContradictionLedger;
    use async_trait::async_trait;

    struct Clean;

    #[async_trait]
    impl Evaluator for Clean {
        async fn evaluate(
            &self,
            _candidate: &str,
            _constraints: &ConstraintSet,
        ) -> Result<Evaluation, EvaluatorError> {
            Ok(Evaluation::clean())
        }
    }

    struct Refuse;

    #[async_trait]
    impl EscalationArbiter for Refuse {
        async fn arbitrate(&self, _request: &EscalationRequest) -> Result<EscalationRuling, ArbiterError> {
            Err(ArbiterError::Rejected("no".into()))
        }
    }

    fn engine(id: &str, ledger: &SharedLedger) -> CycleEngine {
        CycleEngine::new(
            id,
            CycleConfig::default(),
            Arc::new(Clean),
            Arc::new(PassthroughComposer),
            Arc::clone(ledger),
        )
    }

    fn orchestrator(ledger: &SharedLedger) -> CoordinationOrchestrator {
        CoordinationOrchestrator::new(
            Arc::clone(ledger),
            Arc::new(Refuse),
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn test_register_rejects_duplicates_and_foreign_ledgers() {
        let ledger = ContradictionLedger::in_memory().shared();
        let mut orch = orchestrator(&ledger);
        orch.register(engine("twin_a", &ledger)).unwrap();

        let err = orch.register(engine("twin_a", &ledger)).unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateAgent("twin_a".into()));

        let other = ContradictionLedger::in_memory().shared();
        let err = orch.register(engine("twin_b", &other)).unwrap_err();
        assert_eq!(err, OrchestratorError::ForeignLedger("twin_b".into()));
        assert_eq!(orch.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let ledger = ContradictionLedger::in_memory().shared();
        let orch = orchestrator(&ledger);
        let err = orch.submit("ghost", "claim").await.unwrap_err();
        assert!(matches!(err, SubmitError::UnknownAgent(_)));
        assert!(orch.coherence("ghost").is_none());
    }

    #[tokio::test]
    async fn test_clean_submission_commits() {
        let ledger = ContradictionLedger::in_memory().shared();
        let mut orch = orchestrator(&ledger);
        orch.register(engine("twin_a", &ledger)).unwrap();

        let submission = orch.submit("twin_a", "claim").await.unwrap();
        assert_eq!(submission.receipt.sequence_number, 0);
        assert!(submission.ruling.is_none());
        assert_eq!(orch.coherence("twin_a"), Some(0.0));
        assert!(orch.detect_stalemate().is_none());
        assert!(orch.verify_ledger().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_input_maps_to_submit_error() {
        let ledger = ContradictionLedger::in_memory().shared();
        let mut orch = orchestrator(&ledger);
        orch.register(engine("twin_a", &ledger)).unwrap();
        let err = orch.submit("twin_a", "").await.unwrap_err();
        assert!(matches!(err, SubmitError::MalformedInput(_)));
        assert!(ledger.is_empty());
    }
}
