//! Cycle engine: drives one agent through Draft -> Critique -> Revise ->
//! Commit until its candidate is free of contradictions or the agent is
//! stuck and must escalate.
//!
//! Termination:
//! - every critique pass is one iteration
//! - a pass makes progress when it leaves fewer contradictions open than
//!   any earlier pass of the same drive; progress resets the stuck counter
//! - a pass that leaves contradictions open without progress bumps it,
//!   including passes that trade one contradiction for another and passes
//!   where the evaluator never answered
//! - `stuck_counter >= max_iterations` escalates
//! - `iteration_ceiling` is a hard bound on critique passes per request

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{AgentSnapshot, AgentState, CyclePhase, TransitionError};
use crate::arbiter::{EscalationRequest, EscalationRuling};
use crate::causation::{CausationRecord, RecordError, RecordId};
use crate::coherence::{CoherenceTracker, DEFAULT_UNIT_WEIGHT};
use crate::contradiction::SeverityRules;
use crate::evaluator::{
    unavailable_violation, ComposeError, Composer, ConstraintOrigin, ConstraintSet, Evaluation,
    Evaluator, EvaluatorError,
};
use crate::ledger::{LedgerEntry, LedgerError, SharedLedger};
use crate::retry::RetryPolicy;

/// Configuration for a cycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Consecutive unproductive iterations before escalating.
    pub max_iterations: u32,
    /// Hard bound on critique passes per request.
    pub iteration_ceiling: u32,
    /// Coherence gained per resolved contradiction.
    pub unit_weight: f64,
    /// Timeout for a single evaluator call, in milliseconds.
    pub evaluator_timeout_ms: u64,
    pub evaluator_retry: RetryPolicy,
    pub severity_rules: SeverityRules,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            iteration_ceiling: 50,
            unit_weight: DEFAULT_UNIT_WEIGHT,
            evaluator_timeout_ms: 5_000,
            evaluator_retry: RetryPolicy::default(),
            severity_rules: SeverityRules::default(),
        }
    }
}

impl CycleConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluator_timeout_ms)
    }
}

/// Per-request additions on top of the agent's declared constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Constraints active for this request only, folded in as ruling
    /// constraints.
    pub constraints: Vec<String>,
    /// Ledger record this request corrects.
    pub corrects: Option<RecordId>,
}

/// Proof of a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReceipt {
    pub agent_id: String,
    pub record_id: RecordId,
    pub sequence_number: u64,
    pub hash: String,
    pub output: String,
    /// Critique passes the request took.
    pub iterations: u32,
    /// Contradictions resolved during the request.
    pub resolved: u32,
    pub coherence_delta: f64,
    /// Agent coherence after the commit.
    pub coherence: f64,
    pub escalated: bool,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Committed(CommitReceipt),
    /// The agent is stuck. Resolve with [`CycleEngine::resume`] or
    /// [`CycleEngine::record_failure`].
    Escalated(Box<EscalationRequest>),
}

impl CycleOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn receipt(&self) -> Option<&CommitReceipt> {
        match self {
            Self::Committed(receipt) => Some(receipt),
            Self::Escalated(_) => None,
        }
    }

    pub fn escalation(&self) -> Option<&EscalationRequest> {
        match self {
            Self::Committed(_) => None,
            Self::Escalated(request) => Some(request),
        }
    }
}

/// Errors from a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("cancelled during {phase}")]
    Cancelled { phase: CyclePhase },

    #[error("iteration ceiling reached after {iterations} iteration(s)")]
    IterationCeiling { iterations: u32 },

    #[error("composer failed: {0}")]
    ComposerFailed(String),

    #[error("agent is {phase}; cannot start a new request")]
    Busy { phase: CyclePhase },

    #[error("no escalation pending")]
    NoEscalationPending,

    #[error("no request in flight")]
    NoActiveRequest,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<ComposeError> for CycleError {
    fn from(err: ComposeError) -> Self {
        match err {
            ComposeError::Malformed(msg) => Self::MalformedInput(msg),
            ComposeError::Failed(msg) => Self::ComposerFailed(msg),
        }
    }
}

/// Convenience alias for cycle results.
pub type CycleResult<T> = Result<T, CycleError>;

/// One agent's resolution loop.
///
/// Owns its [`AgentState`] and [`CoherenceTracker`] exclusively. All
/// mutation goes through `&mut self`; observers read [`AgentSnapshot`]s
/// from [`subscribe`](Self::subscribe).
pub struct CycleEngine {
    state: AgentState,
    config: CycleConfig,
    evaluator: Arc<dyn Evaluator>,
    composer: Arc<dyn Composer>,
    ledger: SharedLedger,
    coherence: CoherenceTracker,
    /// Constraints declared for the agent role.
    declared: ConstraintSet,
    /// Ruling constraints for the request in flight.
    carried: ConstraintSet,
    /// Last candidate of the request in flight.
    candidate: Option<String>,
    commits: u64,
    escalations: u64,
    snapshot_tx: watch::Sender<AgentSnapshot>,
}

impl CycleEngine {
    pub fn new(
        agent_id: impl Into<String>,
        config: CycleConfig,
        evaluator: Arc<dyn Evaluator>,
        composer: Arc<dyn Composer>,
        ledger: SharedLedger,
    ) -> Self {
        let state = AgentState::new(agent_id);
        let coherence = CoherenceTracker::new(config.unit_weight);
        let initial = snapshot_of(&state, &coherence, 0, 0);
        let (snapshot_tx, _) = watch::channel(initial);
        Self {
            state,
            config,
            evaluator,
            composer,
            ledger,
            coherence,
            declared: ConstraintSet::new(),
            carried: ConstraintSet::new(),
            candidate: None,
            commits: 0,
            escalations: 0,
            snapshot_tx,
        }
    }

    /// Declare role constraints that apply to every request.
    pub fn with_constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for text in constraints {
            self.declared.push(text, ConstraintOrigin::Declared);
        }
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn declared_constraints(&self) -> &ConstraintSet {
        &self.declared
    }

    /// Current coherence score.
    pub fn coherence(&self) -> f64 {
        self.coherence.score()
    }

    /// Candidate of the request in flight or pending escalation.
    pub fn last_candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn escalations(&self) -> u64 {
        self.escalations
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        snapshot_of(&self.state, &self.coherence, self.commits, self.escalations)
    }

    /// Receive a snapshot after every phase change.
    pub fn subscribe(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run one request from Draft until it commits or escalates.
    pub async fn run_cycle(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> CycleResult<CycleOutcome> {
        self.run_cycle_with(input, RequestContext::default(), cancel)
            .await
    }

    /// [`run_cycle`](Self::run_cycle) with request-scoped constraints and
    /// an optional corrected record.
    pub async fn run_cycle_with(
        &mut self,
        input: &str,
        context: RequestContext,
        cancel: &CancellationToken,
    ) -> CycleResult<CycleOutcome> {
        if self.state.phase != CyclePhase::Idle {
            return Err(CycleError::Busy {
                phase: self.state.phase,
            });
        }
        if input.trim().is_empty() {
            return Err(CycleError::MalformedInput("input is empty".to_string()));
        }

        self.carried = ConstraintSet::new();
        for text in context.constraints {
            self.carried.push(text, ConstraintOrigin::Ruling);
        }
        self.candidate = None;
        self.state.transition(CyclePhase::Draft, "request received")?;
        let mut record = CausationRecord::new(self.state.agent_id.clone(), input);
        if let Some(original) = context.corrects {
            record = record.correcting(original);
        }
        info!(
            agent = %self.state.agent_id,
            record = %record.record_id,
            carried = self.carried.len(),
            corrects = record.corrects.as_deref().unwrap_or("-"),
            "Cycle started"
        );
        self.state.begin_request(record);
        self.publish();

        let result = self.drive(cancel).await;
        self.settle(result)
    }

    /// Continue a pending escalation with the arbiter's ruling.
    pub async fn resume(
        &mut self,
        ruling: EscalationRuling,
        cancel: &CancellationToken,
    ) -> CycleResult<CycleOutcome> {
        if self.state.phase != CyclePhase::Escalated {
            return Err(CycleError::NoEscalationPending);
        }
        self.state.stuck_counter = 0;
        info!(agent = %self.state.agent_id, ruling = %ruling, "Resuming after escalation");

        let result = self.apply_ruling(ruling, cancel).await;
        self.settle(result)
    }

    /// Append the pending escalated record without an output and return to
    /// Idle. Used when the escalation cannot be resolved.
    pub fn record_failure(&mut self, reason: &str) -> CycleResult<Arc<LedgerEntry>> {
        if self.state.phase != CyclePhase::Escalated {
            return Err(CycleError::NoEscalationPending);
        }

        let mut record = self
            .state
            .current_record
            .take()
            .ok_or(CycleError::NoActiveRequest)?;
        record.push_step(format!("failed: {}", reason));
        let record_id = record.record_id.clone();
        let appended = record
            .seal()
            .map_err(CycleError::from)
            .and_then(|sealed| self.ledger.append(sealed).map_err(CycleError::from));

        self.state.reset(reason);
        self.candidate = None;
        self.publish();

        let entry = appended?;
        warn!(
            agent = %self.state.agent_id,
            record = %record_id,
            seq = entry.sequence_number(),
            reason,
            "Failed request recorded"
        );
        Ok(entry)
    }

    /// Start a new incarnation: fresh identity, zero coherence. Any
    /// pending escalation is dropped.
    pub fn reinitialize(&mut self) {
        if self.state.phase == CyclePhase::Escalated {
            warn!(agent = %self.state.agent_id, "Reinitializing with a pending escalation");
        }
        let fresh = AgentState::new(self.state.agent_id.clone());
        let previous = std::mem::replace(&mut self.state, fresh);
        self.coherence = CoherenceTracker::new(self.config.unit_weight);
        self.carried = ConstraintSet::new();
        self.candidate = None;
        self.commits = 0;
        self.escalations = 0;
        info!(
            agent = %self.state.agent_id,
            previous = %previous.incarnation,
            incarnation = %self.state.incarnation,
            "Agent reinitialized"
        );
        self.publish();
    }

    // ── phases ──────────────────────────────────────────────────────────

    async fn apply_ruling(
        &mut self,
        ruling: EscalationRuling,
        cancel: &CancellationToken,
    ) -> CycleResult<CycleOutcome> {
        match ruling {
            EscalationRuling::AdditionalConstraints { constraints } => {
                let mut added = 0;
                for text in constraints {
                    if self.carried.push(text, ConstraintOrigin::Ruling) {
                        added += 1;
                    }
                }
                self.record_mut()?
                    .push_step(format!("arbiter ruling: {} additional constraint(s)", added));
                self.state
                    .transition(CyclePhase::Draft, "resumed with additional constraints")?;
                self.publish();
                self.drive(cancel).await
            }
            EscalationRuling::ForcedOutput { output } => {
                self.record_mut()?.push_step("arbiter ruling: forced output");
                self.commit(output, "arbiter forced output")
            }
        }
    }

    /// Draft, then alternate Critique and Revise until commit or escalation.
    async fn drive(&mut self, cancel: &CancellationToken) -> CycleResult<CycleOutcome> {
        let constraints = self.active_constraints();
        let input = self.record_mut()?.input_cause.clone();

        let composer = Arc::clone(&self.composer);
        let drafted =
            cancellable(self.state.phase, cancel, composer.draft(&input, &constraints)).await;
        let Some(drafted) = drafted else {
            return Err(self.cancel(CyclePhase::Draft));
        };
        let mut candidate = drafted?;
        self.candidate = Some(candidate.clone());
        self.record_mut()?.push_step(format!(
            "draft: {} char candidate under {} constraint(s)",
            candidate.chars().count(),
            constraints.len()
        ));
        self.state.transition(CyclePhase::Critique, "candidate drafted")?;
        self.publish();

        // Fewest open contradictions seen so far in this drive. A resumed
        // drive starts from what the escalated record still has open.
        let mut low_water = match self.record_mut()?.unresolved().len() {
            0 => None,
            open => Some(open),
        };

        loop {
            if self.state.iteration_count >= self.config.iteration_ceiling {
                return Err(CycleError::IterationCeiling {
                    iterations: self.state.iteration_count,
                });
            }
            self.state.iteration_count += 1;
            let iteration = self.state.iteration_count;

            let verdict = self.critique(&candidate, &constraints, cancel).await?;
            let rules = self.config.severity_rules.clone();
            let record = self.record_mut()?;
            let tally = match verdict {
                Some(evaluation) => {
                    record.absorb(evaluation.violations, evaluation.gaps, iteration, &rules)
                }
                None => record.hold_open(unavailable_violation(), iteration, &rules),
            };
            record.push_step(format!(
                "critique {}: {} new, {} resolved, {} unresolved",
                iteration, tally.new, tally.resolved, tally.unresolved
            ));
            if tally.resolved > 0 {
                record.push_learned_rule(format!(
                    "iteration {}: resolved {} contradiction(s) by revision",
                    iteration, tally.resolved
                ));
            }

            let progressed = low_water.is_some_and(|low| tally.unresolved < low);
            if tally.unresolved > 0 && !progressed {
                self.state.stuck_counter += 1;
            } else {
                self.state.stuck_counter = 0;
            }
            low_water = Some(low_water.map_or(tally.unresolved, |low| low.min(tally.unresolved)));

            debug!(
                agent = %self.state.agent_id,
                iteration,
                new = tally.new,
                resolved = tally.resolved,
                unresolved = tally.unresolved,
                stuck = self.state.stuck_counter,
                "Critique pass"
            );

            if tally.unresolved == 0 {
                return self.commit(candidate, "no unresolved contradictions");
            }
            if self.state.stuck_counter >= self.config.max_iterations {
                return self.escalate(candidate);
            }

            self.state.transition(
                CyclePhase::Revise,
                &format!("{} unresolved contradiction(s)", tally.unresolved),
            )?;
            self.publish();

            let unresolved = self.record_mut()?.unresolved().to_vec();
            candidate = composer.revise(&candidate, &unresolved, &constraints).await?;
            self.candidate = Some(candidate.clone());
            self.record_mut()?.push_step(format!(
                "revise {}: rewrote candidate against {} contradiction(s)",
                iteration,
                unresolved.len()
            ));
            self.state.transition(CyclePhase::Critique, "candidate revised")?;
            self.publish();
        }
    }

    /// Evaluate with timeout and retry. `None` means the evaluator never
    /// answered; the caller records that as a blocking contradiction.
    async fn critique(
        &mut self,
        candidate: &str,
        constraints: &ConstraintSet,
        cancel: &CancellationToken,
    ) -> CycleResult<Option<Evaluation>> {
        let evaluator = Arc::clone(&self.evaluator);
        let policy = self.config.evaluator_retry.clone();
        let timeout = self.config.evaluator_timeout();
        let agent_id = self.state.agent_id.clone();

        let evaluated = cancellable(
            self.state.phase,
            cancel,
            evaluate_with_retry(
                evaluator.as_ref(),
                candidate,
                constraints,
                timeout,
                &policy,
                &agent_id,
            ),
        )
        .await;

        match evaluated {
            None => Err(self.cancel(CyclePhase::Critique)),
            Some(Ok(evaluation)) => Ok(Some(evaluation)),
            Some(Err(EvaluatorError::Malformed(msg))) => Err(CycleError::MalformedInput(msg)),
            Some(Err(EvaluatorError::Unavailable(_))) => Ok(None),
        }
    }

    /// Seal and append. No await points: once started, a commit either
    /// lands in the ledger or fails.
    fn commit(&mut self, output: String, reason: &str) -> CycleResult<CycleOutcome> {
        self.state.transition(CyclePhase::Commit, reason)?;
        self.publish();

        let mut record = self
            .state
            .current_record
            .take()
            .ok_or(CycleError::NoActiveRequest)?;
        let resolved = u32::try_from(record.resolved_count()).unwrap_or(u32::MAX);
        let delta = self.coherence.delta_for(resolved);

        record.set_output(output.clone())?;
        record.coherence_delta = delta;
        record.push_step(format!("commit: {} contradiction(s) resolved", resolved));
        let record_id = record.record_id.clone();
        let escalated = record.escalated;

        let entry = self.ledger.append(record.seal()?)?;
        let score = self.coherence.update(resolved);
        self.commits += 1;
        let iterations = self.state.iteration_count;
        self.state.iteration_count = 0;
        self.state.stuck_counter = 0;
        self.candidate = None;
        self.state.transition(CyclePhase::Idle, "committed")?;

        info!(
            agent = %self.state.agent_id,
            record = %record_id,
            seq = entry.sequence_number(),
            iterations,
            resolved,
            coherence = score,
            escalated,
            "Cycle committed"
        );
        self.publish();

        Ok(CycleOutcome::Committed(CommitReceipt {
            agent_id: self.state.agent_id.clone(),
            record_id,
            sequence_number: entry.sequence_number(),
            hash: entry.hash().to_string(),
            output,
            iterations,
            resolved,
            coherence_delta: delta,
            coherence: score,
            escalated,
        }))
    }

    fn escalate(&mut self, candidate: String) -> CycleResult<CycleOutcome> {
        let stuck = self.state.stuck_counter;
        let iterations = self.state.iteration_count;
        self.state.transition(
            CyclePhase::Escalated,
            &format!("no progress for {} iteration(s)", stuck),
        )?;
        self.escalations += 1;
        self.candidate = Some(candidate.clone());

        let agent_id = self.state.agent_id.clone();
        let record = self.record_mut()?;
        record.mark_escalated();
        record.push_step(format!(
            "escalated: {} unresolved after {} iteration(s)",
            record.unresolved().len(),
            iterations
        ));

        let request = EscalationRequest {
            agent_id: agent_id.clone(),
            record_id: record.record_id.clone(),
            unresolved: record.unresolved().to_vec(),
            last_record: record.clone(),
            last_candidate: Some(candidate),
            stuck_counter: stuck,
            iterations,
            escalated_at: Utc::now(),
        };

        warn!(
            agent = %agent_id,
            record = %request.record_id,
            unresolved = request.unresolved.len(),
            iterations,
            "Cycle escalated"
        );
        self.publish();
        Ok(CycleOutcome::Escalated(Box::new(request)))
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn cancel(&mut self, phase: CyclePhase) -> CycleError {
        if let Err(e) = self
            .state
            .transition(CyclePhase::Cancelled, "cancellation requested")
        {
            return e.into();
        }
        info!(agent = %self.state.agent_id, phase = %phase, "Cycle cancelled");
        CycleError::Cancelled { phase }
    }

    /// Return to Idle after a failed request. Nothing is committed.
    fn settle(&mut self, result: CycleResult<CycleOutcome>) -> CycleResult<CycleOutcome> {
        if let Err(ref err) = result {
            if !matches!(err, CycleError::Cancelled { .. }) {
                warn!(agent = %self.state.agent_id, error = %err, "Cycle failed");
            }
            self.state.reset(&format!("request ended: {}", err));
            self.carried = ConstraintSet::new();
            self.candidate = None;
            self.publish();
        }
        result
    }

    fn active_constraints(&self) -> ConstraintSet {
        let mut active = self.declared.clone();
        active.extend(&self.carried);
        active
    }

    fn record_mut(&mut self) -> CycleResult<&mut CausationRecord> {
        self.state
            .current_record
            .as_mut()
            .ok_or(CycleError::NoActiveRequest)
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

fn snapshot_of(
    state: &AgentState,
    coherence: &CoherenceTracker,
    commits: u64,
    escalations: u64,
) -> AgentSnapshot {
    AgentSnapshot {
        agent_id: state.agent_id.clone(),
        incarnation: state.incarnation.clone(),
        phase: state.phase,
        iteration_count: state.iteration_count,
        stuck_counter: state.stuck_counter,
        unresolved: state
            .current_record
            .as_ref()
            .map(|r| r.unresolved().len())
            .unwrap_or(0),
        coherence: coherence.score(),
        commits,
        escalations,
        taken_at: Utc::now(),
    }
}

/// Await `work`, giving up early on cancellation when `phase` honours it.
async fn cancellable<F: Future>(
    phase: CyclePhase,
    cancel: &CancellationToken,
    work: F,
) -> Option<F::Output> {
    if !phase.is_cancellable() {
        return Some(work.await);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = work => Some(output),
    }
}

/// One evaluator call with per-attempt timeout and exponential backoff.
/// `Malformed` is returned at once; `Unavailable` only after the retry
/// budget is spent.
async fn evaluate_with_retry(
    evaluator: &dyn Evaluator,
    candidate: &str,
    constraints: &ConstraintSet,
    timeout: Duration,
    policy: &RetryPolicy,
    agent_id: &str,
) -> Result<Evaluation, EvaluatorError> {
    let attempts = policy.attempts();
    let mut reason = String::new();
    for attempt in 0..attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            debug!(agent = %agent_id, attempt, reason = %reason, "Evaluator unavailable; retrying");
            tokio::time::sleep(delay).await;
        }

        reason =
            match tokio::time::timeout(timeout, evaluator.evaluate(candidate, constraints)).await {
                Ok(Ok(evaluation)) => return Ok(evaluation),
                Ok(Err(EvaluatorError::Malformed(msg))) => {
                    return Err(EvaluatorError::Malformed(msg))
                }
                Ok(Err(EvaluatorError::Unavailable(reason))) => reason,
                Err(_) => format!("no answer within {}ms", timeout.as_millis()),
            };
    }

    warn!(
        agent = %agent_id,
        attempts,
        reason = %reason,
        "Evaluator unavailable; retries exhausted"
    );
    Err(EvaluatorError::Unavailable(reason))
}
