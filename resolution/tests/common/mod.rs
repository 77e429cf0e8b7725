//! Shared collaborators for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use resolution::{
    ArbiterError, ConstraintSet, CycleConfig, CycleEngine, EscalationArbiter, EscalationRequest,
    EscalationRuling, Evaluation, Evaluator, EvaluatorError, PassthroughComposer, SharedLedger,
    Violation,
};

/// A violation with a description derived from its constraint.
pub fn violation(constraint: &str) -> Violation {
    Violation::new(constraint, format!("{} violated", constraint))
}

pub fn violations(constraints: &[&str]) -> Evaluation {
    Evaluation::with_violations(constraints.iter().map(|c| violation(c)).collect())
}

/// Replays a script of evaluations; the last one repeats forever.
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<Result<Evaluation, EvaluatorError>>>,
    last: Mutex<Result<Evaluation, EvaluatorError>>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(script: Vec<Result<Evaluation, EvaluatorError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Ok(Evaluation::clean())),
            calls: AtomicUsize::new(0),
        })
    }

    /// Script of plain evaluations.
    pub fn passes(passes: Vec<Evaluation>) -> Arc<Self> {
        Self::new(passes.into_iter().map(Ok).collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        _candidate: &str,
        _constraints: &ConstraintSet,
    ) -> Result<Evaluation, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

/// Reports one violation until `required` is among the active constraints.
pub struct ConstraintGatedEvaluator {
    required: String,
    calls: AtomicUsize,
}

impl ConstraintGatedEvaluator {
    pub fn new(required: &str) -> Arc<Self> {
        Arc::new(Self {
            required: required.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ConstraintGatedEvaluator {
    async fn evaluate(
        &self,
        _candidate: &str,
        constraints: &ConstraintSet,
    ) -> Result<Evaluation, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if constraints.contains(&self.required) {
            Ok(Evaluation::clean())
        } else {
            Ok(Evaluation::with_violations(vec![Violation::new(
                "consistency:always/never",
                "claims both always and never",
            )
            .with_suggestion(self.required.clone())]))
        }
    }
}

/// Answers every escalation with the same ruling, optionally after a delay.
pub struct FixedArbiter {
    ruling: Result<EscalationRuling, ArbiterError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FixedArbiter {
    pub fn ruling(ruling: EscalationRuling) -> Arc<Self> {
        Arc::new(Self {
            ruling: Ok(ruling),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(err: ArbiterError) -> Arc<Self> {
        Arc::new(Self {
            ruling: Err(err),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(ruling: EscalationRuling, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            ruling: Ok(ruling),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EscalationArbiter for FixedArbiter {
    async fn arbitrate(
        &self,
        _request: &EscalationRequest,
    ) -> Result<EscalationRuling, ArbiterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.ruling.clone()
    }
}

/// Engine with a passthrough composer.
pub fn engine(
    agent_id: &str,
    evaluator: Arc<dyn Evaluator>,
    config: CycleConfig,
    ledger: &SharedLedger,
) -> CycleEngine {
    CycleEngine::new(
        agent_id,
        config,
        evaluator,
        Arc::new(PassthroughComposer),
        Arc::clone(ledger),
    )
}
