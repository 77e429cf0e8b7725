//! Wiring: turns a [`RuntimeConfig`] into a ready orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use resolution::{
    ContradictionLedger, CoordinationOrchestrator, CycleEngine, EscalationArbiter, SharedLedger,
};
use tracing::{info, warn};

use crate::arbiter::{HttpArbiter, PolicyArbiter};
use crate::config::RuntimeConfig;
use crate::rules::{RuleComposer, RuleEvaluator};

/// Open the configured ledger file, creating it if needed.
pub fn open_ledger(config: &RuntimeConfig) -> Result<SharedLedger> {
    let ledger = ContradictionLedger::open(&config.ledger_path).context(format!(
        "Failed to open ledger {}",
        config.ledger_path.display()
    ))?;
    if let Some(violation) = ledger.violation() {
        warn!(%violation, "Ledger failed verification; opened read-only");
    }
    Ok(ledger.shared())
}

/// The arbiter named by the config: remote if a URL is set, local policy otherwise.
pub fn arbiter_for(config: &RuntimeConfig) -> Arc<dyn EscalationArbiter> {
    match &config.arbiter_url {
        Some(url) => {
            // Leave headroom so the orchestrator's own timeout fires first.
            let timeout = Duration::from_millis(config.orchestrator.arbiter_timeout_ms + 1_000);
            info!(url = %url, "Using HTTP arbiter");
            Arc::new(HttpArbiter::new(url.clone(), timeout))
        }
        None => Arc::new(PolicyArbiter::new()),
    }
}

pub fn build_orchestrator(config: &RuntimeConfig) -> Result<CoordinationOrchestrator> {
    build_orchestrator_with(config, arbiter_for(config))
}

/// Build with an explicit arbiter. Agent outputs are cross-checked with
/// the rule evaluator.
pub fn build_orchestrator_with(
    config: &RuntimeConfig,
    arbiter: Arc<dyn EscalationArbiter>,
) -> Result<CoordinationOrchestrator> {
    let ledger = open_ledger(config)?;
    let mut orchestrator = CoordinationOrchestrator::new(
        Arc::clone(&ledger),
        arbiter,
        config.orchestrator.clone(),
    )
    .with_cross_check(Arc::new(RuleEvaluator::new()));

    for agent in &config.agents {
        let engine = CycleEngine::new(
            agent.id.clone(),
            config.cycle.clone(),
            Arc::new(RuleEvaluator::new()),
            Arc::new(RuleComposer::new()),
            Arc::clone(&ledger),
        )
        .with_constraints(agent.constraints.iter().cloned());
        orchestrator
            .register(engine)
            .context(format!("Failed to register agent {}", agent.id))?;
    }

    info!(
        agents = orchestrator.agent_count(),
        ledger = %config.ledger_path.display(),
        entries = ledger.len(),
        "Orchestrator ready"
    );
    Ok(orchestrator)
}
