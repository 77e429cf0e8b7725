//! Per-agent resolution cycle.

pub mod engine;
pub mod state;

pub use engine::{
    CommitReceipt, CycleConfig, CycleEngine, CycleError, CycleOutcome, CycleResult, RequestContext,
};
pub use state::{
    AgentSnapshot, AgentState, CyclePhase, PhaseTransition, TransitionError, TRANSITION_HISTORY,
};
