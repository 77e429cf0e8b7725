//! Cycle state machine: phases, transitions, and per-agent state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::causation::CausationRecord;

/// Phase transitions kept per agent; older ones are dropped first.
pub const TRANSITION_HISTORY: usize = 32;

/// Phase of an agent's resolution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Waiting for a request.
    Idle,
    /// Producing a candidate.
    Draft,
    /// Checking the candidate against active constraints.
    Critique,
    /// Rewriting the candidate against unresolved contradictions.
    Revise,
    /// Sealing and appending the record.
    Commit,
    /// Stuck; waiting for an arbiter ruling.
    Escalated,
    /// Cancelled before commit.
    Cancelled,
}

impl CyclePhase {
    /// Whether a request is in flight in this phase.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Draft | Self::Critique | Self::Revise | Self::Commit)
    }

    /// Whether cancellation is honoured in this phase.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Draft | Self::Critique)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [CyclePhase] {
        match self {
            Self::Idle => &[Self::Draft],
            Self::Draft => &[Self::Critique, Self::Cancelled],
            Self::Critique => &[Self::Revise, Self::Commit, Self::Escalated, Self::Cancelled],
            Self::Revise => &[Self::Critique],
            Self::Commit => &[Self::Idle],
            Self::Escalated => &[Self::Draft, Self::Commit, Self::Idle],
            Self::Cancelled => &[Self::Idle],
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Draft => write!(f, "draft"),
            Self::Critique => write!(f, "critique"),
            Self::Revise => write!(f, "revise"),
            Self::Commit => write!(f, "commit"),
            Self::Escalated => write!(f, "escalated"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: CyclePhase,
    pub to: CyclePhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: CyclePhase,
    pub to: CyclePhase,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition {} -> {}: {}", self.from, self.to, self.reason)
    }
}

impl std::error::Error for TransitionError {}

/// Mutable state of one agent. Owned by its cycle engine; only ever
/// observed from outside through snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    /// Changes on every reinitialization.
    pub incarnation: String,
    pub phase: CyclePhase,
    /// Record of the request in flight, if any.
    pub current_record: Option<CausationRecord>,
    /// Critique passes in the current request.
    pub iteration_count: u32,
    /// Consecutive critique passes that resolved nothing.
    pub stuck_counter: u32,
    /// Most recent transitions, oldest first, at most [`TRANSITION_HISTORY`].
    pub transitions: Vec<PhaseTransition>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            incarnation: Uuid::new_v4().to_string(),
            phase: CyclePhase::Idle,
            current_record: None,
            iteration_count: 0,
            stuck_counter: 0,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(&mut self, to: CyclePhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.phase.valid_transitions()
                ),
            });
        }
        self.push_transition(to, reason);
        Ok(())
    }

    /// Force the agent back to Idle, dropping any request in flight.
    /// Used when a collaborator fails mid-cycle.
    pub fn reset(&mut self, reason: &str) {
        if self.phase != CyclePhase::Idle {
            self.push_transition(CyclePhase::Idle, reason);
        }
        self.current_record = None;
        self.iteration_count = 0;
        self.stuck_counter = 0;
    }

    /// Clear per-request counters when a new request starts.
    pub fn begin_request(&mut self, record: CausationRecord) {
        self.current_record = Some(record);
        self.iteration_count = 0;
        self.stuck_counter = 0;
    }

    fn push_transition(&mut self, to: CyclePhase, reason: &str) {
        if self.transitions.len() >= TRANSITION_HISTORY {
            let excess = self.transitions.len() + 1 - TRANSITION_HISTORY;
            self.transitions.drain(..excess);
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
    }
}

/// Read-only view of an agent, published after every phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub incarnation: String,
    pub phase: CyclePhase,
    pub iteration_count: u32,
    pub stuck_counter: u32,
    pub unresolved: usize,
    pub coherence: f64,
    pub commits: u64,
    pub escalations: u64,
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_is_idle() {
        let state = AgentState::new("twin_a");
        assert_eq!(state.phase, CyclePhase::Idle);
        assert!(state.current_record.is_none());
        assert!(!state.incarnation.is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = AgentState::new("twin_a");
        state.transition(CyclePhase::Draft, "request").unwrap();
        state.transition(CyclePhase::Critique, "drafted").unwrap();
        state.transition(CyclePhase::Revise, "1 unresolved").unwrap();
        state.transition(CyclePhase::Critique, "revised").unwrap();
        state.transition(CyclePhase::Commit, "clean").unwrap();
        state.transition(CyclePhase::Idle, "committed").unwrap();
        assert_eq!(state.transitions.len(), 6);
    }

    #[test]
    fn test_commit_only_reachable_from_critique_or_escalated() {
        for phase in [
            CyclePhase::Idle,
            CyclePhase::Draft,
            CyclePhase::Revise,
            CyclePhase::Commit,
            CyclePhase::Cancelled,
        ] {
            assert!(!phase.valid_transitions().contains(&CyclePhase::Commit), "{}", phase);
        }
    }

    #[test]
    fn test_cancel_only_from_draft_or_critique() {
        assert!(CyclePhase::Draft.is_cancellable());
        assert!(CyclePhase::Critique.is_cancellable());
        assert!(!CyclePhase::Revise.valid_transitions().contains(&CyclePhase::Cancelled));
        assert!(!CyclePhase::Commit.valid_transitions().contains(&CyclePhase::Cancelled));
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = AgentState::new("twin_a");
        let err = state.transition(CyclePhase::Commit, "skip").unwrap_err();
        assert_eq!(err.from, CyclePhase::Idle);
        assert_eq!(err.to, CyclePhase::Commit);
        assert_eq!(state.phase, CyclePhase::Idle);
    }

    #[test]
    fn test_reset_clears_request() {
        let mut state = AgentState::new("twin_a");
        state.transition(CyclePhase::Draft, "request").unwrap();
        state.begin_request(CausationRecord::new("twin_a", "input"));
        state.iteration_count = 3;
        state.stuck_counter = 2;

        state.reset("composer failed");
        assert_eq!(state.phase, CyclePhase::Idle);
        assert!(state.current_record.is_none());
        assert_eq!(state.iteration_count, 0);
        assert_eq!(state.stuck_counter, 0);
        assert_eq!(state.transitions.last().unwrap().reason, "composer failed");
    }

    #[test]
    fn test_transition_history_is_bounded() {
        let mut state = AgentState::new("twin_a");
        for i in 0..20 {
            state.transition(CyclePhase::Draft, "request").unwrap();
            state.transition(CyclePhase::Critique, "drafted").unwrap();
            state.transition(CyclePhase::Commit, "clean").unwrap();
            state.transition(CyclePhase::Idle, &format!("committed {}", i)).unwrap();
        }
        assert_eq!(state.transitions.len(), TRANSITION_HISTORY);
        assert_eq!(state.transitions.last().unwrap().reason, "committed 19");
        assert_eq!(state.transitions[0].from, CyclePhase::Idle);
    }
}
