//! Coherence tracking: a per-agent running total of resolved contradictions.
//!
//! Advisory telemetry only: the cycle engine never consults the score to
//! decide anything. There is no decrement; a fresh tracker comes only with a
//! new agent incarnation.

use serde::{Deserialize, Serialize};

/// Weight applied to each resolved contradiction unless configured otherwise.
pub const DEFAULT_UNIT_WEIGHT: f64 = 1.0;

/// Monotonic accumulator: `score += resolved * unit_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceTracker {
    score: f64,
    unit_weight: f64,
    updates: u64,
}

impl CoherenceTracker {
    /// Create a tracker. Negative or non-finite weights fall back to
    /// [`DEFAULT_UNIT_WEIGHT`] so the score can never go down.
    pub fn new(unit_weight: f64) -> Self {
        let unit_weight = if unit_weight.is_finite() && unit_weight >= 0.0 {
            unit_weight
        } else {
            DEFAULT_UNIT_WEIGHT
        };
        Self {
            score: 0.0,
            unit_weight,
            updates: 0,
        }
    }

    /// Score increase that `update(resolved)` would apply.
    pub fn delta_for(&self, resolved: u32) -> f64 {
        f64::from(resolved) * self.unit_weight
    }

    /// Add `resolved * unit_weight` and return the new score.
    pub fn update(&mut self, resolved: u32) -> f64 {
        self.score += self.delta_for(resolved);
        self.updates += 1;
        self.score
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn unit_weight(&self) -> f64 {
        self.unit_weight
    }

    /// Number of `update` calls so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Default for CoherenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_WEIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accumulates() {
        let mut tracker = CoherenceTracker::default();
        assert_eq!(tracker.update(2), 2.0);
        assert_eq!(tracker.update(0), 2.0);
        assert_eq!(tracker.update(3), 5.0);
        assert_eq!(tracker.updates(), 3);
    }

    #[test]
    fn test_custom_weight() {
        let mut tracker = CoherenceTracker::new(0.5);
        assert_eq!(tracker.delta_for(4), 2.0);
        tracker.update(4);
        assert_eq!(tracker.score(), 2.0);
    }

    #[test]
    fn test_invalid_weight_falls_back() {
        assert_eq!(CoherenceTracker::new(-1.0).unit_weight(), DEFAULT_UNIT_WEIGHT);
        assert_eq!(CoherenceTracker::new(f64::NAN).unit_weight(), DEFAULT_UNIT_WEIGHT);
        assert_eq!(CoherenceTracker::new(f64::INFINITY).unit_weight(), DEFAULT_UNIT_WEIGHT);
    }

    #[test]
    fn test_score_never_decreases() {
        let mut tracker = CoherenceTracker::new(1.25);
        let mut last = tracker.score();
        for resolved in [0u32, 7, 0, 1, 1, 0, 12, 3] {
            let next = tracker.update(resolved);
            assert!(next >= last);
            last = next;
        }
    }
}
