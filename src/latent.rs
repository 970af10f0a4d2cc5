use serde::{Deserialize, Serialize};
use std::fmt;

use crate::actor::Continuation;

/// Completion condition of a suspended latent operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatentPredicate {
    /// Simulated seconds left before the actor resumes.
    ElapsedTime { remaining: f64 },
    /// Resumes when the engine reports a matching tag.
    ExternalSignal { tag: String },
}

/// A suspended state-code position waiting on a predicate. Owned by
/// exactly one actor; dropped without resuming if that actor's state
/// changes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentRequest {
    pub predicate: LatentPredicate,
    pub resume: Continuation,
}

impl LatentRequest {
    /// Advances an elapsed-time predicate by `dt`. Returns true once
    /// the predicate is satisfied. Called at most once per actor turn.
    pub fn advance(&mut self, dt: f64) -> bool {
        match &mut self.predicate {
            LatentPredicate::ElapsedTime { remaining } => {
                *remaining -= dt;
                *remaining <= 0.0
            }
            LatentPredicate::ExternalSignal { .. } => false,
        }
    }

    pub fn matches_signal(&self, tag: &str) -> bool {
        matches!(&self.predicate, LatentPredicate::ExternalSignal { tag: waiting } if waiting == tag)
    }
}

impl fmt::Display for LatentPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatentPredicate::ElapsedTime { remaining } => write!(f, "sleep({remaining:.3})"),
            LatentPredicate::ExternalSignal { tag } => write!(f, "signal({tag})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(predicate: LatentPredicate) -> LatentRequest {
        LatentRequest { predicate, resume: Continuation::Halted }
    }

    #[test]
    fn elapsed_time_counts_down_to_zero() {
        let mut req = request(LatentPredicate::ElapsedTime { remaining: 0.5 });
        assert!(!req.advance(0.2));
        assert!(!req.advance(0.2));
        assert!(req.advance(0.2));
    }

    #[test]
    fn signals_ignore_time_and_match_tags() {
        let mut req = request(LatentPredicate::ExternalSignal { tag: "anim_done".into() });
        assert!(!req.advance(100.0));
        assert!(!req.matches_signal("other"));
        assert!(req.matches_signal("anim_done"));
    }
}
