//! Per-iteration state machine.
//!
//! ```text
//! Pending → Running → Succeeded | Failed | TimedOut
//! ```
//!
//! An iteration reaches exactly one terminal phase; any other edge is
//! rejected with [`IllegalTransition`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::IterationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl IterationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Outcome for a terminal phase.
    pub fn status(self) -> Option<IterationStatus> {
        match self {
            Self::Succeeded => Some(IterationStatus::Success),
            Self::Failed => Some(IterationStatus::Failed),
            Self::TimedOut => Some(IterationStatus::Timeout),
            Self::Pending | Self::Running => None,
        }
    }
}

impl fmt::Display for IterationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

fn is_legal_transition(from: IterationPhase, to: IterationPhase) -> bool {
    use IterationPhase::*;

    matches!(
        (from, to),
        (Pending, Running) | (Running, Succeeded) | (Running, Failed) | (Running, TimedOut)
    )
}

#[derive(Debug, Clone, Error)]
#[error("illegal iteration transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: IterationPhase,
    pub to: IterationPhase,
}

/// Tracks one iteration through its phases.
#[derive(Debug, Clone)]
pub struct IterationTracker {
    iteration: u32,
    phase: IterationPhase,
    history: Vec<IterationPhase>,
}

impl IterationTracker {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            phase: IterationPhase::Pending,
            history: vec![IterationPhase::Pending],
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn phase(&self) -> IterationPhase {
        self.phase
    }

    pub fn history(&self) -> &[IterationPhase] {
        &self.history
    }

    pub fn advance(&mut self, to: IterationPhase) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.phase, to) {
            return Err(IllegalTransition {
                from: self.phase,
                to,
            });
        }
        tracing::trace!(iteration = self.iteration, from = %self.phase, %to, "Iteration transition");
        self.phase = to;
        self.history.push(to);
        Ok(())
    }

    pub fn status(&self) -> Option<IterationStatus> {
        self.phase.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut t = IterationTracker::new(1);
        t.advance(IterationPhase::Running).unwrap();
        t.advance(IterationPhase::Succeeded).unwrap();
        assert_eq!(t.status(), Some(IterationStatus::Success));
        assert_eq!(t.history().len(), 3);
    }

    #[test]
    fn test_single_terminal_outcome() {
        let mut t = IterationTracker::new(2);
        t.advance(IterationPhase::Running).unwrap();
        t.advance(IterationPhase::TimedOut).unwrap();
        let err = t.advance(IterationPhase::Succeeded).unwrap_err();
        assert_eq!(err.from, IterationPhase::TimedOut);
        assert_eq!(t.status(), Some(IterationStatus::Timeout));
    }

    #[test]
    fn test_cannot_finish_without_running() {
        let mut t = IterationTracker::new(3);
        assert!(t.advance(IterationPhase::Failed).is_err());
        assert_eq!(t.phase(), IterationPhase::Pending);
        assert!(t.status().is_none());
    }
}
