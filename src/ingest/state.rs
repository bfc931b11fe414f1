//! Per-file ingestion state machine
//!
//! discovered -> stabilizing -> validating -> reserving -> committing -> completed
//!
//! - Transitions only move forward; `stabilizing` may repeat itself
//! - `rejected` ends validation without consuming identifiers
//! - `failed` ends a stage that could not recover; any reservation is released
//! - `skipped` ends a file whose content was already handled

use std::fmt;

use serde::Serialize;

use super::errors::{IngestError, IngestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Stabilizing,
    Validating,
    Reserving,
    Committing,
    Completed,
    Rejected,
    Failed,
    Skipped,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Stabilizing => "stabilizing",
            FileState::Validating => "validating",
            FileState::Reserving => "reserving",
            FileState::Committing => "committing",
            FileState::Completed => "completed",
            FileState::Rejected => "rejected",
            FileState::Failed => "failed",
            FileState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Completed | FileState::Rejected | FileState::Failed | FileState::Skipped
        )
    }

    pub fn can_transition_to(&self, next: FileState) -> bool {
        use FileState::*;
        match (self, next) {
            (Discovered, Stabilizing) => true,
            (Stabilizing, Stabilizing) | (Stabilizing, Validating) => true,
            (Validating, Reserving) | (Validating, Rejected) => true,
            (Reserving, Committing) => true,
            (Committing, Completed) => true,
            // Duplicate content or an earlier commit of the same content
            (Stabilizing, Skipped) | (Reserving, Skipped) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, refusing any transition the machine does not allow.
    pub fn advance(&mut self, next: FileState) -> IngestResult<()> {
        if !self.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl Default for FileState {
    fn default() -> Self {
        FileState::Discovered
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = FileState::default();
        for next in [
            FileState::Stabilizing,
            FileState::Stabilizing,
            FileState::Validating,
            FileState::Reserving,
            FileState::Committing,
            FileState::Completed,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_no_backward_or_terminal_exits() {
        assert!(!FileState::Committing.can_transition_to(FileState::Reserving));
        assert!(!FileState::Validating.can_transition_to(FileState::Stabilizing));
        assert!(!FileState::Completed.can_transition_to(FileState::Failed));
        assert!(!FileState::Committing.can_transition_to(FileState::Rejected));

        let mut state = FileState::Rejected;
        assert!(matches!(
            state.advance(FileState::Validating),
            Err(IngestError::InvalidTransition { .. })
        ));
        assert_eq!(state, FileState::Rejected);
    }

    #[test]
    fn test_failed_reachable_from_every_active_state() {
        for state in [
            FileState::Discovered,
            FileState::Stabilizing,
            FileState::Validating,
            FileState::Reserving,
            FileState::Committing,
        ] {
            assert!(state.can_transition_to(FileState::Failed), "{}", state);
        }
    }
}
