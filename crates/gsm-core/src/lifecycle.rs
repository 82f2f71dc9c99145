//! Server lifecycle states and legal transitions
//!
//! ```text
//!   ∅ ──launch──▶ Provisioning ──▶ Running ◀──resume── Paused
//!                                   │  ▲                 ▲
//!                              stop │  │ resume          │ pause
//!                                   ▼  │                 │
//!                             ContainerStopped ──────────┘
//!
//!   any state except Destroyed ──destroy──▶ Destroyed (record removed)
//! ```
//!
//! `Provisioning` exists only inside a launch call. A failed launch discards
//! the record, so neither `Provisioning` nor `Destroyed` is ever persisted.

use serde::{Deserialize, Serialize};

/// Status of a server record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Provisioning,
    Running,
    /// Instance running, workload process stopped
    ContainerStopped,
    Paused,
    Destroyed,
}

/// Lifecycle verbs that change a record's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Launch,
    Pause,
    Resume,
    Stop,
    Destroy,
}

impl ServerStatus {
    /// Whether the record owns a live compute instance in this state
    pub fn has_instance(&self) -> bool {
        matches!(
            self,
            ServerStatus::Running | ServerStatus::ContainerStopped | ServerStatus::Paused
        )
    }

    /// Whether the compute instance is powered on in this state
    pub fn is_instance_running(&self) -> bool {
        matches!(self, ServerStatus::Running | ServerStatus::ContainerStopped)
    }

    /// Status after applying `verb`, or `None` if the transition is illegal
    pub fn apply(self, verb: Verb) -> Option<ServerStatus> {
        use ServerStatus::*;

        match (self, verb) {
            (Provisioning, Verb::Launch) => Some(Running),
            (Running | ContainerStopped, Verb::Pause) => Some(Paused),
            (Paused | ContainerStopped, Verb::Resume) => Some(Running),
            (Running, Verb::Stop) => Some(ContainerStopped),
            (Destroyed, Verb::Destroy) => None,
            (_, Verb::Destroy) => Some(Destroyed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Provisioning => write!(f, "provisioning"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::ContainerStopped => write!(f, "container-stopped"),
            ServerStatus::Paused => write!(f, "paused"),
            ServerStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Launch => write!(f, "launch"),
            Verb::Pause => write!(f, "pause"),
            Verb::Resume => write!(f, "resume"),
            Verb::Stop => write!(f, "stop"),
            Verb::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(Provisioning.apply(Verb::Launch), Some(Running));
        assert_eq!(Running.apply(Verb::Pause), Some(Paused));
        assert_eq!(ContainerStopped.apply(Verb::Pause), Some(Paused));
        assert_eq!(Paused.apply(Verb::Resume), Some(Running));
        assert_eq!(ContainerStopped.apply(Verb::Resume), Some(Running));
        assert_eq!(Running.apply(Verb::Stop), Some(ContainerStopped));

        for status in [Provisioning, Running, ContainerStopped, Paused] {
            assert_eq!(status.apply(Verb::Destroy), Some(Destroyed));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(Paused.apply(Verb::Pause), None);
        assert_eq!(Running.apply(Verb::Resume), None);
        assert_eq!(Paused.apply(Verb::Stop), None);
        assert_eq!(ContainerStopped.apply(Verb::Stop), None);
        assert_eq!(Running.apply(Verb::Launch), None);
        assert_eq!(Destroyed.apply(Verb::Destroy), None);
        assert_eq!(Destroyed.apply(Verb::Resume), None);
    }

    #[test]
    fn test_instance_predicates() {
        assert!(Paused.has_instance());
        assert!(!Paused.is_instance_running());
        assert!(ContainerStopped.is_instance_running());
        assert!(!Provisioning.has_instance());
        assert!(!Destroyed.has_instance());
    }
}
