//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a mirroring saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Idle ──► Provisioning ──┬──► AwaitingPropagation ──► Mirroring ──► TearingDown ──► Done
///                         ├──────────────────────────► Mirroring      ▲
///                         └───────────────────────────────────────────┘
/// ```
///
/// Every non-terminal state other than `Idle` may jump to `TearingDown` on a
/// fatal error, so teardown is reachable from everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Request received, nothing done yet.
    #[default]
    Idle,

    /// Identity, policy and credential are being created (or the stored
    /// secret is being fetched).
    Provisioning,

    /// Waiting for the issued credential to be reported active.
    AwaitingPropagation,

    /// Cloning the source and pushing to the destination.
    Mirroring,

    /// Unwinding whatever provisioning created.
    TearingDown,

    /// The result has been produced (terminal state).
    Done,
}

impl SagaState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Provisioning, AwaitingPropagation)
                | (Provisioning, Mirroring)
                | (AwaitingPropagation, Mirroring)
                | (Provisioning, TearingDown)
                | (AwaitingPropagation, TearingDown)
                | (Mirroring, TearingDown)
                | (TearingDown, Done)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Done)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Idle => "Idle",
            SagaState::Provisioning => "Provisioning",
            SagaState::AwaitingPropagation => "AwaitingPropagation",
            SagaState::Mirroring => "Mirroring",
            SagaState::TearingDown => "TearingDown",
            SagaState::Done => "Done",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
