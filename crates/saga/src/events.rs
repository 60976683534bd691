//! Saga journal events.

use chrono::{DateTime, Utc};
use common::InvocationId;
use serde::{Deserialize, Serialize};

use crate::state::SagaState;

/// Events recorded while a mirroring saga runs.
///
/// Events carry resource references (identity names, policy refs,
/// credential IDs) but never secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Saga execution started.
    SagaStarted(SagaStartedData),

    /// The saga moved to a new state.
    StateChanged(StateChangedData),

    /// A saga step started execution.
    StepStarted(StepData),

    /// A saga step completed successfully.
    StepCompleted(StepCompletedData),

    /// A saga step failed.
    StepFailed(StepFailedData),

    /// Teardown started.
    TeardownStarted(TeardownData),

    /// A teardown step completed successfully.
    TeardownStepCompleted(StepData),

    /// A teardown step failed (recorded, teardown continues).
    TeardownStepFailed(StepFailedData),

    /// Mirroring succeeded and teardown finished.
    SagaCompleted(SagaCompletedData),

    /// The saga finished with a failure.
    SagaFailed(SagaFailedData),
}

impl SagaEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StateChanged(_) => "StateChanged",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::TeardownStarted(_) => "TeardownStarted",
            SagaEvent::TeardownStepCompleted(_) => "TeardownStepCompleted",
            SagaEvent::TeardownStepFailed(_) => "TeardownStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub invocation_id: InvocationId,
    pub saga_type: String,
    pub source_url: String,
    pub destination_url: String,
    pub started_at: DateTime<Utc>,
}

/// Data for StateChanged event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedData {
    pub from: SagaState,
    pub to: SagaState,
}

/// Data for step started/completed events (just the step name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepData {
    pub step_name: String,
}

/// Data for StepCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_name: String,
    /// Identity name (set by create_identity and attach_policy).
    pub identity: Option<String>,
    /// Policy reference (set by attach_policy).
    pub policy_ref: Option<String>,
    /// Service-side credential ID (set by issue_credential).
    pub credential_id: Option<String>,
}

/// Data for StepFailed and TeardownStepFailed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub error: String,
}

/// Data for TeardownStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownData {
    /// The step that failed, or `None` when mirroring succeeded.
    pub after_failure_in: Option<String>,
}

/// Data for SagaCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub completed_at: DateTime<Utc>,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    /// Creates a SagaStarted event.
    pub fn saga_started(
        invocation_id: InvocationId,
        source_url: impl Into<String>,
        destination_url: impl Into<String>,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            invocation_id,
            saga_type: crate::mirror_saga::SAGA_TYPE.to_string(),
            source_url: source_url.into(),
            destination_url: destination_url.into(),
            started_at: Utc::now(),
        })
    }

    /// Creates a StateChanged event.
    pub fn state_changed(from: SagaState, to: SagaState) -> Self {
        SagaEvent::StateChanged(StateChangedData { from, to })
    }

    /// Creates a StepStarted event.
    pub fn step_started(step_name: impl Into<String>) -> Self {
        SagaEvent::StepStarted(StepData {
            step_name: step_name.into(),
        })
    }

    /// Creates a StepCompleted event that provisioned nothing.
    pub fn step_completed(step_name: impl Into<String>) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_name: step_name.into(),
            identity: None,
            policy_ref: None,
            credential_id: None,
        })
    }

    /// Creates a StepCompleted event for a created identity.
    pub fn identity_created(identity: impl Into<String>) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_name: crate::mirror_saga::STEP_CREATE_IDENTITY.to_string(),
            identity: Some(identity.into()),
            policy_ref: None,
            credential_id: None,
        })
    }

    /// Creates a StepCompleted event for an attached policy.
    pub fn policy_attached(identity: impl Into<String>, policy_ref: impl Into<String>) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_name: crate::mirror_saga::STEP_ATTACH_POLICY.to_string(),
            identity: Some(identity.into()),
            policy_ref: Some(policy_ref.into()),
            credential_id: None,
        })
    }

    /// Creates a StepCompleted event for an issued credential.
    pub fn credential_issued(identity: impl Into<String>, credential_id: impl Into<String>) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step_name: crate::mirror_saga::STEP_ISSUE_CREDENTIAL.to_string(),
            identity: Some(identity.into()),
            policy_ref: None,
            credential_id: Some(credential_id.into()),
        })
    }

    /// Creates a StepFailed event.
    pub fn step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    /// Creates a TeardownStarted event.
    pub fn teardown_started(after_failure_in: Option<String>) -> Self {
        SagaEvent::TeardownStarted(TeardownData { after_failure_in })
    }

    /// Creates a TeardownStepCompleted event.
    pub fn teardown_step_completed(step_name: impl Into<String>) -> Self {
        SagaEvent::TeardownStepCompleted(StepData {
            step_name: step_name.into(),
        })
    }

    /// Creates a TeardownStepFailed event.
    pub fn teardown_step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::TeardownStepFailed(StepFailedData {
            step_name: step_name.into(),
            error: error.into(),
        })
    }

    /// Creates a SagaCompleted event.
    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            completed_at: Utc::now(),
        })
    }

    /// Creates a SagaFailed event.
    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }
}
