//! Invocation-scoped saga journal.

use common::InvocationId;
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::events::SagaEvent;
use crate::mirror_saga;
use crate::state::SagaState;

/// The in-memory record of one saga run.
///
/// Events are applied in order; the journal tracks the current state and
/// every resource provisioning actually created, which is what teardown
/// reads to decide what to reverse. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaJournal {
    id: Option<InvocationId>,
    state: SagaState,
    completed_steps: Vec<String>,
    /// Identity created by this invocation.
    created_identity: Option<String>,
    /// Identity the policy was attached to, and the policy reference.
    attached_policy: Option<(String, String)>,
    /// Identity owning the issued credential, and its service-side ID.
    issued_credential: Option<(String, String)>,
    teardown_attempts: Vec<String>,
    failed_step: Option<String>,
    failure_reason: Option<String>,
    events: Vec<SagaEvent>,
}

impl SagaJournal {
    /// Starts a journal for a new invocation.
    pub fn start(invocation_id: InvocationId, source_url: &str, destination_url: &str) -> Self {
        let mut journal = Self::default();
        journal.apply(SagaEvent::saga_started(
            invocation_id,
            source_url,
            destination_url,
        ));
        journal
    }

    /// Applies an event, updating the journal.
    pub fn apply(&mut self, event: SagaEvent) {
        match &event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.invocation_id);
            }
            SagaEvent::StateChanged(data) => {
                self.state = data.to;
            }
            SagaEvent::StepStarted(_) => {}
            SagaEvent::StepCompleted(data) => {
                self.completed_steps.push(data.step_name.clone());
                match data.step_name.as_str() {
                    mirror_saga::STEP_CREATE_IDENTITY => {
                        self.created_identity = data.identity.clone();
                    }
                    mirror_saga::STEP_ATTACH_POLICY => {
                        if let (Some(identity), Some(policy)) = (&data.identity, &data.policy_ref) {
                            self.attached_policy = Some((identity.clone(), policy.clone()));
                        }
                    }
                    mirror_saga::STEP_ISSUE_CREDENTIAL => {
                        if let (Some(identity), Some(id)) = (&data.identity, &data.credential_id) {
                            self.issued_credential = Some((identity.clone(), id.clone()));
                        }
                    }
                    _ => {}
                }
            }
            SagaEvent::StepFailed(data) => {
                self.failed_step = Some(data.step_name.clone());
                self.failure_reason = Some(data.error.clone());
            }
            SagaEvent::TeardownStarted(_) => {}
            SagaEvent::TeardownStepCompleted(data) => {
                self.teardown_attempts.push(data.step_name.clone());
            }
            SagaEvent::TeardownStepFailed(data) => {
                self.teardown_attempts.push(data.step_name.clone());
            }
            SagaEvent::SagaCompleted(_) => {}
            SagaEvent::SagaFailed(data) => {
                self.failure_reason = Some(data.reason.clone());
            }
        }
        self.events.push(event);
    }

    /// Moves the saga to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SagaState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MirrorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.apply(SagaEvent::state_changed(self.state, next));
        Ok(())
    }
}

// Query methods
impl SagaJournal {
    pub fn id(&self) -> Option<InvocationId> {
        self.id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Returns the list of completed forward step names.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Identity created by this invocation, if any.
    pub fn created_identity(&self) -> Option<&str> {
        self.created_identity.as_deref()
    }

    /// `(identity, policy_ref)` of the policy attachment, if any.
    pub fn attached_policy(&self) -> Option<(&str, &str)> {
        self.attached_policy
            .as_ref()
            .map(|(identity, policy)| (identity.as_str(), policy.as_str()))
    }

    /// `(identity, credential_id)` of the issued credential, if any.
    pub fn issued_credential(&self) -> Option<(&str, &str)> {
        self.issued_credential
            .as_ref()
            .map(|(identity, id)| (identity.as_str(), id.as_str()))
    }

    /// Teardown steps attempted, in order, whether they succeeded or not.
    pub fn teardown_attempts(&self) -> &[String] {
        &self.teardown_attempts
    }

    /// The forward step that failed, if any.
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Every event applied so far, oldest first.
    pub fn events(&self) -> &[SagaEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> SagaJournal {
        SagaJournal::start(InvocationId::new(), "src", "dst")
    }

    #[test]
    fn test_default_journal() {
        let journal = SagaJournal::default();
        assert!(journal.id().is_none());
        assert_eq!(journal.state(), SagaState::Idle);
        assert!(journal.completed_steps().is_empty());
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_start_records_invocation() {
        let id = InvocationId::new();
        let journal = SagaJournal::start(id, "src", "dst");
        assert_eq!(journal.id(), Some(id));
        assert_eq!(journal.state(), SagaState::Idle);
        assert_eq!(journal.events().len(), 1);
    }

    #[test]
    fn test_provisioning_is_tracked() {
        let mut journal = started();
        journal.transition(SagaState::Provisioning).unwrap();

        journal.apply(SagaEvent::step_started(mirror_saga::STEP_CREATE_IDENTITY));
        journal.apply(SagaEvent::identity_created("git-user"));
        assert_eq!(journal.created_identity(), Some("git-user"));

        journal.apply(SagaEvent::step_started(mirror_saga::STEP_ATTACH_POLICY));
        journal.apply(SagaEvent::policy_attached("git-user", "arn:policy"));
        assert_eq!(journal.attached_policy(), Some(("git-user", "arn:policy")));

        journal.apply(SagaEvent::step_started(mirror_saga::STEP_ISSUE_CREDENTIAL));
        journal.apply(SagaEvent::credential_issued("git-user", "ACCA1"));
        assert_eq!(journal.issued_credential(), Some(("git-user", "ACCA1")));

        assert_eq!(
            journal.completed_steps(),
            &["create_identity", "attach_policy", "issue_credential"]
        );
    }

    #[test]
    fn test_failed_step_provisions_nothing() {
        let mut journal = started();
        journal.transition(SagaState::Provisioning).unwrap();
        journal.apply(SagaEvent::identity_created("git-user"));
        journal.apply(SagaEvent::step_started(mirror_saga::STEP_ATTACH_POLICY));
        journal.apply(SagaEvent::step_failed(
            mirror_saga::STEP_ATTACH_POLICY,
            "access denied",
        ));

        assert_eq!(journal.created_identity(), Some("git-user"));
        assert!(journal.attached_policy().is_none());
        assert_eq!(journal.failure_reason(), Some("access denied"));
        assert_eq!(journal.failed_step(), Some(mirror_saga::STEP_ATTACH_POLICY));
        assert!(journal.completed_steps().is_empty());
    }

    #[test]
    fn test_transition_guard() {
        let mut journal = started();
        let err = journal.transition(SagaState::Mirroring).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::InvalidTransition {
                from: SagaState::Idle,
                to: SagaState::Mirroring
            }
        ));
        assert_eq!(journal.state(), SagaState::Idle);
    }

    #[test]
    fn test_teardown_attempts_include_failures() {
        let mut journal = started();
        journal.apply(SagaEvent::teardown_started(Some("push".into())));
        journal.apply(SagaEvent::teardown_step_completed("revoke_credential"));
        journal.apply(SagaEvent::teardown_step_failed("detach_policy", "throttled"));

        assert_eq!(
            journal.teardown_attempts(),
            &["revoke_credential", "detach_policy"]
        );
    }

    #[test]
    fn test_serialization() {
        let mut journal = started();
        journal.transition(SagaState::Provisioning).unwrap();
        journal.apply(SagaEvent::identity_created("git-user"));

        let json = serde_json::to_string(&journal).unwrap();
        let deserialized: SagaJournal = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.state(), SagaState::Provisioning);
        assert_eq!(deserialized.created_identity(), Some("git-user"));
        assert_eq!(deserialized.events().len(), journal.events().len());
    }
}
