//! Saga controller driving one mirror invocation from request to result.

use std::time::Duration;

use common::InvocationId;
use tokio::time::Instant;

use crate::config::SagaConfig;
use crate::error::MirrorError;
use crate::events::SagaEvent;
use crate::executor::{MirrorExecutor, PushReport};
use crate::journal::SagaJournal;
use crate::mirror_saga;
use crate::model::{
    CredentialSource, EphemeralIdentity, MirrorRequest, SagaResult, ScopedCredential,
};
use crate::propagation::PropagationWaiter;
use crate::provisioner::CredentialProvisioner;
use crate::services::access::AccessManagement;
use crate::services::secrets::SecretStore;
use crate::services::transport::RepositoryTransport;
use crate::state::SagaState;
use crate::teardown::TeardownCoordinator;

/// Orchestrates the mirror saga.
///
/// Provisioning, propagation and mirroring run forward; the first fatal
/// error stops them. Teardown then runs on every exit path, including an
/// expired deadline, and the outcome is folded into a [`SagaResult`].
///
/// The deadline cuts off waits and repository I/O only. A call that creates
/// an access-management resource always runs to completion and is journaled
/// before the deadline is checked again, so teardown knows about everything
/// that exists.
pub struct SagaController<A, S, T>
where
    A: AccessManagement,
    S: SecretStore,
    T: RepositoryTransport,
{
    access: A,
    secrets: S,
    transport: T,
    config: SagaConfig,
}

impl<A, S, T> SagaController<A, S, T>
where
    A: AccessManagement,
    S: SecretStore,
    T: RepositoryTransport,
{
    /// Creates a new saga controller.
    pub fn new(access: A, secrets: S, transport: T, config: SagaConfig) -> Self {
        Self {
            access,
            secrets,
            transport,
            config,
        }
    }

    /// Runs one invocation. Never fails; every failure is reported in the
    /// returned result.
    #[tracing::instrument(
        skip(self, request),
        fields(saga_type = mirror_saga::SAGA_TYPE, invocation_id = tracing::field::Empty)
    )]
    pub async fn run(&self, request: &MirrorRequest) -> SagaResult {
        metrics::counter!("mirror_saga_executions_total").increment(1);
        let saga_start = std::time::Instant::now();

        let invocation_id = InvocationId::new();
        tracing::Span::current().record("invocation_id", tracing::field::display(invocation_id));
        tracing::info!(request = %request.describe(), "saga started");

        let mut journal =
            SagaJournal::start(invocation_id, &request.source_url, &request.destination_url);
        let mut credential = None;

        // 1. Forward phases, bounded by the deadline if one is set
        let deadline = Deadline::after(self.config.deadline);
        let outcome = self
            .forward(request, deadline, &mut journal, &mut credential)
            .await;

        if let Err(err) = &outcome {
            tracing::error!(error = %err, state = %journal.state(), "saga aborted");
        }

        // 2. Teardown, always
        let teardown_errors = self.tear_down(&mut journal, credential.as_mut()).await;

        // 3. Result
        let fatal_error = outcome.err();
        match &fatal_error {
            None if teardown_errors.is_empty() => {
                journal.apply(SagaEvent::saga_completed());
                metrics::counter!("mirror_saga_completed").increment(1);
            }
            None => {
                journal.apply(SagaEvent::saga_failed(format!(
                    "{} teardown step(s) failed",
                    teardown_errors.len()
                )));
                metrics::counter!("mirror_saga_failed").increment(1);
            }
            Some(err) => {
                journal.apply(SagaEvent::saga_failed(err.to_string()));
                metrics::counter!("mirror_saga_failed").increment(1);
            }
        }

        let duration = saga_start.elapsed().as_secs_f64();
        metrics::histogram!("mirror_saga_duration_seconds").record(duration);
        tracing::info!(
            %invocation_id,
            duration,
            success = fatal_error.is_none() && teardown_errors.is_empty(),
            teardown_errors = teardown_errors.len(),
            "saga finished"
        );

        SagaResult {
            invocation_id,
            summary_message: request.describe(),
            fatal_error,
            teardown_errors: teardown_errors.iter().map(ToString::to_string).collect(),
            journal,
        }
    }

    /// Provisioning, propagation and mirroring. Every resource created is
    /// journaled before the next step starts, so teardown sees it even if a
    /// later step fails or the deadline cuts this short.
    async fn forward(
        &self,
        request: &MirrorRequest,
        deadline: Deadline,
        journal: &mut SagaJournal,
        slot: &mut Option<ScopedCredential>,
    ) -> Result<PushReport, MirrorError> {
        journal.transition(SagaState::Provisioning)?;
        let provisioner = CredentialProvisioner::new(&self.access, &self.secrets);

        let credential: &ScopedCredential = match &request.credential_source {
            CredentialSource::EphemeralIdentity { principal_name } => {
                deadline.check(journal.state())?;
                begin(journal, mirror_saga::STEP_CREATE_IDENTITY);
                let identity = provisioner
                    .ensure_identity(principal_name)
                    .await
                    .map_err(|e| failed(journal, mirror_saga::STEP_CREATE_IDENTITY, e))?;
                journal.apply(SagaEvent::identity_created(&identity.name));

                self.provision_for(&provisioner, identity, deadline, journal, slot)
                    .await?
            }
            CredentialSource::ExistingIdentity { principal_name } => {
                let identity = EphemeralIdentity::adopted(principal_name.as_str());
                self.provision_for(&provisioner, identity, deadline, journal, slot)
                    .await?
            }
            CredentialSource::StoredSecret { secret_ref } => {
                begin(journal, mirror_saga::STEP_FETCH_SECRET);
                let fetch =
                    provisioner.fetch_stored_credential(secret_ref, &self.config.service_ref);
                let stored = deadline
                    .bound(journal.state(), fetch)
                    .await
                    .map_err(|e| failed(journal, mirror_saga::STEP_FETCH_SECRET, e))?;
                journal.apply(SagaEvent::step_completed(mirror_saga::STEP_FETCH_SECRET));
                &*slot.insert(stored)
            }
        };

        journal.transition(SagaState::Mirroring)?;
        self.mirror(request, credential, deadline, journal).await
    }

    /// Attaches the policy, waits for it, issues the credential and waits
    /// for it to become active. Leaves the active credential in `slot`.
    async fn provision_for<'c>(
        &self,
        provisioner: &CredentialProvisioner<'_, A, S>,
        mut identity: EphemeralIdentity,
        deadline: Deadline,
        journal: &mut SagaJournal,
        slot: &'c mut Option<ScopedCredential>,
    ) -> Result<&'c ScopedCredential, MirrorError> {
        let waiter = PropagationWaiter::new(&self.access, self.config.propagation);
        let policy_ref = self.config.policy_ref.as_str();
        let service_ref = self.config.service_ref.as_str();

        deadline.check(journal.state())?;
        begin(journal, mirror_saga::STEP_ATTACH_POLICY);
        provisioner
            .attach_access_policy(&mut identity, policy_ref)
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_ATTACH_POLICY, e))?;
        journal.apply(SagaEvent::policy_attached(&identity.name, policy_ref));

        begin(journal, mirror_saga::STEP_AWAIT_POLICY);
        let visible = waiter.wait_for_policy_attachment(&identity.name, policy_ref);
        deadline
            .bound(journal.state(), visible)
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_AWAIT_POLICY, e))?;
        journal.apply(SagaEvent::step_completed(mirror_saga::STEP_AWAIT_POLICY));

        deadline.check(journal.state())?;
        begin(journal, mirror_saga::STEP_ISSUE_CREDENTIAL);
        let issued = provisioner
            .issue_scoped_credential(&identity, service_ref)
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_ISSUE_CREDENTIAL, e))?;
        if let Some(credential_id) = issued.credential_id() {
            journal.apply(SagaEvent::credential_issued(&identity.name, credential_id));
        }
        let issued = slot.insert(issued);

        journal.transition(SagaState::AwaitingPropagation)?;
        begin(journal, mirror_saga::STEP_AWAIT_CREDENTIAL);
        let active =
            waiter.wait_for_credential_active(&identity.name, service_ref, issued.credential_id());
        deadline
            .bound(journal.state(), active)
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_AWAIT_CREDENTIAL, e))?;
        issued.mark_active();
        journal.apply(SagaEvent::step_completed(mirror_saga::STEP_AWAIT_CREDENTIAL));

        Ok(&*issued)
    }

    /// Clone, register the destination, push.
    async fn mirror(
        &self,
        request: &MirrorRequest,
        credential: &ScopedCredential,
        deadline: Deadline,
        journal: &mut SagaJournal,
    ) -> Result<PushReport, MirrorError> {
        let executor = MirrorExecutor::new(&self.transport, self.config.push);
        let phase = journal.state();

        begin(journal, mirror_saga::STEP_CLONE_SOURCE);
        let repo = deadline
            .bound(phase, executor.clone_source(&request.source_url))
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_CLONE_SOURCE, e))?;
        journal.apply(SagaEvent::step_completed(mirror_saga::STEP_CLONE_SOURCE));

        begin(journal, mirror_saga::STEP_REGISTER_REMOTE);
        let register =
            executor.register_remote(&repo, &self.config.remote_name, &request.destination_url);
        let remote = deadline
            .bound(phase, register)
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_REGISTER_REMOTE, e))?;
        journal.apply(SagaEvent::step_completed(mirror_saga::STEP_REGISTER_REMOTE));

        begin(journal, mirror_saga::STEP_PUSH);
        let report = deadline
            .bound(phase, executor.push_with_retry(&remote, credential))
            .await
            .map_err(|e| failed(journal, mirror_saga::STEP_PUSH, e))?;
        journal.apply(SagaEvent::step_completed(mirror_saga::STEP_PUSH));

        Ok(report)
    }

    /// Moves to `TearingDown`, reverses provisioning, moves to `Done`.
    async fn tear_down(
        &self,
        journal: &mut SagaJournal,
        credential: Option<&mut ScopedCredential>,
    ) -> Vec<MirrorError> {
        if let Err(err) = journal.transition(SagaState::TearingDown) {
            tracing::error!(error = %err, "unexpected state before teardown");
        }
        let after_failure_in = journal.failed_step().map(str::to_string);
        journal.apply(SagaEvent::teardown_started(after_failure_in));

        let errors = TeardownCoordinator::new(&self.access, self.config.teardown)
            .run(journal, credential)
            .await;

        if let Err(err) = journal.transition(SagaState::Done) {
            tracing::error!(error = %err, "unexpected state after teardown");
        }
        errors
    }
}

/// Point in time after which no forward step starts.
#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(limit: Option<Duration>) -> Self {
        Self(limit.map(|limit| Instant::now() + limit))
    }

    fn check(self, phase: SagaState) -> Result<(), MirrorError> {
        match self.0 {
            Some(at) if Instant::now() >= at => Err(MirrorError::DeadlineExceeded { phase }),
            _ => Ok(()),
        }
    }

    /// Runs `work` unless the deadline has passed, dropping it if the
    /// deadline passes first. Only for work that creates nothing teardown
    /// would have to undo.
    async fn bound<T>(
        self,
        phase: SagaState,
        work: impl Future<Output = Result<T, MirrorError>>,
    ) -> Result<T, MirrorError> {
        self.check(phase)?;
        match self.0 {
            Some(at) => tokio::time::timeout_at(at, work)
                .await
                .unwrap_or_else(|_| Err(MirrorError::DeadlineExceeded { phase })),
            None => work.await,
        }
    }
}

fn begin(journal: &mut SagaJournal, step: &'static str) {
    tracing::info!(step, "saga step started");
    journal.apply(SagaEvent::step_started(step));
}

fn failed(journal: &mut SagaJournal, step: &'static str, err: MirrorError) -> MirrorError {
    tracing::warn!(step, error = %err, "saga step failed");
    journal.apply(SagaEvent::step_failed(step, err.to_string()));
    err
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::config::{PollPolicy, RetryPolicy};
    use crate::error::{ServiceError, TransportError};
    use crate::services::access::{
        AccessOperation, CredentialListing, InMemoryAccessManagement, IssuedCredential,
        Visibility,
    };
    use crate::services::secrets::InMemorySecretStore;
    use crate::services::transport::InMemoryTransport;

    const SRC: &str = "https://github.com/o/r.git";
    const DST: &str = "https://git-codecommit.us-east-1.amazonaws.com/v1/repos/r";

    fn setup() -> (
        SagaController<InMemoryAccessManagement, InMemorySecretStore, InMemoryTransport>,
        InMemoryAccessManagement,
        InMemoryTransport,
    ) {
        let access = InMemoryAccessManagement::new();
        let transport = InMemoryTransport::new();
        transport.add_source(SRC, &[("refs/heads/main", "c1"), ("refs/heads/dev", "c2")]);
        transport.add_destination(DST, &[]);
        let config = SagaConfig {
            propagation: PollPolicy {
                interval: Duration::from_secs(3),
                max_attempts: 5,
            },
            push: RetryPolicy::default(),
            ..SagaConfig::default()
        };
        let controller = SagaController::new(
            access.clone(),
            InMemorySecretStore::new(),
            transport.clone(),
            config,
        );
        (controller, access, transport)
    }

    fn ephemeral() -> MirrorRequest {
        MirrorRequest::new(
            SRC,
            DST,
            CredentialSource::EphemeralIdentity {
                principal_name: "git-user".into(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path() {
        let (controller, access, transport) = setup();

        let result = controller.run(&ephemeral()).await;

        assert!(result.is_success(), "{:?}", result.error_message());
        assert_eq!(result.journal.state(), SagaState::Done);
        assert_eq!(
            result.journal.completed_steps(),
            &[
                "create_identity",
                "attach_policy",
                "await_policy",
                "issue_credential",
                "await_credential",
                "clone_source",
                "register_remote",
                "push"
            ]
        );
        assert!(!access.identity_exists("git-user"));
        assert_eq!(transport.destination_refs(DST).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_failure_still_tears_down() {
        let (controller, access, transport) = setup();
        transport.fail_clone(TransportError::Network("connection reset".into()));

        let result = controller.run(&ephemeral()).await;

        assert!(matches!(result.fatal_error, Some(MirrorError::Clone { .. })));
        assert!(result.teardown_errors.is_empty());
        assert!(!access.identity_exists("git-user"));
        assert_eq!(transport.push_attempts(), 0);
        assert_eq!(result.journal.failed_step(), Some("clone_source"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_never_active() {
        let (controller, access, transport) = setup();
        access.set_credential_activation(Visibility::Never);

        let result = controller.run(&ephemeral()).await;

        assert!(matches!(
            result.fatal_error,
            Some(MirrorError::PropagationTimeout { .. })
        ));
        assert_eq!(transport.clone_count(), 0);
        assert_eq!(access.call_count(AccessOperation::DeleteServiceCredential), 1);
        assert!(!access.identity_exists("git-user"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_collision_creates_nothing_to_undo() {
        let (controller, access, _) = setup();
        access.add_identity("git-user");

        let result = controller.run(&ephemeral()).await;

        assert!(matches!(
            result.fatal_error,
            Some(MirrorError::IdentityCreation { .. })
        ));
        // The pre-existing identity belongs to someone else.
        assert!(access.identity_exists("git-user"));
        assert_eq!(access.call_count(AccessOperation::DeleteIdentity), 0);
        assert!(result.journal.teardown_attempts().is_empty());
    }

    /// Access service whose credential issuance takes effect immediately but
    /// answers only after `delay`.
    struct SlowIssuance {
        inner: InMemoryAccessManagement,
        delay: Duration,
    }

    #[async_trait]
    impl AccessManagement for SlowIssuance {
        async fn create_identity(&self, name: &str) -> Result<DateTime<Utc>, ServiceError> {
            self.inner.create_identity(name).await
        }

        async fn delete_identity(&self, name: &str) -> Result<(), ServiceError> {
            self.inner.delete_identity(name).await
        }

        async fn attach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError> {
            self.inner.attach_policy(identity, policy_ref).await
        }

        async fn detach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError> {
            self.inner.detach_policy(identity, policy_ref).await
        }

        async fn list_attached_policies(&self, identity: &str) -> Result<Vec<String>, ServiceError> {
            self.inner.list_attached_policies(identity).await
        }

        async fn issue_service_credential(
            &self,
            identity: &str,
            service_ref: &str,
        ) -> Result<IssuedCredential, ServiceError> {
            let issued = self.inner.issue_service_credential(identity, service_ref).await;
            tokio::time::sleep(self.delay).await;
            issued
        }

        async fn delete_service_credential(
            &self,
            identity: &str,
            credential_id: &str,
        ) -> Result<(), ServiceError> {
            self.inner.delete_service_credential(identity, credential_id).await
        }

        async fn list_service_credentials(
            &self,
            identity: &str,
        ) -> Result<Vec<CredentialListing>, ServiceError> {
            self.inner.list_service_credentials(identity).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_issuance_still_revokes_credential() {
        let access = InMemoryAccessManagement::new();
        let transport = InMemoryTransport::new();
        transport.add_source(SRC, &[("refs/heads/main", "c1")]);
        transport.add_destination(DST, &[]);
        let config = SagaConfig {
            deadline: Some(Duration::from_secs(5)),
            ..SagaConfig::default()
        };
        let controller = SagaController::new(
            SlowIssuance {
                inner: access.clone(),
                delay: Duration::from_secs(10),
            },
            InMemorySecretStore::new(),
            transport.clone(),
            config,
        );

        let result = controller.run(&ephemeral()).await;

        assert!(matches!(
            result.fatal_error,
            Some(MirrorError::DeadlineExceeded {
                phase: SagaState::AwaitingPropagation
            })
        ));
        assert!(result.teardown_errors.is_empty(), "{:?}", result.teardown_errors);
        assert_eq!(
            result.journal.teardown_attempts(),
            &["revoke_credential", "detach_policy", "delete_identity"]
        );
        assert_eq!(access.credential_count("git-user"), 0);
        assert!(!access.identity_exists("git-user"));
        assert_eq!(transport.clone_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_starts_no_new_step() {
        let access = InMemoryAccessManagement::new();
        let controller = SagaController::new(
            access.clone(),
            InMemorySecretStore::new(),
            InMemoryTransport::new(),
            SagaConfig {
                deadline: Some(Duration::ZERO),
                ..SagaConfig::default()
            },
        );

        let result = controller.run(&ephemeral()).await;

        assert!(matches!(
            result.fatal_error,
            Some(MirrorError::DeadlineExceeded {
                phase: SagaState::Provisioning
            })
        ));
        assert_eq!(access.call_count(AccessOperation::CreateIdentity), 0);
        assert!(result.journal.teardown_attempts().is_empty());
    }
}
