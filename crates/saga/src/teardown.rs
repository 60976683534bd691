//! Best-effort reversal of provisioning.

use crate::config::TeardownPolicy;
use crate::error::{MirrorError, ServiceError};
use crate::events::SagaEvent;
use crate::journal::SagaJournal;
use crate::mirror_saga;
use crate::model::ScopedCredential;
use crate::services::access::AccessManagement;

/// Reverses whatever the journal says provisioning created: revoke the
/// credential, detach the policy, delete the identity, in that order.
///
/// A failed step is recorded and the next one still runs. Nothing here is
/// retried; every provisioned resource gets exactly one attempt.
pub struct TeardownCoordinator<'a, A> {
    access: &'a A,
    policy: TeardownPolicy,
}

impl<'a, A> TeardownCoordinator<'a, A>
where
    A: AccessManagement,
{
    pub fn new(access: &'a A, policy: TeardownPolicy) -> Self {
        Self { access, policy }
    }

    /// Runs every applicable teardown step and returns the failures in the
    /// order they occurred. Does nothing if provisioning created nothing.
    ///
    /// `credential` is marked revoked once its revocation succeeds.
    #[tracing::instrument(skip(self, journal, credential))]
    pub async fn run(
        &self,
        journal: &mut SagaJournal,
        credential: Option<&mut ScopedCredential>,
    ) -> Vec<MirrorError> {
        let mut errors = Vec::new();

        if let Some((identity, credential_id)) = owned(journal.issued_credential()) {
            let outcome = self.revoke_credential(&identity, &credential_id).await;
            if let (Ok(()), Some(credential)) = (&outcome, credential) {
                credential.mark_revoked();
            }
            record(journal, mirror_saga::STEP_REVOKE_CREDENTIAL, outcome, &mut errors);
        }

        if let Some((identity, policy_ref)) = owned(journal.attached_policy()) {
            let outcome = self.detach_access_policy(&identity, &policy_ref).await;
            record(journal, mirror_saga::STEP_DETACH_POLICY, outcome, &mut errors);
        }

        if let Some(identity) = journal.created_identity().map(str::to_string) {
            if self.policy.delete_identity {
                let outcome = self.delete_identity(&identity).await;
                record(journal, mirror_saga::STEP_DELETE_IDENTITY, outcome, &mut errors);
            } else {
                tracing::info!(identity = %identity, "keeping identity for reuse");
            }
        }

        errors
    }

    pub async fn revoke_credential(
        &self,
        identity: &str,
        credential_id: &str,
    ) -> Result<(), MirrorError> {
        self.access
            .delete_service_credential(identity, credential_id)
            .await
            .map_err(|e| teardown_error("deleting git credentials", e))
    }

    pub async fn detach_access_policy(
        &self,
        identity: &str,
        policy_ref: &str,
    ) -> Result<(), MirrorError> {
        self.access
            .detach_policy(identity, policy_ref)
            .await
            .map_err(|e| teardown_error("detaching permission from git user", e))
    }

    pub async fn delete_identity(&self, identity: &str) -> Result<(), MirrorError> {
        self.access
            .delete_identity(identity)
            .await
            .map_err(|e| teardown_error("deleting git user", e))
    }
}

fn owned(pair: Option<(&str, &str)>) -> Option<(String, String)> {
    pair.map(|(a, b)| (a.to_string(), b.to_string()))
}

fn teardown_error(step: &'static str, err: ServiceError) -> MirrorError {
    MirrorError::Teardown {
        step,
        reason: err.to_string(),
    }
}

fn record(
    journal: &mut SagaJournal,
    step: &str,
    outcome: Result<(), MirrorError>,
    errors: &mut Vec<MirrorError>,
) {
    match outcome {
        Ok(()) => {
            tracing::info!(step, "teardown step completed");
            journal.apply(SagaEvent::teardown_step_completed(step));
        }
        Err(err) => {
            tracing::warn!(step, error = %err, "teardown step failed");
            metrics::counter!("mirror_teardown_errors_total").increment(1);
            journal.apply(SagaEvent::teardown_step_failed(step, err.to_string()));
            errors.push(err);
        }
    }
}
