//! Bounded polling for eventually consistent access-management writes.

use std::future::Future;

use crate::config::PollPolicy;
use crate::error::{MirrorError, ServiceError};
use crate::model::{CredentialStatus, PropagationCheck, PropagationTarget};
use crate::services::access::AccessManagement;

/// Waits until a policy attachment or credential activation is observable.
///
/// Each wait lists the relevant entities at most `max_attempts` times,
/// sleeping `interval` between lists, then gives up with
/// [`MirrorError::PropagationTimeout`].
pub struct PropagationWaiter<'a, A> {
    access: &'a A,
    policy: PollPolicy,
}

impl<'a, A> PropagationWaiter<'a, A>
where
    A: AccessManagement,
{
    pub fn new(access: &'a A, policy: PollPolicy) -> Self {
        Self { access, policy }
    }

    /// Polls attached policies until `policy_ref` appears.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_policy_attachment(
        &self,
        identity: &str,
        policy_ref: &str,
    ) -> Result<PropagationCheck, MirrorError> {
        let access = self.access;
        self.poll(PropagationTarget::PolicyAttachment, identity, |attempt| async move {
            let policies = access
                .list_attached_policies(identity)
                .await
                .map_err(list_error)?;
            let satisfied = policies.iter().any(|p| p == policy_ref);
            let observed_state = if policies.is_empty() {
                "no policies".to_string()
            } else {
                policies.join(",")
            };
            Ok(PropagationCheck {
                target: PropagationTarget::PolicyAttachment,
                attempt,
                observed_state,
                satisfied,
            })
        })
        .await
    }

    /// Polls service credentials until one for `service_ref` is active.
    ///
    /// When `credential_id` is given only that credential counts.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_credential_active(
        &self,
        identity: &str,
        service_ref: &str,
        credential_id: Option<&str>,
    ) -> Result<PropagationCheck, MirrorError> {
        let access = self.access;
        self.poll(PropagationTarget::CredentialActivation, identity, |attempt| async move {
            let listings = access
                .list_service_credentials(identity)
                .await
                .map_err(list_error)?;
            let matching: Vec<_> = listings
                .iter()
                .filter(|c| c.service_ref == service_ref)
                .filter(|c| credential_id.is_none_or(|id| c.credential_id == id))
                .collect();
            let satisfied = matching
                .iter()
                .any(|c| c.status == CredentialStatus::Active);
            let observed_state = if matching.is_empty() {
                format!("no {service_ref} credentials")
            } else {
                matching
                    .iter()
                    .map(|c| format!("{}:{}", c.credential_id, c.status))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            Ok(PropagationCheck {
                target: PropagationTarget::CredentialActivation,
                attempt,
                observed_state,
                satisfied,
            })
        })
        .await
    }

    async fn poll<F, Fut>(
        &self,
        target: PropagationTarget,
        identity: &str,
        mut check: F,
    ) -> Result<PropagationCheck, MirrorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PropagationCheck, MirrorError>>,
    {
        let label = match target {
            PropagationTarget::PolicyAttachment => "policy_attachment",
            PropagationTarget::CredentialActivation => "credential_activation",
        };

        for attempt in 1..=self.policy.max_attempts {
            let result = check(attempt).await?;
            metrics::counter!("mirror_propagation_polls_total", "target" => label).increment(1);
            tracing::debug!(
                kind = %target,
                attempt,
                observed = %result.observed_state,
                satisfied = result.satisfied,
                "propagation check"
            );
            if result.satisfied {
                tracing::info!(kind = %target, attempt, "propagation confirmed");
                return Ok(result);
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        tracing::warn!(kind = %target, attempts = self.policy.max_attempts, "propagation timed out");
        Err(MirrorError::PropagationTimeout {
            target,
            identity: identity.to_string(),
            attempts: self.policy.max_attempts,
        })
    }
}

/// A failed list call means the service could not be queried; fatal.
fn list_error(err: ServiceError) -> MirrorError {
    MirrorError::Session {
        service: "access-management service",
        reason: err.to_string(),
    }
}
