//! Clone, remote registration and push with bounded retry.

use crate::config::RetryPolicy;
use crate::error::{MirrorError, TransportError};
use crate::model::{CredentialStatus, ScopedCredential};
use crate::services::transport::{PushOutcome, RepositoryTransport};

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub outcome: PushOutcome,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Mirrors a source repository into a destination.
///
/// Only [`TransportError::AuthNotReady`] is retried, and only by
/// [`MirrorExecutor::push_with_retry`]. Clone and remote registration
/// failures are never retried.
pub struct MirrorExecutor<'a, T> {
    transport: &'a T,
    retry: RetryPolicy,
}

impl<'a, T> MirrorExecutor<'a, T>
where
    T: RepositoryTransport,
{
    pub fn new(transport: &'a T, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Clones the source repository.
    #[tracing::instrument(skip(self))]
    pub async fn clone_source(&self, source_url: &str) -> Result<T::Repository, MirrorError> {
        let repo = self
            .transport
            .clone_repository(source_url)
            .await
            .map_err(|e| MirrorError::Clone {
                url: source_url.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!("source cloned");
        Ok(repo)
    }

    /// Registers the destination as remote `name`.
    #[tracing::instrument(skip(self, repo))]
    pub async fn register_remote(
        &self,
        repo: &T::Repository,
        name: &str,
        destination_url: &str,
    ) -> Result<T::Remote, MirrorError> {
        self.transport
            .create_remote(repo, name, destination_url)
            .await
            .map_err(|e| MirrorError::RemoteRegistration {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Pushes with `credential`, retrying while the destination reports the
    /// credential as not yet authorized.
    ///
    /// "Nothing to push" is a success. Any other transport error, or running
    /// out of attempts, is a fatal [`MirrorError::Push`].
    #[tracing::instrument(
        skip(self, remote, credential),
        fields(principal = credential.principal_username(), max_attempts = self.retry.max_attempts)
    )]
    pub async fn push_with_retry(
        &self,
        remote: &T::Remote,
        credential: &ScopedCredential,
    ) -> Result<PushReport, MirrorError> {
        if credential.status() != CredentialStatus::Active {
            return Err(MirrorError::CredentialNotActive {
                principal: credential.principal_username().to_string(),
                status: credential.status().to_string(),
            });
        }

        for attempt in 1..=self.retry.max_attempts {
            metrics::counter!("mirror_push_attempts_total").increment(1);
            match self.transport.push(remote, credential.basic_auth()).await {
                Ok(outcome) => {
                    tracing::info!(attempt, ?outcome, "push succeeded");
                    return Ok(PushReport {
                        outcome,
                        attempts: attempt,
                    });
                }
                Err(TransportError::AuthNotReady) => {
                    tracing::warn!(attempt, "credential not ready, retrying");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "push failed");
                    return Err(MirrorError::Push {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(MirrorError::Push {
            attempts: self.retry.max_attempts,
            reason: MirrorError::AuthNotReady.to_string(),
        })
    }
}
