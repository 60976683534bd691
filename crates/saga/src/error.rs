//! Saga error types.

use thiserror::Error;

use crate::model::PropagationTarget;
use crate::state::SagaState;

/// Errors raised by the mirroring saga.
///
/// Every variant except [`MirrorError::AuthNotReady`] is fatal to the phase
/// that produced it. `AuthNotReady` is absorbed by the push retry loop and
/// only escapes it as a [`MirrorError::Push`] once the budget is spent.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The access-management or secret service could not be reached.
    #[error("error reaching {service}: {reason}")]
    Session {
        service: &'static str,
        reason: String,
    },

    /// The ephemeral identity could not be created.
    #[error("error creating identity '{name}': {reason}")]
    IdentityCreation { name: String, reason: String },

    /// The access policy could not be attached to the identity.
    #[error("error attaching policy '{policy}' to '{identity}': {reason}")]
    PolicyAttach {
        identity: String,
        policy: String,
        reason: String,
    },

    /// The service-scoped credential could not be issued.
    #[error("error issuing '{service}' credential for '{identity}': {reason}")]
    CredentialIssuance {
        identity: String,
        service: String,
        reason: String,
    },

    /// The stored secret could not be read.
    #[error("error reading secret '{secret_ref}': {reason}")]
    SecretRetrieval { secret_ref: String, reason: String },

    /// The stored secret is not a `{username, password}` record.
    #[error("error decoding secret '{secret_ref}': {reason}")]
    SecretDecode { secret_ref: String, reason: String },

    /// A propagation check did not succeed within its poll budget.
    #[error("{target} for '{identity}' not visible after {attempts} checks")]
    PropagationTimeout {
        target: PropagationTarget,
        identity: String,
        attempts: u32,
    },

    /// The source repository could not be cloned.
    #[error("clone of source repo '{url}' failed: {reason}")]
    Clone { url: String, reason: String },

    /// The destination could not be registered as a remote.
    #[error("create remote '{name}' failed: {reason}")]
    RemoteRegistration { name: String, reason: String },

    /// The destination has not yet honoured the credential. Retryable.
    #[error("credential not yet authorized by destination")]
    AuthNotReady,

    /// Pushing to the destination failed.
    #[error("error pushing to destination repo after {attempts} attempt(s): {reason}")]
    Push { attempts: u32, reason: String },

    /// The executor was handed a credential that is not confirmed active.
    #[error("credential for '{principal}' is {status}, refusing to use it")]
    CredentialNotActive { principal: String, status: String },

    /// The caller's deadline expired during a forward phase.
    #[error("deadline exceeded while {phase}")]
    DeadlineExceeded { phase: SagaState },

    /// The state machine was asked to make an illegal move.
    #[error("invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    /// A teardown step failed. Recorded, never raised.
    #[error("error {step}: {reason}")]
    Teardown { step: &'static str, reason: String },
}

/// Errors reported by the access-management and secret services.
///
/// These are service-level failures; the caller maps them into a
/// [`MirrorError`] naming the step that was being attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The service could not be reached at all.
    #[error("service unreachable: {0}")]
    Unreachable(String),

    /// The entity already exists.
    #[error("entity already exists: {0}")]
    Conflict(String),

    /// The entity does not exist.
    #[error("no such entity: {0}")]
    NotFound(String),

    /// The service refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors reported by the repository transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The credential was presented but not yet honoured.
    #[error("authorization not yet effective")]
    AuthNotReady,

    /// The remote could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The remote refused the update (non-fast-forward, hook, ...).
    #[error("update rejected: {0}")]
    Rejected(String),

    /// Anything else the transport could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, MirrorError>;
