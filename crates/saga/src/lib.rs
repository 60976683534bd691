//! Credential-lifecycle saga for mirroring a git repository.
//!
//! One invocation provisions a short-lived credential, waits for it to
//! propagate, mirrors the source repository into the destination with it,
//! and revokes it again:
//! 1. Create an identity (or adopt an existing one), attach the write
//!    policy and wait for it to be visible
//! 2. Issue a service-scoped credential and wait for it to become active
//!    (or read a stored `{username, password}` secret instead)
//! 3. Clone the source, register the destination remote, push with bounded
//!    retry while the destination has not yet honoured the credential
//! 4. Revoke the credential, detach the policy, delete the identity
//!
//! Teardown runs on every exit path. Its failures are reported alongside,
//! never instead of, the primary failure.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod journal;
pub mod mirror_saga;
pub mod model;
pub mod propagation;
pub mod provisioner;
pub mod services;
pub mod state;
pub mod teardown;
pub mod telemetry;

pub use config::{ConfigError, MirrorConfig, PollPolicy, RetryPolicy, SagaConfig, TeardownPolicy};
pub use controller::SagaController;
pub use error::{MirrorError, ServiceError, TransportError};
pub use events::SagaEvent;
pub use executor::{MirrorExecutor, PushReport};
pub use journal::SagaJournal;
pub use model::{
    BasicAuth, CredentialSource, CredentialStatus, EphemeralIdentity, InvocationError,
    MirrorRequest, PropagationCheck, PropagationTarget, SagaResult, ScopedCredential,
};
pub use propagation::PropagationWaiter;
pub use provisioner::CredentialProvisioner;
pub use services::{
    AccessManagement, CallRecorder, GitCliTransport, InMemoryAccessManagement,
    InMemorySecretStore, InMemoryTransport, PushOutcome, RepositoryTransport, SecretStore,
};
pub use state::SagaState;
pub use teardown::TeardownCoordinator;
pub use telemetry::{LogFormat, init_tracing};
