//! External collaborator traits and their implementations.

pub mod access;
pub mod git_cli;
pub mod secrets;
pub mod transport;

use std::sync::{Arc, RwLock};

pub use access::{
    AccessManagement, AccessOperation, CredentialListing, InMemoryAccessManagement,
    IssuedCredential, Visibility,
};
pub use git_cli::{GitCliRemote, GitCliRepository, GitCliTransport};
pub use secrets::{InMemorySecretStore, SecretStore};
pub use transport::{
    InMemoryRemote, InMemoryRepository, InMemoryTransport, PushOutcome, RepositoryTransport,
};

/// Shared, ordered log of collaborator calls.
///
/// The in-memory collaborators append to it when one is attached, so tests
/// can assert ordering across services (for example that no push happens
/// before the credential was seen active).
#[derive(Debug, Clone, Default)]
pub struct CallRecorder {
    calls: Arc<RwLock<Vec<String>>>,
}

impl CallRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: impl Into<String>) {
        self.calls.write().unwrap().push(call.into());
    }

    /// Returns a snapshot of every call recorded so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    /// Index of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .position(|c| c.starts_with(prefix))
    }

    /// Number of calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}
