//! Secret storage trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::ServiceError;
use crate::services::CallRecorder;

/// Read access to a secret-storage service.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the secret's text value.
    async fn get_secret(&self, secret_ref: &str) -> Result<SecretString, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemorySecretState {
    secrets: HashMap<String, String>,
    unreachable: bool,
    reads: u32,
    recorder: Option<CallRecorder>,
}

/// In-memory secret store for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySecretStore {
    state: Arc<RwLock<InMemorySecretState>>,
}

impl InMemorySecretStore {
    /// Creates a new, empty in-memory secret store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every read into `recorder`.
    pub fn with_recorder(self, recorder: CallRecorder) -> Self {
        self.state.write().unwrap().recorder = Some(recorder);
        self
    }

    /// Stores a raw secret value under `secret_ref`.
    pub fn put(&self, secret_ref: &str, value: impl Into<String>) {
        self.state
            .write()
            .unwrap()
            .secrets
            .insert(secret_ref.to_string(), value.into());
    }

    /// Makes every read fail as if the service could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.write().unwrap().unreachable = unreachable;
    }

    /// Number of reads served or refused.
    pub fn read_count(&self) -> u32 {
        self.state.read().unwrap().reads
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, secret_ref: &str) -> Result<SecretString, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.reads += 1;
        if let Some(recorder) = &state.recorder {
            recorder.record(format!("secrets.get_secret {secret_ref}"));
        }
        if state.unreachable {
            return Err(ServiceError::Unreachable("connection refused".to_string()));
        }

        state
            .secrets
            .get(secret_ref)
            .map(|value| SecretString::from(value.clone()))
            .ok_or_else(|| ServiceError::NotFound(format!("secret {secret_ref}")))
    }
}
