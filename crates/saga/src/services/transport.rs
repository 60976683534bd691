//! Repository transport trait and in-memory implementation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::model::BasicAuth;
use crate::services::CallRecorder;

/// Successful push results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The destination accepted new or changed refs.
    Pushed { refs_updated: usize },
    /// The destination already matched the source.
    UpToDate,
}

/// Clone, remote registration and authenticated push.
#[async_trait]
pub trait RepositoryTransport: Send + Sync {
    /// A cloned working repository.
    type Repository: Send + Sync;
    /// A registered remote of a [`Self::Repository`].
    type Remote: Send + Sync;

    /// Clones `url` without credentials.
    async fn clone_repository(&self, url: &str) -> Result<Self::Repository, TransportError>;

    /// Registers `url` as remote `name` of `repo`.
    async fn create_remote(
        &self,
        repo: &Self::Repository,
        name: &str,
        url: &str,
    ) -> Result<Self::Remote, TransportError>;

    /// Pushes every branch and tag to `remote` using basic auth.
    async fn push(
        &self,
        remote: &Self::Remote,
        auth: BasicAuth<'_>,
    ) -> Result<PushOutcome, TransportError>;
}

type Refs = BTreeMap<String, String>;

/// A repository cloned by [`InMemoryTransport`].
#[derive(Debug)]
pub struct InMemoryRepository {
    source_url: String,
    refs: Refs,
    remotes: Mutex<Vec<String>>,
}

impl InMemoryRepository {
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn refs(&self) -> &Refs {
        &self.refs
    }
}

/// A remote registered by [`InMemoryTransport`].
#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    pub name: String,
    pub url: String,
    refs: Refs,
}

#[derive(Debug, Default)]
struct InMemoryTransportState {
    sources: HashMap<String, Refs>,
    destinations: HashMap<String, Refs>,
    clone_failure: Option<TransportError>,
    remote_failure: Option<TransportError>,
    push_failures: VecDeque<TransportError>,
    clones: u32,
    push_attempts: u32,
    push_usernames: Vec<String>,
    recorder: Option<CallRecorder>,
}

/// In-memory repository transport for testing.
///
/// Sources and destinations are plain ref maps. Push failures are scripted
/// as a queue consumed one entry per push attempt.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<InMemoryTransportState>>,
}

impl InMemoryTransport {
    /// Creates a new in-memory transport with no repositories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every call into `recorder`.
    pub fn with_recorder(self, recorder: CallRecorder) -> Self {
        self.state.write().unwrap().recorder = Some(recorder);
        self
    }

    /// Registers a source repository with the given `(ref, commit)` pairs.
    pub fn add_source(&self, url: &str, refs: &[(&str, &str)]) {
        self.state
            .write()
            .unwrap()
            .sources
            .insert(url.to_string(), to_refs(refs));
    }

    /// Registers a destination repository with the given refs.
    pub fn add_destination(&self, url: &str, refs: &[(&str, &str)]) {
        self.state
            .write()
            .unwrap()
            .destinations
            .insert(url.to_string(), to_refs(refs));
    }

    /// Makes the next clone fail with `err`.
    pub fn fail_clone(&self, err: TransportError) {
        self.state.write().unwrap().clone_failure = Some(err);
    }

    /// Makes the next remote registration fail with `err`.
    pub fn fail_create_remote(&self, err: TransportError) {
        self.state.write().unwrap().remote_failure = Some(err);
    }

    /// Queues push failures, returned in order by successive pushes.
    pub fn script_push_failures(&self, failures: impl IntoIterator<Item = TransportError>) {
        self.state
            .write()
            .unwrap()
            .push_failures
            .extend(failures);
    }

    /// Refs currently held by a destination.
    pub fn destination_refs(&self, url: &str) -> Option<Refs> {
        self.state.read().unwrap().destinations.get(url).cloned()
    }

    pub fn clone_count(&self) -> u32 {
        self.state.read().unwrap().clones
    }

    pub fn push_attempts(&self) -> u32 {
        self.state.read().unwrap().push_attempts
    }

    /// Usernames presented on each push attempt, in order.
    pub fn push_usernames(&self) -> Vec<String> {
        self.state.read().unwrap().push_usernames.clone()
    }
}

fn to_refs(refs: &[(&str, &str)]) -> Refs {
    refs.iter()
        .map(|(name, commit)| (name.to_string(), commit.to_string()))
        .collect()
}

#[async_trait]
impl RepositoryTransport for InMemoryTransport {
    type Repository = InMemoryRepository;
    type Remote = InMemoryRemote;

    async fn clone_repository(&self, url: &str) -> Result<Self::Repository, TransportError> {
        let mut state = self.state.write().unwrap();
        state.clones += 1;
        if let Some(recorder) = &state.recorder {
            recorder.record(format!("transport.clone {url}"));
        }
        if let Some(err) = state.clone_failure.take() {
            return Err(err);
        }

        let refs = state
            .sources
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::Network(format!("repository not found: {url}")))?;
        Ok(InMemoryRepository {
            source_url: url.to_string(),
            refs,
            remotes: Mutex::new(Vec::new()),
        })
    }

    async fn create_remote(
        &self,
        repo: &Self::Repository,
        name: &str,
        url: &str,
    ) -> Result<Self::Remote, TransportError> {
        let mut state = self.state.write().unwrap();
        if let Some(recorder) = &state.recorder {
            recorder.record(format!("transport.create_remote {name} {url}"));
        }
        if let Some(err) = state.remote_failure.take() {
            return Err(err);
        }

        let mut remotes = repo.remotes.lock().unwrap();
        if remotes.iter().any(|r| r == name) {
            return Err(TransportError::Protocol(format!("remote already exists: {name}")));
        }
        remotes.push(name.to_string());

        Ok(InMemoryRemote {
            name: name.to_string(),
            url: url.to_string(),
            refs: repo.refs.clone(),
        })
    }

    async fn push(
        &self,
        remote: &Self::Remote,
        auth: BasicAuth<'_>,
    ) -> Result<PushOutcome, TransportError> {
        let mut state = self.state.write().unwrap();
        state.push_attempts += 1;
        state.push_usernames.push(auth.username.to_string());
        if let Some(recorder) = &state.recorder {
            recorder.record(format!("transport.push {} {}", remote.name, auth.username));
        }
        if let Some(err) = state.push_failures.pop_front() {
            return Err(err);
        }

        let destination = state
            .destinations
            .get_mut(&remote.url)
            .ok_or_else(|| TransportError::Network(format!("repository not found: {}", remote.url)))?;

        let mut refs_updated = 0;
        for (name, commit) in &remote.refs {
            if destination.get(name) != Some(commit) {
                destination.insert(name.clone(), commit.clone());
                refs_updated += 1;
            }
        }

        if refs_updated == 0 {
            Ok(PushOutcome::UpToDate)
        } else {
            Ok(PushOutcome::Pushed { refs_updated })
        }
    }
}
