//! Repository transport backed by the system `git` binary.
//!
//! Every operation shells out through [`tokio::process::Command`]. Basic-auth
//! credentials are handed to git as an `http.extraHeader` through the
//! `GIT_CONFIG_*` environment variables, so they never appear on a command
//! line or in a log line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use secrecy::ExposeSecret;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::model::BasicAuth;
use crate::services::transport::{PushOutcome, RepositoryTransport};

/// Refspecs pushed to the destination: every branch and every tag.
const PUSH_REFSPECS: [&str; 2] = ["refs/heads/*:refs/heads/*", "refs/tags/*:refs/tags/*"];

/// A mirror clone living in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct GitCliRepository {
    _dir: TempDir,
    path: PathBuf,
}

impl GitCliRepository {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A remote registered in a [`GitCliRepository`].
#[derive(Debug, Clone)]
pub struct GitCliRemote {
    repo_path: PathBuf,
    pub name: String,
    pub url: String,
}

/// Transport that drives the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCliTransport {
    git: PathBuf,
}

impl Default for GitCliTransport {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }
}

impl GitCliTransport {
    /// Uses `git` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific git executable.
    pub fn with_binary(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

async fn run(mut cmd: Command, what: &str) -> Result<(String, String), TransportError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| TransportError::Protocol(format!("failed to spawn git {what}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        debug!(status = %output.status, "git {what} failed");
        return Err(classify_failure(&stderr));
    }
    Ok((stdout, stderr))
}

/// `Authorization` header value for basic auth.
fn basic_auth_header(auth: &BasicAuth<'_>) -> String {
    let raw = format!("{}:{}", auth.username, auth.password.expose_secret());
    format!(
        "Authorization: Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// Maps git's stderr on failure to a typed transport error.
///
/// The destination answers 401/403 while a freshly issued credential has not
/// propagated yet; that is the one condition reported as `AuthNotReady`.
/// With prompts disabled, git reports a 401 challenge as being unable to read
/// a username or password.
fn classify_failure(stderr: &str) -> TransportError {
    let lower = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("authentication failed")
        || lower.contains("returned error: 401")
        || lower.contains("returned error: 403")
        || lower.contains("could not read username")
        || lower.contains("could not read password")
        || lower.contains("terminal prompts disabled")
    {
        TransportError::AuthNotReady
    } else if lower.contains("could not resolve host")
        || lower.contains("failed to connect")
        || lower.contains("connection timed out")
        || lower.contains("connection refused")
        || lower.contains("unable to access")
    {
        TransportError::Network(message)
    } else if lower.contains("[rejected]") || lower.contains("failed to push some refs") {
        TransportError::Rejected(message)
    } else {
        TransportError::Protocol(message)
    }
}

/// Counts refs the destination changed, from `git push --porcelain` stdout.
///
/// Status flags: ` ` fast-forward, `+` forced, `-` deleted, `*` new,
/// `=` up to date, `!` rejected.
fn count_updated_refs(stdout: &str) -> usize {
    stdout
        .lines()
        .filter(|line| line.contains('\t'))
        .filter(|line| matches!(line.chars().next(), Some(' ' | '+' | '-' | '*')))
        .count()
}

#[async_trait]
impl RepositoryTransport for GitCliTransport {
    type Repository = GitCliRepository;
    type Remote = GitCliRemote;

    #[instrument(skip(self))]
    async fn clone_repository(&self, url: &str) -> Result<Self::Repository, TransportError> {
        let dir = tempfile::tempdir()
            .map_err(|e| TransportError::Protocol(format!("failed to create temp dir: {e}")))?;
        let path = dir.path().join("repo.git");

        let mut cmd = self.command();
        cmd.arg("clone").arg("--mirror").arg("--quiet").arg(url).arg(&path);
        run(cmd, "clone --mirror").await?;

        debug!(path = %path.display(), "git clone --mirror succeeded");
        Ok(GitCliRepository { _dir: dir, path })
    }

    #[instrument(skip(self, repo))]
    async fn create_remote(
        &self,
        repo: &Self::Repository,
        name: &str,
        url: &str,
    ) -> Result<Self::Remote, TransportError> {
        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(&repo.path)
            .arg("remote")
            .arg("add")
            .arg(name)
            .arg(url);
        run(cmd, "remote add").await?;

        Ok(GitCliRemote {
            repo_path: repo.path.clone(),
            name: name.to_string(),
            url: url.to_string(),
        })
    }

    #[instrument(skip(self, remote, auth), fields(remote = %remote.name))]
    async fn push(
        &self,
        remote: &Self::Remote,
        auth: BasicAuth<'_>,
    ) -> Result<PushOutcome, TransportError> {
        let mut cmd = self.command();
        cmd.env("GIT_CONFIG_COUNT", "1")
            .env("GIT_CONFIG_KEY_0", "http.extraHeader")
            .env("GIT_CONFIG_VALUE_0", basic_auth_header(&auth));
        cmd.arg("-C")
            .arg(&remote.repo_path)
            .arg("push")
            .arg("--porcelain")
            .arg(&remote.name)
            .args(PUSH_REFSPECS);

        let (stdout, stderr) = run(cmd, "push").await?;
        let refs_updated = count_updated_refs(&stdout);
        debug!(refs_updated, "git push complete");

        if refs_updated == 0 || stderr.contains("Everything up-to-date") {
            Ok(PushOutcome::UpToDate)
        } else {
            Ok(PushOutcome::Pushed { refs_updated })
        }
    }
}
