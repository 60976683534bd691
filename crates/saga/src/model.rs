//! Invocation-scoped data model: requests, identities, credentials, results.

use chrono::{DateTime, Utc};
use common::InvocationId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MirrorError;
use crate::journal::SagaJournal;

/// What to mirror and how to authenticate. Immutable for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    pub source_url: String,
    pub destination_url: String,
    pub credential_source: CredentialSource,
}

impl MirrorRequest {
    pub fn new(
        source_url: impl Into<String>,
        destination_url: impl Into<String>,
        credential_source: CredentialSource,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            destination_url: destination_url.into(),
            credential_source,
        }
    }

    /// One-line description used as the summary message. Never contains
    /// secret material.
    pub fn describe(&self) -> String {
        format!(
            "SrcRepo: {} DestRepo: {} {}",
            self.source_url, self.destination_url, self.credential_source
        )
    }
}

/// Where the push credential comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Create an identity for this invocation and delete it afterwards.
    EphemeralIdentity { principal_name: String },
    /// Use an identity that already exists; never create or delete it.
    ExistingIdentity { principal_name: String },
    /// Read a `{username, password}` record from secret storage.
    StoredSecret { secret_ref: String },
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::EphemeralIdentity { principal_name } => {
                write!(f, "UserName: {principal_name}")
            }
            CredentialSource::ExistingIdentity { principal_name } => {
                write!(f, "ExistingUserName: {principal_name}")
            }
            CredentialSource::StoredSecret { secret_ref } => write!(f, "DestSecret: {secret_ref}"),
        }
    }
}

/// An identity the saga provisions credentials for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralIdentity {
    pub name: String,
    pub attached_policy_ref: Option<String>,
    /// Set when the saga created the identity; `None` for adopted ones.
    pub created_at: Option<DateTime<Utc>>,
}

impl EphemeralIdentity {
    /// An identity created by this invocation.
    pub fn created(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            attached_policy_ref: None,
            created_at: Some(created_at),
        }
    }

    /// A pre-existing identity the saga borrows but does not own.
    pub fn adopted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attached_policy_ref: None,
            created_at: None,
        }
    }

    /// Returns true if this invocation created the identity.
    pub fn is_owned(&self) -> bool {
        self.created_at.is_some()
    }
}

/// Lifecycle of a scoped credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialStatus {
    Pending,
    Active,
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Pending => "Pending",
            CredentialStatus::Active => "Active",
            CredentialStatus::Revoked => "Revoked",
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A username/secret pair scoped to one destination service.
///
/// The secret is held in a [`SecretString`]; `Debug` output is redacted and
/// the value is only exposed through [`BasicAuth`].
#[derive(Debug)]
pub struct ScopedCredential {
    principal_username: String,
    secret: SecretString,
    service_ref: String,
    credential_id: Option<String>,
    status: CredentialStatus,
}

impl ScopedCredential {
    /// A freshly issued credential, not yet confirmed active.
    pub fn issued(
        principal_username: impl Into<String>,
        secret: SecretString,
        service_ref: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            principal_username: principal_username.into(),
            secret,
            service_ref: service_ref.into(),
            credential_id: Some(credential_id.into()),
            status: CredentialStatus::Pending,
        }
    }

    /// A credential read verbatim from secret storage. Its status is not
    /// observable, so it is taken as active.
    pub fn stored(
        principal_username: impl Into<String>,
        secret: SecretString,
        service_ref: impl Into<String>,
    ) -> Self {
        Self {
            principal_username: principal_username.into(),
            secret,
            service_ref: service_ref.into(),
            credential_id: None,
            status: CredentialStatus::Active,
        }
    }

    pub fn principal_username(&self) -> &str {
        &self.principal_username
    }

    pub fn service_ref(&self) -> &str {
        &self.service_ref
    }

    /// The service-side ID used to revoke the credential, if it was issued.
    pub fn credential_id(&self) -> Option<&str> {
        self.credential_id.as_deref()
    }

    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    pub(crate) fn mark_active(&mut self) {
        self.status = CredentialStatus::Active;
    }

    pub(crate) fn mark_revoked(&mut self) {
        self.status = CredentialStatus::Revoked;
    }

    /// Exposes the secret for comparison in tests and decoders.
    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }

    /// Borrows the credential as a basic-auth pair for the transport.
    pub fn basic_auth(&self) -> BasicAuth<'_> {
        BasicAuth {
            username: &self.principal_username,
            password: &self.secret,
        }
    }
}

/// Basic-auth credential handed to the repository transport.
#[derive(Debug, Clone, Copy)]
pub struct BasicAuth<'a> {
    pub username: &'a str,
    pub password: &'a SecretString,
}

/// What a propagation poll was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationTarget {
    PolicyAttachment,
    CredentialActivation,
}

impl std::fmt::Display for PropagationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropagationTarget::PolicyAttachment => write!(f, "policy attachment"),
            PropagationTarget::CredentialActivation => write!(f, "credential activation"),
        }
    }
}

/// One poll of the access-management service. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationCheck {
    pub target: PropagationTarget,
    pub attempt: u32,
    pub observed_state: String,
    pub satisfied: bool,
}

/// The single externally observable output of one invocation.
#[derive(Debug)]
pub struct SagaResult {
    pub invocation_id: InvocationId,
    pub summary_message: String,
    pub fatal_error: Option<MirrorError>,
    pub teardown_errors: Vec<String>,
    pub journal: SagaJournal,
}

impl SagaResult {
    /// Returns true when mirroring succeeded and teardown was clean.
    pub fn is_success(&self) -> bool {
        self.fatal_error.is_none() && self.teardown_errors.is_empty()
    }

    /// The combined error message: the primary failure first, then every
    /// teardown failure, one per line. `None` for a clean run.
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let mut lines = Vec::with_capacity(self.teardown_errors.len() + 1);
        if let Some(err) = &self.fatal_error {
            lines.push(err.to_string());
        }
        lines.extend(self.teardown_errors.iter().cloned());
        Some(lines.join("\n"))
    }

    /// Collapses the result into `(summary, error)` form.
    pub fn into_result(self) -> Result<String, InvocationError> {
        match self.error_message() {
            None => Ok(self.summary_message),
            Some(message) => Err(InvocationError {
                summary: self.summary_message,
                message,
            }),
        }
    }
}

/// The caller-facing failure of an invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct InvocationError {
    pub summary: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(fatal: Option<MirrorError>, teardown: Vec<&str>) -> SagaResult {
        SagaResult {
            invocation_id: InvocationId::new(),
            summary_message: "SrcRepo: a DestRepo: b UserName: git-user".into(),
            fatal_error: fatal,
            teardown_errors: teardown.into_iter().map(String::from).collect(),
            journal: SagaJournal::default(),
        }
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = ScopedCredential::issued(
            "git-user-at-123",
            SecretString::from("hunter2".to_string()),
            "codecommit.amazonaws.com",
            "ACCA1",
        );
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("hunter2"));
        assert_eq!(cred.status(), CredentialStatus::Pending);
    }

    #[test]
    fn test_basic_auth_borrows_fields() {
        let cred = ScopedCredential::stored(
            "svc",
            SecretString::from("pw".to_string()),
            "codecommit.amazonaws.com",
        );
        let auth = cred.basic_auth();
        assert_eq!(auth.username, "svc");
        assert_eq!(auth.password.expose_secret(), "pw");
        assert_eq!(cred.status(), CredentialStatus::Active);
        assert!(cred.credential_id().is_none());
    }

    #[test]
    fn test_identity_ownership() {
        assert!(EphemeralIdentity::created("a", Utc::now()).is_owned());
        assert!(!EphemeralIdentity::adopted("a").is_owned());
    }

    #[test]
    fn test_describe_has_no_secret_fields() {
        let request = MirrorRequest::new(
            "https://github.com/o/r.git",
            "https://git-codecommit.eu-west-1.amazonaws.com/v1/repos/r",
            CredentialSource::StoredSecret {
                secret_ref: "dest-secret".into(),
            },
        );
        assert_eq!(
            request.describe(),
            "SrcRepo: https://github.com/o/r.git DestRepo: https://git-codecommit.eu-west-1.amazonaws.com/v1/repos/r DestSecret: dest-secret"
        );
    }

    #[test]
    fn test_clean_result_has_no_error() {
        let result = result_with(None, vec![]);
        assert!(result.is_success());
        assert_eq!(
            result.into_result().unwrap(),
            "SrcRepo: a DestRepo: b UserName: git-user"
        );
    }

    #[test]
    fn test_primary_failure_listed_before_teardown_failures() {
        let result = result_with(
            Some(MirrorError::Push {
                attempts: 25,
                reason: "authorization not yet effective".into(),
            }),
            vec!["error deleting git credentials: throttled"],
        );
        let err = result.into_result().unwrap_err();
        let lines: Vec<&str> = err.message.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("error pushing to destination repo"));
        assert_eq!(lines[1], "error deleting git credentials: throttled");
    }

    #[test]
    fn test_teardown_only_failure_is_an_error() {
        let result = result_with(None, vec!["error deleting git user: busy"]);
        assert!(!result.is_success());
        assert_eq!(
            result.error_message().as_deref(),
            Some("error deleting git user: busy")
        );
    }
}
