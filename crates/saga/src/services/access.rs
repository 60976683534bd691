//! Access-management service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::ServiceError;
use crate::model::CredentialStatus;
use crate::services::CallRecorder;

/// A service-scoped credential as returned at issuance time.
///
/// This is the only moment the password is available.
#[derive(Debug)]
pub struct IssuedCredential {
    pub credential_id: String,
    pub service_username: String,
    pub service_password: SecretString,
    pub service_ref: String,
}

/// A service-scoped credential as returned by a list call (no secret).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialListing {
    pub credential_id: String,
    pub service_ref: String,
    pub status: CredentialStatus,
}

/// Identity and access-management operations used by the saga.
///
/// Writes are not immediately visible to list calls; callers poll.
#[async_trait]
pub trait AccessManagement: Send + Sync {
    /// Creates an identity, returning its creation time.
    async fn create_identity(&self, name: &str) -> Result<DateTime<Utc>, ServiceError>;

    /// Deletes an identity. Fails while it still has policies or credentials.
    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError>;

    /// Attaches a managed policy to an identity.
    async fn attach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError>;

    /// Detaches a managed policy from an identity.
    async fn detach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError>;

    /// Lists the policies currently visible as attached.
    async fn list_attached_policies(&self, identity: &str) -> Result<Vec<String>, ServiceError>;

    /// Issues a credential usable only against `service_ref`.
    async fn issue_service_credential(
        &self,
        identity: &str,
        service_ref: &str,
    ) -> Result<IssuedCredential, ServiceError>;

    /// Deletes a service-scoped credential.
    async fn delete_service_credential(
        &self,
        identity: &str,
        credential_id: &str,
    ) -> Result<(), ServiceError>;

    /// Lists the identity's service-scoped credentials and their status.
    async fn list_service_credentials(
        &self,
        identity: &str,
    ) -> Result<Vec<CredentialListing>, ServiceError>;
}

/// Operations of [`AccessManagement`], used for fault injection and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessOperation {
    CreateIdentity,
    DeleteIdentity,
    AttachPolicy,
    DetachPolicy,
    ListAttachedPolicies,
    IssueServiceCredential,
    DeleteServiceCredential,
    ListServiceCredentials,
}

impl AccessOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessOperation::CreateIdentity => "create_identity",
            AccessOperation::DeleteIdentity => "delete_identity",
            AccessOperation::AttachPolicy => "attach_policy",
            AccessOperation::DetachPolicy => "detach_policy",
            AccessOperation::ListAttachedPolicies => "list_attached_policies",
            AccessOperation::IssueServiceCredential => "issue_service_credential",
            AccessOperation::DeleteServiceCredential => "delete_service_credential",
            AccessOperation::ListServiceCredentials => "list_service_credentials",
        }
    }
}

/// How long a write takes to show up in list calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Visible on the first list call.
    #[default]
    Immediate,
    /// Hidden from the first `n` list calls.
    AfterPolls(u32),
    /// Never becomes visible.
    Never,
}

impl Visibility {
    fn countdown(self) -> Option<u32> {
        match self {
            Visibility::Immediate => Some(0),
            Visibility::AfterPolls(n) => Some(n),
            Visibility::Never => None,
        }
    }
}

#[derive(Debug)]
struct PolicyRecord {
    policy_ref: String,
    hidden_for: Option<u32>,
}

#[derive(Debug)]
struct CredentialRecord {
    credential_id: String,
    service_ref: String,
    inactive_for: Option<u32>,
}

#[derive(Debug)]
struct IdentityRecord {
    policies: Vec<PolicyRecord>,
    credentials: Vec<CredentialRecord>,
}

#[derive(Debug, Default)]
struct InMemoryAccessState {
    identities: HashMap<String, IdentityRecord>,
    next_id: u32,
    policy_visibility: Visibility,
    credential_activation: Visibility,
    unreachable: bool,
    failing: Vec<AccessOperation>,
    call_counts: HashMap<AccessOperation, u32>,
    recorder: Option<CallRecorder>,
}

impl InMemoryAccessState {
    fn enter(&mut self, op: AccessOperation, detail: &str) -> Result<(), ServiceError> {
        *self.call_counts.entry(op).or_insert(0) += 1;
        if let Some(recorder) = &self.recorder {
            recorder.record(format!("access.{} {}", op.as_str(), detail));
        }
        if self.unreachable {
            return Err(ServiceError::Unreachable("connection refused".to_string()));
        }
        if self.failing.contains(&op) {
            return Err(ServiceError::Rejected(format!(
                "{} denied by injected fault",
                op.as_str()
            )));
        }
        Ok(())
    }

    fn identity_mut(&mut self, name: &str) -> Result<&mut IdentityRecord, ServiceError> {
        self.identities
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(format!("identity {name}")))
    }
}

/// In-memory access-management service for testing.
///
/// Models the parts of the real service the saga depends on: name
/// collisions, delete conflicts, and delayed visibility of writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccessManagement {
    state: Arc<RwLock<InMemoryAccessState>>,
}

impl InMemoryAccessManagement {
    /// Creates a new in-memory access-management service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every call into `recorder`.
    pub fn with_recorder(self, recorder: CallRecorder) -> Self {
        self.state.write().unwrap().recorder = Some(recorder);
        self
    }

    /// Seeds an identity that exists before the saga runs.
    pub fn add_identity(&self, name: &str) {
        self.state.write().unwrap().identities.insert(
            name.to_string(),
            IdentityRecord {
                policies: Vec::new(),
                credentials: Vec::new(),
            },
        );
    }

    /// Controls when policy attachments become visible to list calls.
    pub fn set_policy_visibility(&self, visibility: Visibility) {
        self.state.write().unwrap().policy_visibility = visibility;
    }

    /// Controls when issued credentials are reported active.
    pub fn set_credential_activation(&self, visibility: Visibility) {
        self.state.write().unwrap().credential_activation = visibility;
    }

    /// Makes every call fail as if the service could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.write().unwrap().unreachable = unreachable;
    }

    /// Makes every call to `op` fail with a rejection.
    pub fn fail_on(&self, op: AccessOperation) {
        self.state.write().unwrap().failing.push(op);
    }

    /// Returns true if the identity exists.
    pub fn identity_exists(&self, name: &str) -> bool {
        self.state.read().unwrap().identities.contains_key(name)
    }

    /// Policies attached to the identity, regardless of visibility.
    pub fn attached_policies(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .identities
            .get(name)
            .map(|i| i.policies.iter().map(|p| p.policy_ref.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of credentials the identity holds.
    pub fn credential_count(&self, name: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .identities
            .get(name)
            .map(|i| i.credentials.len())
            .unwrap_or(0)
    }

    /// How many times `op` was called.
    pub fn call_count(&self, op: AccessOperation) -> u32 {
        self.state
            .read()
            .unwrap()
            .call_counts
            .get(&op)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AccessManagement for InMemoryAccessManagement {
    async fn create_identity(&self, name: &str) -> Result<DateTime<Utc>, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(AccessOperation::CreateIdentity, name)?;

        if state.identities.contains_key(name) {
            return Err(ServiceError::Conflict(format!("identity {name}")));
        }
        state.identities.insert(
            name.to_string(),
            IdentityRecord {
                policies: Vec::new(),
                credentials: Vec::new(),
            },
        );
        Ok(Utc::now())
    }

    async fn delete_identity(&self, name: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(AccessOperation::DeleteIdentity, name)?;

        let identity = state.identity_mut(name)?;
        if !identity.policies.is_empty() || !identity.credentials.is_empty() {
            return Err(ServiceError::Rejected(format!(
                "identity {name} still has attached policies or credentials"
            )));
        }
        state.identities.remove(name);
        Ok(())
    }

    async fn attach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(
            AccessOperation::AttachPolicy,
            &format!("{identity} {policy_ref}"),
        )?;

        let hidden_for = state.policy_visibility.countdown();
        let record = state.identity_mut(identity)?;
        if !record.policies.iter().any(|p| p.policy_ref == policy_ref) {
            record.policies.push(PolicyRecord {
                policy_ref: policy_ref.to_string(),
                hidden_for,
            });
        }
        Ok(())
    }

    async fn detach_policy(&self, identity: &str, policy_ref: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(
            AccessOperation::DetachPolicy,
            &format!("{identity} {policy_ref}"),
        )?;

        let record = state.identity_mut(identity)?;
        let before = record.policies.len();
        record.policies.retain(|p| p.policy_ref != policy_ref);
        if record.policies.len() == before {
            return Err(ServiceError::NotFound(format!(
                "policy {policy_ref} on {identity}"
            )));
        }
        Ok(())
    }

    async fn list_attached_policies(&self, identity: &str) -> Result<Vec<String>, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(AccessOperation::ListAttachedPolicies, identity)?;

        let record = state.identity_mut(identity)?;
        let mut visible = Vec::new();
        for policy in &mut record.policies {
            match policy.hidden_for {
                Some(0) => visible.push(policy.policy_ref.clone()),
                Some(n) => policy.hidden_for = Some(n - 1),
                None => {}
            }
        }
        Ok(visible)
    }

    async fn issue_service_credential(
        &self,
        identity: &str,
        service_ref: &str,
    ) -> Result<IssuedCredential, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(
            AccessOperation::IssueServiceCredential,
            &format!("{identity} {service_ref}"),
        )?;

        state.next_id += 1;
        let credential_id = format!("ACCA{:08}", state.next_id);
        let inactive_for = state.credential_activation.countdown();

        let record = state.identity_mut(identity)?;
        if record
            .credentials
            .iter()
            .filter(|c| c.service_ref == service_ref)
            .count()
            >= 2
        {
            return Err(ServiceError::Rejected(format!(
                "{identity} already holds two credentials for {service_ref}"
            )));
        }
        record.credentials.push(CredentialRecord {
            credential_id: credential_id.clone(),
            service_ref: service_ref.to_string(),
            inactive_for,
        });

        Ok(IssuedCredential {
            credential_id,
            service_username: format!("{identity}-at-{:06}", state.next_id),
            service_password: SecretString::from(uuid::Uuid::new_v4().simple().to_string()),
            service_ref: service_ref.to_string(),
        })
    }

    async fn delete_service_credential(
        &self,
        identity: &str,
        credential_id: &str,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(
            AccessOperation::DeleteServiceCredential,
            &format!("{identity} {credential_id}"),
        )?;

        let record = state.identity_mut(identity)?;
        let before = record.credentials.len();
        record
            .credentials
            .retain(|c| c.credential_id != credential_id);
        if record.credentials.len() == before {
            return Err(ServiceError::NotFound(format!("credential {credential_id}")));
        }
        Ok(())
    }

    async fn list_service_credentials(
        &self,
        identity: &str,
    ) -> Result<Vec<CredentialListing>, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.enter(AccessOperation::ListServiceCredentials, identity)?;

        let record = state.identity_mut(identity)?;
        let mut listings = Vec::with_capacity(record.credentials.len());
        for credential in &mut record.credentials {
            let status = match credential.inactive_for {
                Some(0) => CredentialStatus::Active,
                Some(n) => {
                    credential.inactive_for = Some(n - 1);
                    CredentialStatus::Pending
                }
                None => CredentialStatus::Pending,
            };
            listings.push(CredentialListing {
                credential_id: credential.credential_id.clone(),
                service_ref: credential.service_ref.clone(),
                status,
            });
        }
        Ok(listings)
    }
}
