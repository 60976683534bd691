//! Provisioning of the credential used to push.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{MirrorError, ServiceError};
use crate::model::{EphemeralIdentity, ScopedCredential};
use crate::services::access::AccessManagement;
use crate::services::secrets::SecretStore;

const ACCESS_SERVICE: &str = "access-management service";
const SECRET_SERVICE: &str = "secret storage service";

/// The record stored in secret storage for the stored-secret path.
#[derive(Deserialize)]
struct StoredCredentialPayload {
    username: String,
    password: String,
}

/// Creates identities, attaches policies and issues credentials, or reads a
/// pre-existing credential from secret storage.
///
/// None of these calls is idempotent; nothing here retries.
pub struct CredentialProvisioner<'a, A, S> {
    access: &'a A,
    secrets: &'a S,
}

impl<'a, A, S> CredentialProvisioner<'a, A, S>
where
    A: AccessManagement,
    S: SecretStore,
{
    pub fn new(access: &'a A, secrets: &'a S) -> Self {
        Self { access, secrets }
    }

    /// Creates the ephemeral identity. A name collision is an error.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_identity(&self, name: &str) -> Result<EphemeralIdentity, MirrorError> {
        let created_at = self
            .access
            .create_identity(name)
            .await
            .map_err(|e| {
                access_error(e, |reason| MirrorError::IdentityCreation {
                    name: name.to_string(),
                    reason,
                })
            })?;
        tracing::info!(identity = name, "identity created");
        Ok(EphemeralIdentity::created(name, created_at))
    }

    /// Grants `policy_ref` to the identity.
    #[tracing::instrument(skip(self, identity), fields(identity = %identity.name))]
    pub async fn attach_access_policy(
        &self,
        identity: &mut EphemeralIdentity,
        policy_ref: &str,
    ) -> Result<(), MirrorError> {
        self.access
            .attach_policy(&identity.name, policy_ref)
            .await
            .map_err(|e| {
                access_error(e, |reason| MirrorError::PolicyAttach {
                    identity: identity.name.clone(),
                    policy: policy_ref.to_string(),
                    reason,
                })
            })?;
        identity.attached_policy_ref = Some(policy_ref.to_string());
        tracing::info!("policy attached");
        Ok(())
    }

    /// Mints a credential scoped to `service_ref`. It starts out pending.
    #[tracing::instrument(skip(self, identity), fields(identity = %identity.name))]
    pub async fn issue_scoped_credential(
        &self,
        identity: &EphemeralIdentity,
        service_ref: &str,
    ) -> Result<ScopedCredential, MirrorError> {
        let issued = self
            .access
            .issue_service_credential(&identity.name, service_ref)
            .await
            .map_err(|e| {
                access_error(e, |reason| MirrorError::CredentialIssuance {
                    identity: identity.name.clone(),
                    service: service_ref.to_string(),
                    reason,
                })
            })?;
        tracing::info!(credential_id = %issued.credential_id, "credential issued");
        Ok(ScopedCredential::issued(
            issued.service_username,
            issued.service_password,
            issued.service_ref,
            issued.credential_id,
        ))
    }

    /// Reads and decodes a `{username, password}` record from secret storage.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_stored_credential(
        &self,
        secret_ref: &str,
        service_ref: &str,
    ) -> Result<ScopedCredential, MirrorError> {
        let raw = self
            .secrets
            .get_secret(secret_ref)
            .await
            .map_err(|e| match e {
                ServiceError::Unreachable(reason) => MirrorError::Session {
                    service: SECRET_SERVICE,
                    reason,
                },
                other => MirrorError::SecretRetrieval {
                    secret_ref: secret_ref.to_string(),
                    reason: other.to_string(),
                },
            })?;
        let credential = decode_stored_credential(secret_ref, &raw, service_ref)?;
        tracing::info!(
            username = credential.principal_username(),
            "stored credential decoded"
        );
        Ok(credential)
    }
}

/// Decodes a stored secret into a credential.
///
/// Decode errors report only the position of the problem, never the
/// offending text, since the payload is secret.
pub fn decode_stored_credential(
    secret_ref: &str,
    raw: &SecretString,
    service_ref: &str,
) -> Result<ScopedCredential, MirrorError> {
    let payload: StoredCredentialPayload =
        serde_json::from_str(raw.expose_secret()).map_err(|e| MirrorError::SecretDecode {
            secret_ref: secret_ref.to_string(),
            reason: format!(
                "{:?} error at line {} column {}",
                e.classify(),
                e.line(),
                e.column()
            ),
        })?;

    Ok(ScopedCredential::stored(
        payload.username,
        SecretString::from(payload.password),
        service_ref,
    ))
}

/// Maps a service error into the step's domain error, except that an
/// unreachable service is always a session error.
fn access_error(err: ServiceError, domain: impl FnOnce(String) -> MirrorError) -> MirrorError {
    match err {
        ServiceError::Unreachable(reason) => MirrorError::Session {
            service: ACCESS_SERVICE,
            reason,
        },
        other => domain(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CredentialStatus;
    use crate::services::access::{AccessOperation, InMemoryAccessManagement};
    use crate::services::secrets::InMemorySecretStore;

    const SERVICE: &str = "codecommit.amazonaws.com";

    fn setup() -> (InMemoryAccessManagement, InMemorySecretStore) {
        (InMemoryAccessManagement::new(), InMemorySecretStore::new())
    }

    #[tokio::test]
    async fn test_provision_ephemeral_credential() {
        let (access, secrets) = setup();
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let mut identity = provisioner.ensure_identity("git-user").await.unwrap();
        assert!(identity.is_owned());

        provisioner
            .attach_access_policy(&mut identity, "arn:p")
            .await
            .unwrap();
        assert_eq!(identity.attached_policy_ref.as_deref(), Some("arn:p"));

        let credential = provisioner
            .issue_scoped_credential(&identity, SERVICE)
            .await
            .unwrap();
        assert_eq!(credential.status(), CredentialStatus::Pending);
        assert_eq!(credential.service_ref(), SERVICE);
        assert!(credential.credential_id().is_some());
        assert_eq!(access.credential_count("git-user"), 1);
    }

    #[tokio::test]
    async fn test_identity_collision_is_not_retried() {
        let (access, secrets) = setup();
        access.add_identity("git-user");
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let err = provisioner.ensure_identity("git-user").await.unwrap_err();
        assert!(matches!(err, MirrorError::IdentityCreation { .. }));
        assert_eq!(access.call_count(AccessOperation::CreateIdentity), 1);
    }

    #[tokio::test]
    async fn test_policy_attach_failure() {
        let (access, secrets) = setup();
        access.fail_on(AccessOperation::AttachPolicy);
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let mut identity = provisioner.ensure_identity("git-user").await.unwrap();
        let err = provisioner
            .attach_access_policy(&mut identity, "arn:p")
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PolicyAttach { .. }));
        assert!(identity.attached_policy_ref.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_session_error() {
        let (access, secrets) = setup();
        access.set_unreachable(true);
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let err = provisioner.ensure_identity("git-user").await.unwrap_err();
        assert!(matches!(err, MirrorError::Session { .. }));
    }

    #[tokio::test]
    async fn test_fetch_stored_credential_round_trip() {
        let (access, secrets) = setup();
        secrets.put(
            "mirror/dest",
            r#"{"username":"svc-mirror-at-1","password":"s3cr3t/+="}"#,
        );
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let credential = provisioner
            .fetch_stored_credential("mirror/dest", SERVICE)
            .await
            .unwrap();
        assert_eq!(credential.principal_username(), "svc-mirror-at-1");
        assert_eq!(credential.expose_secret(), "s3cr3t/+=");
        assert_eq!(credential.status(), CredentialStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_secret_is_retrieval_error() {
        let (access, secrets) = setup();
        let provisioner = CredentialProvisioner::new(&access, &secrets);

        let err = provisioner
            .fetch_stored_credential("mirror/dest", SERVICE)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::SecretRetrieval { .. }));
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let raw = SecretString::from(r#"{"username":"u"}"#.to_string());
        let err = decode_stored_credential("s", &raw, SERVICE).unwrap_err();
        assert!(matches!(err, MirrorError::SecretDecode { .. }));
    }

    #[test]
    fn test_decode_error_does_not_echo_payload() {
        let raw = SecretString::from(r#"{"username":"u","password":12345678}"#.to_string());
        let err = decode_stored_credential("s", &raw, SERVICE).unwrap_err();
        assert!(!err.to_string().contains("12345678"));
    }

    #[test]
    fn test_decode_keeps_fields_verbatim() {
        let raw = SecretString::from(r#"{"username":"","password":" p:w\"d "}"#.to_string());
        let credential = decode_stored_credential("s", &raw, SERVICE).unwrap();
        assert_eq!(credential.principal_username(), "");
        assert_eq!(credential.basic_auth().password.expose_secret(), " p:w\"d ");
    }
}
