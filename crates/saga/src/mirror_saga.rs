//! Repository mirror saga constants.

/// The saga type identifier.
pub const SAGA_TYPE: &str = "RepositoryMirror";

/// Step name: create the ephemeral identity.
pub const STEP_CREATE_IDENTITY: &str = "create_identity";

/// Step name: attach the write-access policy to the identity.
pub const STEP_ATTACH_POLICY: &str = "attach_policy";

/// Step name: wait until the policy attachment is visible.
pub const STEP_AWAIT_POLICY: &str = "await_policy";

/// Step name: issue the service-scoped credential.
pub const STEP_ISSUE_CREDENTIAL: &str = "issue_credential";

/// Step name: wait until the credential is reported active.
pub const STEP_AWAIT_CREDENTIAL: &str = "await_credential";

/// Step name: read the credential from secret storage.
pub const STEP_FETCH_SECRET: &str = "fetch_secret";

/// Step name: clone the source repository.
pub const STEP_CLONE_SOURCE: &str = "clone_source";

/// Step name: register the destination as a remote.
pub const STEP_REGISTER_REMOTE: &str = "register_remote";

/// Step name: push to the destination.
pub const STEP_PUSH: &str = "push";

/// Teardown step: revoke the issued credential.
pub const STEP_REVOKE_CREDENTIAL: &str = "revoke_credential";

/// Teardown step: detach the policy from the identity.
pub const STEP_DETACH_POLICY: &str = "detach_policy";

/// Teardown step: delete the identity this invocation created.
pub const STEP_DELETE_IDENTITY: &str = "delete_identity";

/// Default policy granting repository write access.
pub const DEFAULT_POLICY_REF: &str = "arn:aws:iam::aws:policy/AWSCodeCommitPowerUser";

/// Default service principal the credential is scoped to.
pub const DEFAULT_SERVICE_REF: &str = "codecommit.amazonaws.com";

/// Default name of the destination remote.
pub const DEFAULT_REMOTE_NAME: &str = "aws";
