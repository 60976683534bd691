//! Saga configuration, read once at the start of an invocation.

use std::time::Duration;

use thiserror::Error;

use crate::mirror_saga;
use crate::model::{CredentialSource, MirrorRequest};

/// Bounded polling for propagation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 20,
        }
    }
}

/// Bounded retry for pushes that hit the transient authorization condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            delay: Duration::from_secs(5),
        }
    }
}

/// Which teardown steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownPolicy {
    /// Delete an identity this invocation created. When false the identity
    /// is left behind, credential-less and policy-less, for reuse.
    pub delete_identity: bool,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            delete_identity: true,
        }
    }
}

/// Settings for the saga itself, independent of what is being mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaConfig {
    pub policy_ref: String,
    pub service_ref: String,
    pub remote_name: String,
    pub propagation: PollPolicy,
    pub push: RetryPolicy,
    pub teardown: TeardownPolicy,
    /// Bound on the forward phases. Teardown always runs after it expires.
    pub deadline: Option<Duration>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            policy_ref: mirror_saga::DEFAULT_POLICY_REF.to_string(),
            service_ref: mirror_saga::DEFAULT_SERVICE_REF.to_string(),
            remote_name: mirror_saga::DEFAULT_REMOTE_NAME.to_string(),
            propagation: PollPolicy::default(),
            push: RetryPolicy::default(),
            teardown: TeardownPolicy::default(),
            deadline: None,
        }
    }
}

/// Errors building a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("one of USER_NAME, EXISTING_USER_NAME or DEST_SECRET must be set")]
    MissingCredentialSource,

    #[error("only one of USER_NAME, EXISTING_USER_NAME or DEST_SECRET may be set, got {0}")]
    AmbiguousCredentialSource(String),
}

/// Everything one invocation needs: the request and the saga settings.
///
/// Reads from environment variables:
/// - `SRC_REPO`, `DEST_REPO` (required)
/// - exactly one of `USER_NAME` (ephemeral identity), `EXISTING_USER_NAME`,
///   `DEST_SECRET` (stored secret reference)
/// - `POLICY_ARN`, `SERVICE_NAME`, `REMOTE_NAME`
/// - `POLL_INTERVAL_SECS`, `POLL_MAX_ATTEMPTS`
/// - `PUSH_MAX_ATTEMPTS`, `PUSH_RETRY_DELAY_SECS`
/// - `DELETE_IDENTITY` (`true`/`false`), `DEADLINE_SECS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub request: MirrorRequest,
    pub saga: SagaConfig,
}

impl MirrorConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source_url = get("SRC_REPO").ok_or(ConfigError::Missing("SRC_REPO"))?;
        let destination_url = get("DEST_REPO").ok_or(ConfigError::Missing("DEST_REPO"))?;

        let mut sources = Vec::new();
        if let Some(principal_name) = get("USER_NAME") {
            sources.push(("USER_NAME", CredentialSource::EphemeralIdentity { principal_name }));
        }
        if let Some(principal_name) = get("EXISTING_USER_NAME") {
            sources.push((
                "EXISTING_USER_NAME",
                CredentialSource::ExistingIdentity { principal_name },
            ));
        }
        if let Some(secret_ref) = get("DEST_SECRET") {
            sources.push(("DEST_SECRET", CredentialSource::StoredSecret { secret_ref }));
        }
        let credential_source = match sources.len() {
            0 => return Err(ConfigError::MissingCredentialSource),
            1 => sources.remove(0).1,
            _ => {
                let names: Vec<&str> = sources.iter().map(|(name, _)| *name).collect();
                return Err(ConfigError::AmbiguousCredentialSource(names.join(", ")));
            }
        };

        let defaults = SagaConfig::default();
        let saga = SagaConfig {
            policy_ref: get("POLICY_ARN").unwrap_or(defaults.policy_ref),
            service_ref: get("SERVICE_NAME").unwrap_or(defaults.service_ref),
            remote_name: get("REMOTE_NAME").unwrap_or(defaults.remote_name),
            propagation: PollPolicy {
                interval: parse_secs("POLL_INTERVAL_SECS", get("POLL_INTERVAL_SECS"))?
                    .unwrap_or(defaults.propagation.interval),
                max_attempts: parse_attempts("POLL_MAX_ATTEMPTS", get("POLL_MAX_ATTEMPTS"))?
                    .unwrap_or(defaults.propagation.max_attempts),
            },
            push: RetryPolicy {
                max_attempts: parse_attempts("PUSH_MAX_ATTEMPTS", get("PUSH_MAX_ATTEMPTS"))?
                    .unwrap_or(defaults.push.max_attempts),
                delay: parse_secs("PUSH_RETRY_DELAY_SECS", get("PUSH_RETRY_DELAY_SECS"))?
                    .unwrap_or(defaults.push.delay),
            },
            teardown: TeardownPolicy {
                delete_identity: parse_bool("DELETE_IDENTITY", get("DELETE_IDENTITY"))?
                    .unwrap_or(defaults.teardown.delete_identity),
            },
            deadline: parse_secs("DEADLINE_SECS", get("DEADLINE_SECS"))?,
        };

        Ok(Self {
            request: MirrorRequest {
                source_url,
                destination_url,
                credential_source,
            },
            saga,
        })
    }
}

fn parse_secs(name: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid {
                    name,
                    value: v,
                    reason: "expected whole seconds",
                })
        })
        .transpose()
}

fn parse_attempts(name: &'static str, value: Option<String>) -> Result<Option<u32>, ConfigError> {
    value
        .map(|v| match v.trim().parse::<u32>() {
            Ok(0) => Err(ConfigError::Invalid {
                name,
                value: v,
                reason: "must be at least 1",
            }),
            Ok(n) => Ok(n),
            Err(_) => Err(ConfigError::Invalid {
                name,
                value: v,
                reason: "expected a positive integer",
            }),
        })
        .transpose()
}

fn parse_bool(name: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: v,
                reason: "expected true or false",
            }),
        })
        .transpose()
}
