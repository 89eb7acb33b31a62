//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::{BackendKind, BackendParameters};
use crate::store::RetryPolicy;

/// Pool settings layered from defaults, `hangar.toml`, and `HANGAR_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HANGAR",
    discovery(
        app_name = "hangar",
        env_var = "HANGAR_CONFIG_PATH",
        config_file_name = "hangar.toml",
        dotfile_name = ".hangar.toml",
        project_file_name = "hangar.toml"
    )
)]
pub struct PoolConfig {
    /// Project whose pool this is; the storage key is derived from it.
    #[ortho_config(default = String::new())]
    pub project_name: String,
    /// Target size used by `refill` when no explicit target is given.
    #[ortho_config(default = 0)]
    pub max_pool_size: u32,
    /// Storage backend: `http`, `redis`, `local`, or `memory`.
    #[ortho_config(default = "local".to_owned())]
    pub backend: String,
    /// Endpoint of the HTTP store or Redis server.
    pub backend_url: Option<String>,
    /// Bearer token for the HTTP store.
    pub backend_token: Option<String>,
    /// Basic auth username for the HTTP store.
    pub backend_username: Option<String>,
    /// Basic auth password for the HTTP store, or the Redis password.
    pub backend_password: Option<String>,
    /// Key prefix shared by every client of a Redis pool.
    pub backend_namespace: Option<String>,
    /// Directory holding local pool files.
    pub backend_dir: Option<String>,
    /// Request timeout for the HTTP and Redis stores, in seconds.
    pub backend_timeout_secs: Option<u32>,
    /// Attempts per checkout or checkin before the pool is reported
    /// unavailable.
    #[ortho_config(default = 5)]
    pub retry_attempts: u32,
    /// Wall-clock limit per operation in seconds; `0` disables it.
    #[ortho_config(default = 60)]
    pub retry_deadline_secs: u32,
    /// Provisions run at once during a refill.
    #[ortho_config(default = 3)]
    pub refill_concurrency: u32,
    /// Command printing one JSON resource description on stdout.
    pub provision_command: Option<String>,
    /// Command logging into a resource using `HANGAR_ACTIVATION_SECRET`.
    pub activate_command: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!("set {} or add {} to hangar.toml", self.env_var, self.toml_key)
    }
}

const PROJECT_NAME: FieldMetadata =
    FieldMetadata::new("project name", "HANGAR_PROJECT_NAME", "project_name");
const BACKEND: FieldMetadata = FieldMetadata::new("backend kind", "HANGAR_BACKEND", "backend");
const BACKEND_URL: FieldMetadata =
    FieldMetadata::new("backend URL", "HANGAR_BACKEND_URL", "backend_url");
const RETRY_ATTEMPTS: FieldMetadata =
    FieldMetadata::new("retry attempts", "HANGAR_RETRY_ATTEMPTS", "retry_attempts");
const PROVISION_COMMAND: FieldMetadata = FieldMetadata::new(
    "provision command",
    "HANGAR_PROVISION_COMMAND",
    "provision_command",
);
const ACTIVATE_COMMAND: FieldMetadata = FieldMetadata::new(
    "activate command",
    "HANGAR_ACTIVATE_COMMAND",
    "activate_command",
);

impl PoolConfig {
    fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.is_none_or(|raw| raw.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hangar")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and `hangar.toml` key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(Some(&self.project_name), &PROJECT_NAME)?;
        if !self.project_name.chars().any(|ch| ch.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid(format!(
                "{} `{}` needs at least one ASCII letter or digit: {}",
                PROJECT_NAME.description,
                self.project_name,
                PROJECT_NAME.hint()
            )));
        }
        let kind = self.backend_kind()?;
        if matches!(kind, BackendKind::Http | BackendKind::Redis) {
            Self::require_field(self.backend_url.as_deref(), &BACKEND_URL)?;
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be at least 1: {}",
                RETRY_ATTEMPTS.description,
                RETRY_ATTEMPTS.hint()
            )));
        }
        Ok(())
    }

    /// Parses the configured backend kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown kinds.
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend.parse().map_err(|err| {
            ConfigError::Invalid(format!("{err}: {}", BACKEND.hint()))
        })
    }

    /// Backend parameters assembled from the `backend_*` fields.
    #[must_use]
    pub fn backend_parameters(&self) -> BackendParameters {
        let timeout = self.backend_timeout_secs.map(|secs| secs.to_string());
        [
            ("url", self.backend_url.as_deref()),
            ("token", self.backend_token.as_deref()),
            ("username", self.backend_username.as_deref()),
            ("password", self.backend_password.as_deref()),
            ("namespace", self.backend_namespace.as_deref()),
            ("dir", self.backend_dir.as_deref()),
            ("timeout_secs", timeout.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|raw| (name, raw.to_owned())))
        .collect()
    }

    /// Retry policy built from `retry_attempts` and `retry_deadline_secs`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let deadline = (self.retry_deadline_secs > 0)
            .then(|| Duration::from_secs(u64::from(self.retry_deadline_secs)));
        RetryPolicy::default()
            .with_max_attempts(self.retry_attempts)
            .with_deadline(deadline)
    }

    /// Refill target from `max_pool_size`.
    #[must_use]
    pub fn default_refill_target(&self) -> usize {
        usize::try_from(self.max_pool_size).unwrap_or(usize::MAX)
    }

    /// Concurrency from `refill_concurrency`.
    #[must_use]
    pub fn refill_concurrency(&self) -> usize {
        usize::try_from(self.refill_concurrency).unwrap_or(usize::MAX)
    }

    /// The configured provision command.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when it is unset.
    pub fn provision_command(&self) -> Result<&str, ConfigError> {
        Self::require_field(self.provision_command.as_deref(), &PROVISION_COMMAND)?;
        Ok(self.provision_command.as_deref().unwrap_or_default())
    }

    /// The configured activate command.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when it is unset.
    pub fn activate_command(&self) -> Result<&str, ConfigError> {
        Self::require_field(self.activate_command.as_deref(), &ACTIVATE_COMMAND)?;
        Ok(self.activate_command.as_deref().unwrap_or_default())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> PoolConfig {
        PoolConfig {
            project_name: String::from("demo"),
            max_pool_size: 4,
            backend: String::from("local"),
            backend_url: None,
            backend_token: None,
            backend_username: None,
            backend_password: None,
            backend_namespace: None,
            backend_dir: None,
            backend_timeout_secs: None,
            retry_attempts: 5,
            retry_deadline_secs: 60,
            refill_concurrency: 3,
            provision_command: None,
            activate_command: None,
        }
    }

    #[rstest]
    fn valid_local_config_passes(config: PoolConfig) {
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    fn missing_project_name_names_its_sources(mut config: PoolConfig) {
        config.project_name = String::from("  ");
        let Err(ConfigError::MissingField(message)) = config.validate() else {
            panic!("expected missing field");
        };
        assert!(message.contains("HANGAR_PROJECT_NAME"), "{message}");
        assert!(message.contains("project_name"), "{message}");
    }

    #[rstest]
    fn punctuation_only_project_name_is_invalid(mut config: PoolConfig) {
        config.project_name = String::from("!!!");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    #[case("http")]
    #[case("redis")]
    fn remote_backends_need_url(mut config: PoolConfig, #[case] backend: &str) {
        config.backend = backend.to_owned();
        let Err(ConfigError::MissingField(message)) = config.validate() else {
            panic!("expected missing url");
        };
        assert!(message.contains("HANGAR_BACKEND_URL"), "{message}");
    }

    #[rstest]
    fn unknown_backend_is_invalid(mut config: PoolConfig) {
        config.backend = String::from("s3");
        let Err(ConfigError::Invalid(message)) = config.validate() else {
            panic!("expected invalid backend");
        };
        assert!(message.contains("HANGAR_BACKEND"), "{message}");
    }

    #[rstest]
    fn zero_retry_attempts_is_invalid(mut config: PoolConfig) {
        config.retry_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    fn backend_parameters_map_set_fields(mut config: PoolConfig) {
        config.backend_url = Some(String::from("https://kv.example.com"));
        config.backend_token = Some(String::from("t0k"));
        config.backend_timeout_secs = Some(9);
        let params = config.backend_parameters();
        assert_eq!(params.get("url"), Some("https://kv.example.com"));
        assert_eq!(params.get("token"), Some("t0k"));
        assert_eq!(params.get("timeout_secs"), Some("9"));
        assert_eq!(params.get("username"), None);
    }

    #[rstest]
    fn retry_policy_honours_zero_deadline(mut config: PoolConfig) {
        config.retry_attempts = 7;
        config.retry_deadline_secs = 0;
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.deadline, None);
    }

    #[rstest]
    fn commands_are_required_when_used(config: PoolConfig) {
        let Err(ConfigError::MissingField(message)) = config.provision_command() else {
            panic!("expected missing provision command");
        };
        assert!(message.contains("HANGAR_PROVISION_COMMAND"), "{message}");
    }
}
