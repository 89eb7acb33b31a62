//! Tests for layered configuration loading and validation.

use std::time::Duration;

use hangar::test_support::EnvGuard;
use hangar::{BackendKind, ConfigError, PoolConfig};
use tempfile::TempDir;

const CONFIG_VARS: [&str; 6] = [
    "HANGAR_PROJECT_NAME",
    "HANGAR_BACKEND",
    "HANGAR_BACKEND_URL",
    "HANGAR_MAX_POOL_SIZE",
    "HANGAR_RETRY_ATTEMPTS",
    "HANGAR_RETRY_DEADLINE_SECS",
];

fn write_config(tmp: &TempDir, contents: &str) -> String {
    let path = tmp.path().join("hangar.toml");
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write config: {err}"));
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn file_values_load_and_env_overrides_them() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(
        &tmp,
        r#"
project_name = "web tests"
max_pool_size = 4
backend = "redis"
backend_url = "redis://cache.internal:6379"
backend_namespace = "ci"
"#,
    );
    let _guard = EnvGuard::set_and_remove(
        &[
            ("HANGAR_CONFIG_PATH", path.as_str()),
            ("HANGAR_MAX_POOL_SIZE", "6"),
        ],
        &[
            "HANGAR_PROJECT_NAME",
            "HANGAR_BACKEND",
            "HANGAR_BACKEND_URL",
            "HANGAR_RETRY_ATTEMPTS",
            "HANGAR_RETRY_DEADLINE_SECS",
        ],
    )
    .await;

    let config = PoolConfig::load_without_cli_args().expect("load");

    assert_eq!(config.project_name, "web tests");
    assert_eq!(config.max_pool_size, 6);
    assert_eq!(config.backend_kind(), Ok(BackendKind::Redis));
    assert!(config.validate().is_ok());
    let parameters = config.backend_parameters();
    assert_eq!(parameters.get("url"), Some("redis://cache.internal:6379"));
    assert_eq!(parameters.get("namespace"), Some("ci"));
    assert_eq!(config.default_refill_target(), 6);
}

#[tokio::test]
async fn defaults_apply_when_only_the_project_is_set() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(&tmp, "");
    let removed: Vec<&str> = CONFIG_VARS
        .iter()
        .copied()
        .filter(|name| *name != "HANGAR_PROJECT_NAME")
        .collect();
    let _guard = EnvGuard::set_and_remove(
        &[
            ("HANGAR_CONFIG_PATH", path.as_str()),
            ("HANGAR_PROJECT_NAME", "api"),
        ],
        &removed,
    )
    .await;

    let config = PoolConfig::load_without_cli_args().expect("load");

    assert_eq!(config.backend_kind(), Ok(BackendKind::LocalFile));
    assert_eq!(config.retry_attempts, 5);
    assert_eq!(config.refill_concurrency(), 3);
    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.deadline, Some(Duration::from_secs(60)));
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn missing_project_name_names_its_sources() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(&tmp, "backend = \"memory\"\n");
    let _guard =
        EnvGuard::set_and_remove(&[("HANGAR_CONFIG_PATH", path.as_str())], &CONFIG_VARS).await;

    let config = PoolConfig::load_without_cli_args().expect("load");
    let err = config.validate().expect_err("project name is required");

    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains("HANGAR_PROJECT_NAME"), "message: {message}");
    assert!(message.contains("hangar.toml"), "message: {message}");
}

#[tokio::test]
async fn remote_backends_need_a_url() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(&tmp, "project_name = \"api\"\nbackend = \"http\"\n");
    let _guard =
        EnvGuard::set_and_remove(&[("HANGAR_CONFIG_PATH", path.as_str())], &CONFIG_VARS).await;

    let config = PoolConfig::load_without_cli_args().expect("load");
    let err = config.validate().expect_err("url is required");

    let ConfigError::MissingField(message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains("HANGAR_BACKEND_URL"), "message: {message}");
}

#[tokio::test]
async fn unknown_backend_kind_is_invalid() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(&tmp, "project_name = \"api\"\nbackend = \"s3\"\n");
    let _guard =
        EnvGuard::set_and_remove(&[("HANGAR_CONFIG_PATH", path.as_str())], &CONFIG_VARS).await;

    let config = PoolConfig::load_without_cli_args().expect("load");

    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}
