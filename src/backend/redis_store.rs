//! Redis backend with native optimistic locking.
//!
//! Each blob lives at `<namespace><key>` with a companion counter at
//! `<namespace><key>:version`. Plain writes bump the counter in the same
//! `MULTI` block; conditional writes compare the counter inside a Lua script
//! so the check and the write are one atomic server-side step. A write that
//! expects the blob to be absent only checks the data key, so a counter left
//! behind by `DEL` or eviction never blocks re-creating the pool.
//!
//! Connecting and every command are bounded by `timeout_secs`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{ErrorKind, IntoConnectionInfo, RedisError, Script};
use tokio::sync::OnceCell;

use super::{
    Backend, BackendError, BackendFuture, BackendKind, BackendParameters, BlobVersion, SetOutcome,
    SetupField, StoredBlob,
};

const URL_PARAM: &str = "url";
const PASSWORD_PARAM: &str = "password";
const NAMESPACE_PARAM: &str = "namespace";
const TIMEOUT_PARAM: &str = "timeout_secs";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const COMPARE_AND_SET: &str = r"
local present = redis.call('EXISTS', KEYS[1]) == 1
if ARGV[3] == '1' then
  if present then return 0 end
else
  if not present then return 0 end
  local current = redis.call('GET', KEYS[2])
  if current == false then current = '' end
  if current ~= ARGV[2] then return 0 end
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('INCR', KEYS[2])
return 1
";

/// Backend storing the pool in Redis.
#[derive(Clone)]
pub struct RedisBackend {
    parameters: BackendParameters,
    connection: Arc<OnceCell<ConnectionManager>>,
    compare_and_set: Script,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RedisBackend")
            .field("namespace", &self.namespace())
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Creates a backend; the connection is opened on first use.
    #[must_use]
    pub fn new(parameters: BackendParameters) -> Self {
        Self {
            parameters,
            connection: Arc::new(OnceCell::new()),
            compare_and_set: Script::new(COMPARE_AND_SET),
        }
    }

    fn namespace(&self) -> &str {
        self.parameters.get(NAMESPACE_PARAM).unwrap_or_default()
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace())
    }

    fn version_key(&self, key: &str) -> String {
        format!("{}{key}:version", self.namespace())
    }

    fn timeout(&self) -> Result<Duration, BackendError> {
        self.parameters.get(TIMEOUT_PARAM).map_or(
            Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            |raw| {
                raw.parse::<u64>().map(Duration::from_secs).map_err(|err| {
                    BackendError::configuration(
                        BackendKind::Redis,
                        format!("invalid `{TIMEOUT_PARAM}`: {err}"),
                    )
                })
            },
        )
    }

    /// Runs one server round trip, failing transiently once `timeout_secs`
    /// passes.
    async fn bounded<T>(
        &self,
        what: &str,
        request: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, BackendError> {
        let limit = self.timeout()?;
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result.map_err(redis_error),
            Err(_) => Err(BackendError::unavailable(format!(
                "redis: {what} timed out after {limit:?}"
            ))),
        }
    }

    fn client(&self) -> Result<redis::Client, BackendError> {
        let kind = BackendKind::Redis;
        let url = self.parameters.require(kind, URL_PARAM)?;
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(BackendError::configuration(
                kind,
                "url must start with redis:// or rediss://",
            ));
        }
        let mut info = url
            .into_connection_info()
            .map_err(|err| BackendError::configuration(kind, format!("invalid url: {err}")))?;
        if let Some(password) = self.parameters.get(PASSWORD_PARAM) {
            info.redis.password = Some(password.to_owned());
        }
        redis::Client::open(info)
            .map_err(|err| BackendError::configuration(kind, format!("invalid url: {err}")))
    }

    async fn connection(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let client = self.client()?;
                self.bounded("connect", ConnectionManager::new(client)).await
            })
            .await?;
        Ok(manager.clone())
    }
}

fn redis_error(err: RedisError) -> BackendError {
    match err.kind() {
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig => {
            BackendError::configuration(BackendKind::Redis, err.to_string())
        }
        _ => BackendError::unavailable(format!("redis: {err}")),
    }
}

impl Backend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn parameters(&self) -> &BackendParameters {
        &self.parameters
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        Box::pin(async move { self.connection().await.map(|_| ()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let mut command = redis::cmd("MGET");
            command.arg(self.data_key(key)).arg(self.version_key(key));
            let (bytes, version): (Option<Vec<u8>>, Option<String>) =
                self.bounded("MGET", command.query_async(&mut conn)).await?;
            Ok(bytes.map(|value| StoredBlob {
                bytes: value,
                version: Some(BlobVersion::new(version.unwrap_or_default())),
            }))
        })
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let mut pipeline = redis::pipe();
            pipeline
                .atomic()
                .cmd("SET")
                .arg(self.data_key(key))
                .arg(bytes)
                .ignore()
                .cmd("INCR")
                .arg(self.version_key(key))
                .ignore();
            self.bounded("SET", pipeline.query_async::<_, ()>(&mut conn))
                .await
        })
    }

    fn supports_conditional_set(&self) -> bool {
        true
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let mut invocation = self.compare_and_set.prepare_invoke();
            invocation
                .key(self.data_key(key))
                .key(self.version_key(key))
                .arg(bytes)
                .arg(expected.map_or("", BlobVersion::as_str))
                .arg(if expected.is_none() { "1" } else { "0" });
            let written: i64 = self
                .bounded("compare-and-set", invocation.invoke_async(&mut conn))
                .await?;
            Ok(if written == 1 {
                SetOutcome::Written
            } else {
                SetOutcome::VersionConflict
            })
        })
    }

    fn requires_interactive_setup(&self) -> bool {
        self.client().is_err() || self.timeout().is_err()
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        vec![
            SetupField::new(URL_PARAM, "Redis URL (redis:// or rediss://)", false, true),
            SetupField::new(PASSWORD_PARAM, "Redis password", true, false),
            SetupField::new(NAMESPACE_PARAM, "Key prefix shared by this pool", false, false),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(pairs: &[(&str, &str)]) -> RedisBackend {
        RedisBackend::new(pairs.iter().copied().collect())
    }

    #[test]
    fn keys_are_namespaced() {
        let store = backend(&[("url", "redis://localhost"), ("namespace", "ci:")]);
        assert_eq!(store.data_key("pool_demo"), "ci:pool_demo");
        assert_eq!(store.version_key("pool_demo"), "ci:pool_demo:version");
    }

    #[test]
    fn missing_url_requires_setup() {
        assert!(backend(&[]).requires_interactive_setup());
    }

    #[test]
    fn non_redis_scheme_is_rejected() {
        let err = backend(&[("url", "http://localhost")])
            .client()
            .expect_err("scheme should be rejected");
        assert!(matches!(err, BackendError::Configuration { .. }), "{err}");
    }

    #[test]
    fn password_parameter_overrides_url_credential() {
        let store = backend(&[("url", "redis://:old@localhost:6379"), ("password", "new")]);
        let client = store.client().expect("client");
        assert_eq!(
            client.get_connection_info().redis.password.as_deref(),
            Some("new")
        );
    }

    #[test]
    fn timeout_defaults_and_parses() {
        let store = backend(&[("url", "redis://localhost")]);
        assert_eq!(
            store.timeout().expect("default"),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
        let tuned = backend(&[("url", "redis://localhost"), ("timeout_secs", "2")]);
        assert_eq!(tuned.timeout().expect("tuned"), Duration::from_secs(2));
        let broken = backend(&[("url", "redis://localhost"), ("timeout_secs", "later")]);
        assert!(broken.requires_interactive_setup());
    }

    #[test]
    fn absent_blob_writes_ignore_the_version_counter() {
        let (absent, versioned) = COMPARE_AND_SET
            .split_once("else")
            .expect("script has an absent-key branch");
        assert!(absent.contains("ARGV[3] == '1'"));
        assert!(!absent.contains("KEYS[2]"), "absent branch must not read the counter");
        assert!(versioned.contains("ARGV[2]"));
    }

    #[tokio::test]
    async fn silent_server_times_out_as_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let address = listener.local_addr().expect("address");
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let store = backend(&[
            ("url", &format!("redis://{address}")),
            ("timeout_secs", "1"),
        ]);

        let err = tokio::time::timeout(Duration::from_secs(5), store.get("pool_demo"))
            .await
            .expect("bounded by timeout_secs")
            .expect_err("silent server");
        assert!(err.is_transient(), "{err}");
        holder.abort();
    }

    #[tokio::test]
    async fn initialize_reports_configuration_error_without_network() {
        let err = backend(&[]).initialize().await.expect_err("missing url");
        assert!(matches!(err, BackendError::Configuration { .. }), "{err}");
    }
}
