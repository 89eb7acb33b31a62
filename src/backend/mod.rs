//! Storage abstraction for pool state.
//!
//! A backend stores one opaque blob per key and offers whole-value get and
//! set. Some stores can also write conditionally on the version they last
//! returned; callers must work whether or not that primitive exists.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use thiserror::Error;

mod http_store;
mod local_file;
mod memory;
mod redis_store;
mod setup;

pub use http_store::HttpBackend;
pub use local_file::LocalFileBackend;
pub use memory::MemoryBackend;
pub use redis_store::RedisBackend;
pub use setup::{SetupField, SetupPrompter};

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Closed set of supported storage providers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Authenticated HTTP blob store.
    Http,
    /// Redis key-value store.
    Redis,
    /// JSON file on the local filesystem.
    LocalFile,
    /// In-process map, for tests and dry runs.
    Memory,
}

impl BackendKind {
    /// Configuration spelling of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Redis => "redis",
            Self::LocalFile => "local",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "redis" => Ok(Self::Redis),
            "local" | "file" => Ok(Self::LocalFile),
            "memory" => Ok(Self::Memory),
            other => Err(BackendError::UnknownKind(other.to_owned())),
        }
    }
}

/// Backend-specific settings such as endpoint, credentials, or namespace.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BackendParameters(BTreeMap<String, String>);

impl BackendParameters {
    /// Creates an empty parameter set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a parameter, returning the updated set.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns a trimmed, non-empty parameter value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Returns a parameter or a configuration error naming it.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when the parameter is absent.
    pub fn require(&self, kind: BackendKind, name: &str) -> Result<&str, BackendError> {
        self.get(name)
            .ok_or_else(|| BackendError::configuration(kind, format!("missing parameter `{name}`")))
    }

    /// Parses a boolean flag, falling back to `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] for values other than
    /// `true`/`false`/`1`/`0`.
    pub fn flag(&self, kind: BackendKind, name: &str, default: bool) -> Result<bool, BackendError> {
        match self.get(name) {
            None => Ok(default),
            Some("true" | "1") => Ok(true),
            Some("false" | "0") => Ok(false),
            Some(other) => Err(BackendError::configuration(
                kind,
                format!("parameter `{name}` must be true or false, got `{other}`"),
            )),
        }
    }

    /// Iterates set parameters in name order, trimmed as by [`Self::get`].
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|(name, value)| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then_some((name.as_str(), trimmed))
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BackendParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

/// Concurrency token attached to a stored blob.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BlobVersion(String);

impl BlobVersion {
    /// Wraps a backend-provided token.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A blob as last written, with its version when the backend reports one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredBlob {
    /// Stored bytes.
    pub bytes: Vec<u8>,
    /// Version token usable with [`Backend::set_if_version`].
    pub version: Option<BlobVersion>,
}

/// Result of a conditional write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOutcome {
    /// The blob was replaced.
    Written,
    /// The stored version no longer matched; nothing was written.
    VersionConflict,
}

/// Errors raised by backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Missing or invalid connection details or credentials.
    #[error("{kind} backend is not configured: {message}")]
    Configuration {
        /// Backend that rejected its parameters.
        kind: BackendKind,
        /// Human-readable description.
        message: String,
    },
    /// Network, storage, or authentication failure while talking to the store.
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
    },
    /// The backend does not implement an optional operation.
    #[error("{kind} backend does not support {operation}")]
    Unsupported {
        /// Backend asked to perform the operation.
        kind: BackendKind,
        /// Operation name.
        operation: &'static str,
    },
    /// Raised when configuration names a backend that does not exist.
    #[error("unknown backend kind `{0}` (expected http, redis, local, or memory)")]
    UnknownKind(String),
}

impl BackendError {
    /// Builds a [`BackendError::Configuration`].
    #[must_use]
    pub fn configuration(kind: BackendKind, message: impl Into<String>) -> Self {
        Self::Configuration {
            kind,
            message: message.into(),
        }
    }

    /// Builds a [`BackendError::Unavailable`].
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns `true` for failures that a retry might fix.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Interface implemented by every storage provider.
pub trait Backend: Send + Sync {
    /// Kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Parameters supplied at construction.
    fn parameters(&self) -> &BackendParameters;

    /// Validates parameters and prepares connection state.
    ///
    /// Idempotent; the prepared state is cached after the first success.
    fn initialize(&self) -> BackendFuture<'_, (), BackendError>;

    /// Fetches the blob stored under `key`, or `None` if never written.
    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError>;

    /// Overwrites the blob stored under `key`.
    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError>;

    /// Whether [`Backend::set_if_version`] is available.
    fn supports_conditional_set(&self) -> bool {
        false
    }

    /// Writes only if the stored version still equals `expected`.
    ///
    /// `expected = None` writes only if the key is still absent.
    fn set_if_version<'a>(
        &'a self,
        _key: &'a str,
        _bytes: &'a [u8],
        _expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        let kind = self.kind();
        Box::pin(async move {
            Err(BackendError::Unsupported {
                kind,
                operation: "set_if_version",
            })
        })
    }

    /// Whether required parameters are missing or invalid.
    fn requires_interactive_setup(&self) -> bool;

    /// Parameters an interactive setup flow should collect.
    fn setup_fields(&self) -> Vec<SetupField>;

    /// Collects every setup field through `prompter`.
    fn run_interactive_setup<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        Box::pin(async move {
            setup::collect(self.parameters(), &self.setup_fields(), prompter, |_| true)
        })
    }

    /// Collects only the secret setup fields through `prompter`.
    fn run_interactive_authenticate<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        Box::pin(async move {
            setup::collect(self.parameters(), &self.setup_fields(), prompter, |field| {
                field.secret
            })
        })
    }
}

/// One concrete backend chosen from configuration.
#[derive(Clone, Debug)]
pub enum AnyBackend {
    /// See [`HttpBackend`].
    Http(HttpBackend),
    /// See [`RedisBackend`].
    Redis(RedisBackend),
    /// See [`LocalFileBackend`].
    LocalFile(LocalFileBackend),
    /// See [`MemoryBackend`].
    Memory(MemoryBackend),
}

impl AnyBackend {
    /// Builds the backend for `kind`. No I/O happens until
    /// [`Backend::initialize`] or the first operation.
    #[must_use]
    pub fn new(kind: BackendKind, parameters: BackendParameters) -> Self {
        match kind {
            BackendKind::Http => Self::Http(HttpBackend::new(parameters)),
            BackendKind::Redis => Self::Redis(RedisBackend::new(parameters)),
            BackendKind::LocalFile => Self::LocalFile(LocalFileBackend::new(parameters)),
            BackendKind::Memory => Self::Memory(MemoryBackend::with_parameters(parameters)),
        }
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            Self::Http(backend) => backend,
            Self::Redis(backend) => backend,
            Self::LocalFile(backend) => backend,
            Self::Memory(backend) => backend,
        }
    }
}

impl Backend for AnyBackend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn parameters(&self) -> &BackendParameters {
        self.inner().parameters()
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        self.inner().initialize()
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        self.inner().get(key)
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        self.inner().set(key, bytes)
    }

    fn supports_conditional_set(&self) -> bool {
        self.inner().supports_conditional_set()
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        self.inner().set_if_version(key, bytes, expected)
    }

    fn requires_interactive_setup(&self) -> bool {
        self.inner().requires_interactive_setup()
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        self.inner().setup_fields()
    }

    fn run_interactive_setup<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        self.inner().run_interactive_setup(prompter)
    }

    fn run_interactive_authenticate<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        self.inner().run_interactive_authenticate(prompter)
    }
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn parameters(&self) -> &BackendParameters {
        (**self).parameters()
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        (**self).initialize()
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        (**self).get(key)
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        (**self).set(key, bytes)
    }

    fn supports_conditional_set(&self) -> bool {
        (**self).supports_conditional_set()
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        (**self).set_if_version(key, bytes, expected)
    }

    fn requires_interactive_setup(&self) -> bool {
        (**self).requires_interactive_setup()
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        (**self).setup_fields()
    }

    fn run_interactive_setup<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        (**self).run_interactive_setup(prompter)
    }

    fn run_interactive_authenticate<'a>(
        &'a self,
        prompter: &'a dyn SetupPrompter,
    ) -> BackendFuture<'a, BackendParameters, BackendError> {
        (**self).run_interactive_authenticate(prompter)
    }
}
