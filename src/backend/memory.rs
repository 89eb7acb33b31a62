//! In-process backend shared by cloning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    Backend, BackendError, BackendFuture, BackendKind, BackendParameters, BlobVersion, SetOutcome,
    SetupField, StoredBlob,
};

const CONDITIONAL_PARAM: &str = "conditional_writes";

#[derive(Debug, Default)]
struct Entry {
    bytes: Vec<u8>,
    version: u64,
}

/// Map-backed store with an optional conditional write.
///
/// Clones share the same map, so several pool stores in one test can race
/// each other against a single key.
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    parameters: BackendParameters,
    conditional: bool,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty store with conditional writes enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parameters: BackendParameters::new(),
            conditional: true,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates an empty store that only offers plain `set`.
    #[must_use]
    pub fn without_conditional_set() -> Self {
        Self {
            conditional: false,
            ..Self::new()
        }
    }

    /// Creates a store from configuration. `conditional_writes = false`
    /// disables the conditional primitive.
    #[must_use]
    pub fn with_parameters(parameters: BackendParameters) -> Self {
        let conditional = !matches!(parameters.get(CONDITIONAL_PARAM), Some("false" | "0"));
        Self {
            parameters,
            conditional,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the raw bytes stored under `key`, for assertions.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .ok()
            .and_then(|entries| entries.get(key).map(|entry| entry.bytes.clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, BackendError> {
        self.entries
            .lock()
            .map_err(|err| BackendError::unavailable(format!("memory backend poisoned: {err}")))
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn parameters(&self) -> &BackendParameters {
        &self.parameters
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        Box::pin(async move {
            let entries = self.lock()?;
            Ok(entries.get(key).map(|entry| StoredBlob {
                bytes: entry.bytes.clone(),
                version: Some(BlobVersion::new(entry.version.to_string())),
            }))
        })
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let mut entries = self.lock()?;
            let entry = entries.entry(key.to_owned()).or_default();
            entry.bytes = bytes.to_vec();
            entry.version = entry.version.saturating_add(1);
            Ok(())
        })
    }

    fn supports_conditional_set(&self) -> bool {
        self.conditional
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        Box::pin(async move {
            if !self.conditional {
                return Err(BackendError::Unsupported {
                    kind: BackendKind::Memory,
                    operation: "set_if_version",
                });
            }
            let mut entries = self.lock()?;
            let current = entries
                .get(key)
                .map(|entry| BlobVersion::new(entry.version.to_string()));
            if current.as_ref() != expected {
                return Ok(SetOutcome::VersionConflict);
            }
            let entry = entries.entry(key.to_owned()).or_default();
            entry.bytes = bytes.to_vec();
            entry.version = entry.version.saturating_add(1);
            Ok(SetOutcome::Written)
        })
    }

    fn requires_interactive_setup(&self) -> bool {
        false
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        Vec::new()
    }
}
