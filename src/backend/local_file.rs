//! Single-process backend persisting each key to a JSON file.
//!
//! Conditional writes are honoured only between callers sharing one
//! [`LocalFileBackend`] value (or its clones). Separate processes pointing
//! at the same directory get last-write-wins semantics.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use super::{
    Backend, BackendError, BackendFuture, BackendKind, BackendParameters, BlobVersion, SetOutcome,
    SetupField, StoredBlob,
};

const DIR_PARAM: &str = "dir";
const DEFAULT_DIR: &str = ".hangar";

/// Stores blobs as `<dir>/<key>.json`.
#[derive(Clone, Debug)]
pub struct LocalFileBackend {
    parameters: BackendParameters,
    dir: Arc<OnceCell<Dir>>,
    write_lock: Arc<Mutex<()>>,
}

impl LocalFileBackend {
    /// Creates a backend; the directory is opened lazily.
    #[must_use]
    pub fn new(parameters: BackendParameters) -> Self {
        Self {
            parameters,
            dir: Arc::new(OnceCell::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a backend rooted at `dir`.
    #[must_use]
    pub fn in_dir(dir: impl Into<String>) -> Self {
        Self::new(BackendParameters::new().with(DIR_PARAM, dir))
    }

    fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.parameters.get(DIR_PARAM).unwrap_or(DEFAULT_DIR))
    }

    async fn dir(&self) -> Result<&Dir, BackendError> {
        self.dir
            .get_or_try_init(|| async {
                let root = self.root();
                Dir::create_ambient_dir_all(&root, ambient_authority()).map_err(|err| {
                    BackendError::configuration(
                        BackendKind::LocalFile,
                        format!("cannot create {root}: {err}"),
                    )
                })?;
                Dir::open_ambient_dir(&root, ambient_authority()).map_err(|err| {
                    BackendError::configuration(
                        BackendKind::LocalFile,
                        format!("cannot open {root}: {err}"),
                    )
                })
            })
            .await
    }

    fn read_entry(&self, dir: &Dir, key: &str) -> Result<Option<StoredBlob>, BackendError> {
        let file_name = file_name_for(key)?;
        match dir.read(&file_name) {
            Ok(bytes) => {
                let version = Some(content_version(&bytes));
                Ok(Some(StoredBlob { bytes, version }))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(&file_name, &err)),
        }
    }

    fn write_entry(&self, dir: &Dir, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let file_name = file_name_for(key)?;
        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
        dir.write(&temp_name, bytes)
            .map_err(|err| self.io_error(&temp_name, &err))?;
        dir.rename(&temp_name, dir, &file_name)
            .map_err(|err| self.io_error(&file_name, &err))
    }

    fn io_error(&self, file_name: &str, err: &io::Error) -> BackendError {
        BackendError::unavailable(format!("{}/{file_name}: {err}", self.root()))
    }
}

fn file_name_for(key: &str) -> Result<String, BackendError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(format!("{key}.json"))
    } else {
        Err(BackendError::configuration(
            BackendKind::LocalFile,
            format!("key `{key}` is not a safe file name"),
        ))
    }
}

fn content_version(bytes: &[u8]) -> BlobVersion {
    let digest = Sha256::digest(bytes);
    let hex = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    BlobVersion::new(hex)
}

impl Backend for LocalFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFile
    }

    fn parameters(&self) -> &BackendParameters {
        &self.parameters
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        Box::pin(async move { self.dir().await.map(|_| ()) })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        Box::pin(async move {
            let dir = self.dir().await?;
            self.read_entry(dir, key)
        })
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let dir = self.dir().await?;
            let _guard = self.write_lock.lock().await;
            self.write_entry(dir, key, bytes)
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
            let dir = self.dir().await?;
            let _guard = self.write_lock.lock().await;
            let current = self.read_entry(dir, key)?.and_then(|blob| blob.version);
            if current.as_ref() != expected {
                return Ok(SetOutcome::VersionConflict);
            }
            self.write_entry(dir, key, bytes)?;
            Ok(SetOutcome::Written)
        })
    }

    fn requires_interactive_setup(&self) -> bool {
        false
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        vec![SetupField::new(
            DIR_PARAM,
            "Directory for pool files",
            false,
            false,
        )]
    }
}
