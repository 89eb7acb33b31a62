//! Persists interactive backend setup into `hangar.toml`.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use ortho_config::toml;
use thiserror::Error;

use crate::backend::{BackendKind, BackendParameters};

const APP_NAME: &str = "hangar";
const CONFIG_ENV_VAR: &str = "HANGAR_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "hangar.toml";
const DOTFILE_NAME: &str = ".hangar.toml";
const PROJECT_FILE_NAME: &str = "hangar.toml";
const BACKEND_KEY: &str = "backend";
/// Parameters that have a `backend_<name>` key in [`crate::PoolConfig`].
const PERSISTED_PARAMETERS: [&str; 6] = ["url", "token", "username", "password", "namespace", "dir"];

/// Errors raised while updating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// Raised when no configuration candidates are available.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Abstraction over configuration writers for dependency injection.
pub trait ConfigWriter {
    /// Returns the `backend` kind currently recorded, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the configuration file cannot be
    /// accessed or parsed.
    fn current_backend(&self) -> Result<Option<String>, ConfigStoreError>;

    /// Records `kind` and the persisted subset of `parameters`, keeping every
    /// unrelated key. Returns the file written.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when reading or updating configuration
    /// content fails.
    fn write_backend_setup(
        &self,
        kind: BackendKind,
        parameters: &BackendParameters,
    ) -> Result<Utf8PathBuf, ConfigStoreError>;
}

/// Updates `hangar.toml` using `OrthoConfig`'s discovery search order.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    discovery: ConfigDiscovery,
}

impl ConfigStore {
    /// Builds a config store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a config store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    /// Picks the first existing candidate, or the last one to create.
    fn resolve_target(&self) -> Result<ConfigTarget, ConfigStoreError> {
        let candidates = self.discovery.utf8_candidates();
        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(ConfigTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }
        candidates
            .last()
            .map(|path| ConfigTarget {
                path: path.clone(),
                exists: false,
            })
            .ok_or(ConfigStoreError::NoCandidates)
    }

    fn load_table(&self) -> Result<(ConfigTarget, toml::value::Table), ConfigStoreError> {
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_config(&target.path)?
        } else {
            String::new()
        };
        let table = parse_table(&target.path, &contents)?;
        Ok((target, table))
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigWriter for ConfigStore {
    fn current_backend(&self) -> Result<Option<String>, ConfigStoreError> {
        let (target, table) = self.load_table()?;
        table.get(BACKEND_KEY).map_or(Ok(None), |raw| {
            raw.as_str()
                .map(|kind| Some(kind.trim().to_owned()))
                .ok_or_else(|| ConfigStoreError::InvalidStructure {
                    path: target.path.clone(),
                    message: format!("`{BACKEND_KEY}` must be a string"),
                })
        })
    }

    fn write_backend_setup(
        &self,
        kind: BackendKind,
        parameters: &BackendParameters,
    ) -> Result<Utf8PathBuf, ConfigStoreError> {
        let (target, mut table) = self.load_table()?;
        table.insert(
            String::from(BACKEND_KEY),
            toml::Value::String(kind.as_str().to_owned()),
        );
        for (name, value) in parameters
            .iter()
            .filter(|(name, _)| PERSISTED_PARAMETERS.contains(name))
        {
            table.insert(
                format!("{BACKEND_KEY}_{name}"),
                toml::Value::String(value.to_owned()),
            );
        }
        write_config(&target.path, &toml::Value::Table(table))?;
        Ok(target.path)
    }
}

#[derive(Clone, Debug)]
struct ConfigTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), ConfigStoreError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| ConfigStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> ConfigStoreError {
    ConfigStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn path_exists(path: &Utf8Path) -> Result<bool, ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(file_name).map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

fn read_config(path: &Utf8Path) -> Result<String, ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

fn parse_table(path: &Utf8Path, contents: &str) -> Result<toml::value::Table, ConfigStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::value::Table::new());
    }
    let value: toml::Value = toml::from_str(contents).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    match value {
        toml::Value::Table(table) => Ok(table),
        _ => Err(ConfigStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        }),
    }
}

fn write_config(path: &Utf8Path, value: &toml::Value) -> Result<(), ConfigStoreError> {
    let (parent, file_name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let rendered = toml::to_string_pretty(value).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    dir.write(file_name, rendered)
        .map_err(|err| io_error(path, &err))
}
