//! Decides whether a backend can be used without asking a human.

use std::env;

use tracing::debug;

use crate::backend::{Backend, BackendError, BackendKind};

/// Whether a human is available to answer prompts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    /// Interactive session.
    Attended,
    /// CI or another non-interactive runner.
    Unattended,
}

impl RunMode {
    /// Reads the `CI` environment variable.
    #[must_use]
    pub fn detect() -> Self {
        Self::from_ci_value(env::var("CI").ok().as_deref())
    }

    fn from_ci_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("" | "0") => Self::Attended,
            Some(raw) if raw.eq_ignore_ascii_case("false") => Self::Attended,
            Some(_) => Self::Unattended,
        }
    }
}

/// Result of [`CredentialGate::ensure_ready`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The backend initialised and can be used.
    Ready,
    /// The backend needs connection details or credentials first.
    NeedsInteractiveSetup {
        /// Backend needing setup.
        kind: BackendKind,
        /// What is missing or invalid.
        reason: String,
    },
}

/// Checks a backend before any pool operation.
///
/// The gate never prompts; callers decide whether to run the backend's
/// interactive setup.
#[derive(Debug)]
pub struct CredentialGate<'a, B> {
    backend: &'a B,
}

impl<'a, B: Backend> CredentialGate<'a, B> {
    /// Wraps `backend`.
    #[must_use]
    pub const fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Validates parameters and initialises the backend.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] for failures other than configuration, such
    /// as the store being unreachable.
    pub async fn ensure_ready(&self) -> Result<Readiness, BackendError> {
        let kind = self.backend.kind();
        if self.backend.requires_interactive_setup() {
            return Ok(Readiness::NeedsInteractiveSetup {
                kind,
                reason: String::from("required connection parameters are missing or invalid"),
            });
        }
        match self.backend.initialize().await {
            Ok(()) => {
                debug!(%kind, "backend ready");
                Ok(Readiness::Ready)
            }
            Err(BackendError::Configuration { kind, message }) => {
                Ok(Readiness::NeedsInteractiveSetup {
                    kind,
                    reason: message,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`CredentialGate::ensure_ready`], but an unattended run cannot
    /// wait for setup and fails instead.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when setup is needed in
    /// [`RunMode::Unattended`], and other errors from
    /// [`CredentialGate::ensure_ready`].
    pub async fn ensure_ready_for(&self, mode: RunMode) -> Result<Readiness, BackendError> {
        match (self.ensure_ready().await?, mode) {
            (Readiness::NeedsInteractiveSetup { kind, reason }, RunMode::Unattended) => {
                Err(BackendError::configuration(
                    kind,
                    format!("{reason} (interactive setup is unavailable in CI)"),
                ))
            }
            (readiness, _) => Ok(readiness),
        }
    }
}
