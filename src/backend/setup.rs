//! Bootstrap helpers used outside the checkout and checkin hot path.

use super::{BackendError, BackendParameters};

/// A parameter an interactive setup flow should ask for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetupField {
    /// Parameter name in [`BackendParameters`].
    pub name: &'static str,
    /// Question shown to the operator.
    pub prompt: &'static str,
    /// Whether the value is a credential that must not be echoed.
    pub secret: bool,
    /// Whether the backend cannot work without it.
    pub required: bool,
}

impl SetupField {
    pub(super) const fn new(
        name: &'static str,
        prompt: &'static str,
        secret: bool,
        required: bool,
    ) -> Self {
        Self {
            name,
            prompt,
            secret,
            required,
        }
    }
}

/// Source of answers for interactive setup, supplied by the calling layer.
pub trait SetupPrompter: Sync {
    /// Asks for `field`. `Ok(None)` keeps the current value.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when the operator cannot be reached.
    fn prompt(&self, field: &SetupField, current: Option<&str>)
    -> Result<Option<String>, BackendError>;
}

pub(super) fn collect(
    current: &BackendParameters,
    fields: &[SetupField],
    prompter: &dyn SetupPrompter,
    wanted: impl Fn(&SetupField) -> bool,
) -> Result<BackendParameters, BackendError> {
    let mut updated = current.clone();
    for field in fields.iter().filter(|field| wanted(field)) {
        let existing = current.get(field.name);
        let shown = if field.secret { None } else { existing };
        match prompter.prompt(field, shown)? {
            Some(answer) if !answer.trim().is_empty() => {
                updated.insert(field.name, answer.trim());
            }
            _ => {}
        }
    }
    Ok(updated)
}
