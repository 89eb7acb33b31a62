//! Concurrency-safe checkout and checkin over a shared pool snapshot.
//!
//! Every mutation is read, compute, write. Backends with conditional writes
//! get a compare-and-set on the version they returned. Backends without one
//! fall back to a read-verify-write protocol that tags each write with a
//! fresh token and reads it back before claiming success.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, SetOutcome, StoredBlob};
use crate::snapshot::{InsertPosition, PoolSnapshot, ResourceHandle, SnapshotDecodeError};

mod key;
mod retry;

pub use retry::RetryPolicy;

const METADATA_ATTEMPTS: u32 = 2;

/// Errors surfaced by [`PoolStore`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend rejected its configuration or credentials.
    #[error(transparent)]
    Configuration(#[from] BackendError),
    /// Every attempt conflicted or failed transiently.
    #[error("pool unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last conflict or failure observed.
        reason: String,
    },
    /// The stored blob could not be decoded.
    #[error("stored pool snapshot is corrupt: {message}")]
    Corrupt {
        /// Decoder message.
        message: String,
    },
}

impl From<SnapshotDecodeError> for PoolError {
    fn from(err: SnapshotDecodeError) -> Self {
        Self::Corrupt {
            message: err.to_string(),
        }
    }
}

/// Result of [`PoolStore::checkout`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckoutOutcome {
    /// The front handle was removed and now belongs to the caller.
    Acquired(ResourceHandle),
    /// Nothing was pooled; nothing was written.
    Empty,
}

/// Result of [`PoolStore::checkin`] and [`PoolStore::checkin_within`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckinOutcome {
    /// The handle is now pooled.
    Inserted,
    /// A handle with the same id was already pooled; nothing was written.
    AlreadyPresent,
    /// The pool already held the requested capacity; nothing was written.
    PoolFull,
}

enum Plan<T> {
    Finish(T),
    Write {
        resources: Vec<ResourceHandle>,
        value: T,
    },
}

enum Attempt<T> {
    Finished(T),
    Conflict(&'static str),
}

enum Interrupted {
    Transient(String),
    Fatal(PoolError),
}

impl From<BackendError> for Interrupted {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(PoolError::Configuration(err))
        }
    }
}

impl From<SnapshotDecodeError> for Interrupted {
    fn from(err: SnapshotDecodeError) -> Self {
        Self::Fatal(err.into())
    }
}

/// Shared pool state behind a backend.
///
/// Cloned backends pointing at the same store may be wrapped in many
/// `PoolStore`s across tasks or processes; no handle is ever given to two
/// callers.
#[derive(Debug)]
pub struct PoolStore<B> {
    backend: B,
    key: String,
    retry: RetryPolicy,
    local: Mutex<()>,
    degraded_logged: AtomicBool,
}

impl<B: Backend> PoolStore<B> {
    /// Creates a store for `project_name` with the default retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Configuration`] when the project name has no
    /// ASCII letters or digits to build a key from.
    pub fn new(backend: B, project_name: &str) -> Result<Self, PoolError> {
        let Some(key) = key::pool_key(project_name) else {
            return Err(PoolError::Configuration(BackendError::configuration(
                backend.kind(),
                format!("project name `{project_name}` does not contain any letters or digits"),
            )));
        };
        Ok(Self {
            backend,
            key,
            retry: RetryPolicy::default(),
            local: Mutex::new(()),
            degraded_logged: AtomicBool::new(false),
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Storage key holding the snapshot.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Underlying backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Retry policy in effect.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Reads the current snapshot; an absent key is an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the backend stays unavailable, rejects its
    /// configuration, or holds a corrupt blob.
    pub async fn read(&self) -> Result<PoolSnapshot, PoolError> {
        let started = Instant::now();
        let attempts = self.retry.attempts();
        let mut reason = String::from("deadline passed before the first attempt");
        for attempt in 1..=attempts {
            if self.deadline_passed(started) {
                return Err(PoolError::Unavailable {
                    attempts: attempt - 1,
                    reason,
                });
            }
            match self.within_deadline(started, self.backend.get(&self.key)).await {
                Some(Ok(stored)) => return Ok(decode(stored.as_ref())?),
                Some(Err(err)) if err.is_transient() => {
                    debug!(key = %self.key, attempt, error = %err, "pool read failed");
                    reason = err.to_string();
                }
                Some(Err(err)) => return Err(PoolError::Configuration(err)),
                None => {
                    debug!(key = %self.key, attempt, "pool read outlived the deadline");
                    return Err(PoolError::Unavailable {
                        attempts: attempt,
                        reason: self.deadline_reason("read"),
                    });
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(PoolError::Unavailable { attempts, reason })
    }

    /// Removes the front handle and hands it to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Unavailable`] when every attempt conflicted or
    /// failed transiently, and other [`PoolError`] variants for
    /// configuration or corruption.
    pub async fn checkout(&self) -> Result<CheckoutOutcome, PoolError> {
        self.mutate("checkout", self.retry.attempts(), |snapshot| {
            match snapshot.split_front() {
                None => Plan::Finish(CheckoutOutcome::Empty),
                Some((handle, rest)) => Plan::Write {
                    resources: rest,
                    value: CheckoutOutcome::Acquired(handle),
                },
            }
        })
        .await
    }

    /// Returns `handle` to the pool at `position`.
    ///
    /// # Errors
    ///
    /// As for [`PoolStore::checkout`].
    pub async fn checkin(
        &self,
        handle: ResourceHandle,
        position: InsertPosition,
    ) -> Result<CheckinOutcome, PoolError> {
        self.checkin_bounded(handle, position, None).await
    }

    /// Like [`PoolStore::checkin`], but refuses to grow the pool past
    /// `capacity` handles.
    ///
    /// # Errors
    ///
    /// As for [`PoolStore::checkout`].
    pub async fn checkin_within(
        &self,
        handle: ResourceHandle,
        position: InsertPosition,
        capacity: usize,
    ) -> Result<CheckinOutcome, PoolError> {
        self.checkin_bounded(handle, position, Some(capacity)).await
    }

    async fn checkin_bounded(
        &self,
        handle: ResourceHandle,
        position: InsertPosition,
        capacity: Option<usize>,
    ) -> Result<CheckinOutcome, PoolError> {
        self.mutate("checkin", self.retry.attempts(), |snapshot| {
            if snapshot.contains(&handle.id) {
                return Plan::Finish(CheckinOutcome::AlreadyPresent);
            }
            if capacity.is_some_and(|limit| snapshot.len() >= limit) {
                return Plan::Finish(CheckinOutcome::PoolFull);
            }
            snapshot
                .with_inserted(handle.clone(), position)
                .map_or(Plan::Finish(CheckinOutcome::AlreadyPresent), |resources| {
                    Plan::Write {
                        resources,
                        value: CheckinOutcome::Inserted,
                    }
                })
        })
        .await
    }

    /// Merges `fields` into the metadata of the pooled handle `handle_id`.
    ///
    /// Best effort: failures are logged and reported as `false`.
    pub async fn update_metadata(&self, handle_id: &str, fields: BTreeMap<String, String>) -> bool {
        let outcome = self
            .mutate("update_metadata", METADATA_ATTEMPTS, |snapshot| {
                if !snapshot.contains(handle_id) {
                    return Plan::Finish(false);
                }
                let resources = snapshot
                    .resources
                    .iter()
                    .cloned()
                    .map(|mut handle| {
                        if handle.id == handle_id {
                            handle
                                .metadata
                                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                        }
                        handle
                    })
                    .collect();
                Plan::Write {
                    resources,
                    value: true,
                }
            })
            .await;
        match outcome {
            Ok(landed) => {
                if !landed {
                    warn!(key = %self.key, handle_id, "metadata target is no longer pooled");
                }
                landed
            }
            Err(err) => {
                warn!(key = %self.key, handle_id, error = %err, "metadata update dropped");
                false
            }
        }
    }

    async fn mutate<T, F>(
        &self,
        operation: &'static str,
        attempts: u32,
        mut plan: F,
    ) -> Result<T, PoolError>
    where
        F: FnMut(&PoolSnapshot) -> Plan<T> + Send,
        T: Send,
    {
        let started = Instant::now();
        let Some(_local) = self.within_deadline(started, self.local.lock()).await else {
            return Err(PoolError::Unavailable {
                attempts: 0,
                reason: self.deadline_reason(operation),
            });
        };
        let mut reason = String::from("deadline passed before the first attempt");
        for attempt in 1..=attempts {
            if self.deadline_passed(started) {
                return Err(PoolError::Unavailable {
                    attempts: attempt - 1,
                    reason,
                });
            }
            let Some(result) = self.within_deadline(started, self.attempt(&mut plan)).await else {
                debug!(key = %self.key, operation, attempt, "attempt outlived the deadline");
                return Err(PoolError::Unavailable {
                    attempts: attempt,
                    reason: self.deadline_reason(operation),
                });
            };
            match result {
                Ok(Attempt::Finished(value)) => return Ok(value),
                Ok(Attempt::Conflict(why)) => {
                    debug!(key = %self.key, operation, attempt, why, "write conflicted");
                    reason = format!("{operation} conflicted with a concurrent writer ({why})");
                }
                Err(Interrupted::Transient(message)) => {
                    debug!(key = %self.key, operation, attempt, error = %message, "backend failed");
                    reason = message;
                }
                Err(Interrupted::Fatal(err)) => return Err(err),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }
        Err(PoolError::Unavailable { attempts, reason })
    }

    async fn attempt<T, F>(&self, plan: &mut F) -> Result<Attempt<T>, Interrupted>
    where
        F: FnMut(&PoolSnapshot) -> Plan<T> + Send,
        T: Send,
    {
        let stored = self.backend.get(&self.key).await?;
        let snapshot = decode(stored.as_ref())?;
        let (resources, value) = match plan(&snapshot) {
            Plan::Finish(value) => return Ok(Attempt::Finished(value)),
            Plan::Write { resources, value } => (resources, value),
        };

        let writer = Uuid::new_v4().to_string();
        let bytes = snapshot.successor(resources, writer.clone()).encode()?;
        let conflict = if self.conditional_for(stored.as_ref()) {
            self.write_conditional(stored.as_ref(), &bytes).await?
        } else {
            self.write_best_effort(stored.as_ref(), &bytes, &writer).await?
        };
        Ok(conflict.map_or(Attempt::Finished(value), Attempt::Conflict))
    }

    fn conditional_for(&self, stored: Option<&StoredBlob>) -> bool {
        self.backend.supports_conditional_set()
            && stored.is_none_or(|blob| blob.version.is_some())
    }

    async fn write_conditional(
        &self,
        stored: Option<&StoredBlob>,
        bytes: &[u8],
    ) -> Result<Option<&'static str>, Interrupted> {
        let expected = stored.and_then(|blob| blob.version.as_ref());
        match self.backend.set_if_version(&self.key, bytes, expected).await? {
            SetOutcome::Written => Ok(None),
            SetOutcome::VersionConflict => Ok(Some("stored version changed")),
        }
    }

    async fn write_best_effort(
        &self,
        stored: Option<&StoredBlob>,
        bytes: &[u8],
        writer: &str,
    ) -> Result<Option<&'static str>, Interrupted> {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            warn!(
                key = %self.key,
                backend = %self.backend.kind(),
                "backend lacks conditional writes; using read-verify-write, which can \
                 still hand one handle to two callers in a narrow window"
            );
        }

        tokio::time::sleep(self.retry.settle_pause()).await;
        let before = self.backend.get(&self.key).await?;
        if before.as_ref().map(|blob| &blob.bytes) != stored.map(|blob| &blob.bytes) {
            return Ok(Some("snapshot moved before write"));
        }

        self.backend.set(&self.key, bytes).await?;

        tokio::time::sleep(self.retry.settle_pause()).await;
        let after = self.backend.get(&self.key).await?;
        let confirmed = decode(after.as_ref())?;
        if confirmed.writer.as_deref() == Some(writer) {
            Ok(None)
        } else {
            Ok(Some("write was overtaken before confirmation"))
        }
    }

    fn deadline_passed(&self, started: Instant) -> bool {
        self.retry
            .deadline
            .is_some_and(|deadline| started.elapsed() >= deadline)
    }

    /// Runs `work`, giving up with `None` once the operation deadline passes.
    async fn within_deadline<R>(
        &self,
        started: Instant,
        work: impl Future<Output = R>,
    ) -> Option<R> {
        match self.retry.deadline {
            None => Some(work.await),
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, work).await.ok()
            }
        }
    }

    fn deadline_reason(&self, operation: &str) -> String {
        let limit = self.retry.deadline.unwrap_or_default();
        format!("{operation} did not finish within the {limit:?} deadline")
    }
}

fn decode(stored: Option<&StoredBlob>) -> Result<PoolSnapshot, SnapshotDecodeError> {
    stored.map_or_else(
        || Ok(PoolSnapshot::default()),
        |blob| PoolSnapshot::decode(&blob.bytes),
    )
}
