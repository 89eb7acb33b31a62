//! Tops a pool up to a target size with fresh resources.

use std::error::Error as StdError;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendFuture};
use crate::snapshot::{InsertPosition, ResourceHandle};
use crate::store::{CheckinOutcome, PoolError, PoolStore};

/// Default number of provisions run at once.
pub const DEFAULT_CONCURRENCY: usize = 3;
/// Upper bound on concurrent provisions.
pub const MAX_CONCURRENCY: usize = 8;

/// Creates one new ready resource per call.
pub trait Provisioner: Send + Sync {
    /// Failure reported by [`Provisioner::provision`].
    type Error: StdError + Send + Sync + 'static;

    /// Provisions a resource and returns its handle.
    fn provision(&self) -> BackendFuture<'_, ResourceHandle, Self::Error>;
}

/// Outcome of one refill run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RefillReport {
    /// Provisions attempted: the shortfall observed by the initial read.
    pub requested: usize,
    /// Provisions whose handle was checked in.
    pub succeeded: usize,
    /// Provisions or check-ins that failed.
    pub failed: usize,
    /// Handles provisioned and checked in.
    pub added: Vec<ResourceHandle>,
    /// Provisions that failed, and check-ins that could not be persisted.
    pub failures: Vec<String>,
    /// Provisioned handles refused because the pool had already reached the
    /// target. They are not pooled and should be torn down by the caller.
    pub surplus: Vec<ResourceHandle>,
}

/// Runs provisions until the pool reaches a target size.
#[derive(Debug)]
pub struct PoolRefiller<'a, B, P> {
    store: &'a PoolStore<B>,
    provisioner: P,
    concurrency: usize,
}

impl<'a, B: Backend, P: Provisioner> PoolRefiller<'a, B, P> {
    /// Creates a refiller with the default concurrency.
    #[must_use]
    pub const fn new(store: &'a PoolStore<B>, provisioner: P) -> Self {
        Self {
            store,
            provisioner,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Sets the concurrency, clamped to `1..=8`.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Concurrency in effect.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Provisions `target - current` resources and checks each one in.
    ///
    /// Individual failures are collected in the report.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] only when the initial pool read fails.
    pub async fn refill(&self, target: usize) -> Result<RefillReport, PoolError> {
        let current = self.store.read().await?.len();
        let to_create = target.saturating_sub(current);
        let mut report = RefillReport {
            requested: to_create,
            ..RefillReport::default()
        };
        if to_create == 0 {
            debug!(key = self.store.key(), current, target, "pool already at target");
            return Ok(report);
        }

        let mut results = stream::iter(0..to_create)
            .map(|_| self.provision_and_checkin(target))
            .buffer_unordered(self.concurrency);
        while let Some(result) = results.next().await {
            match result {
                Step::Added(handle) => {
                    report.succeeded += 1;
                    report.added.push(handle);
                }
                Step::Surplus(handle) => report.surplus.push(handle),
                Step::Failed(reason) => {
                    report.failed += 1;
                    report.failures.push(reason);
                }
            }
        }

        info!(
            key = self.store.key(),
            target,
            requested = to_create,
            succeeded = report.succeeded,
            failed = report.failed,
            surplus = report.surplus.len(),
            "refill finished"
        );
        Ok(report)
    }

    async fn provision_and_checkin(&self, target: usize) -> Step {
        let handle = match self.provisioner.provision().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "provisioning failed");
                return Step::Failed(format!("provision failed: {err}"));
            }
        };
        match self
            .store
            .checkin_within(handle.clone(), InsertPosition::Back, target)
            .await
        {
            Ok(CheckinOutcome::Inserted) => Step::Added(handle),
            Ok(CheckinOutcome::PoolFull) => {
                warn!(id = %handle.id, "pool reached target before check-in");
                Step::Surplus(handle)
            }
            Ok(CheckinOutcome::AlreadyPresent) => {
                Step::Failed(format!("provisioned id {} is already pooled", handle.id))
            }
            Err(err) => {
                warn!(id = %handle.id, error = %err, "check-in of provisioned resource failed");
                Step::Failed(format!("check-in of {} failed: {err}", handle.id))
            }
        }
    }
}

enum Step {
    Added(ResourceHandle),
    Surplus(ResourceHandle),
    Failed(String),
}
