//! Gives a caller one ready resource, or a reason to provision on demand.

use std::error::Error as StdError;

use tracing::{debug, warn};

use crate::backend::{Backend, BackendFuture};
use crate::snapshot::{ActivationSecret, ResourceHandle};
use crate::store::{CheckoutOutcome, PoolError, PoolStore};

/// Turns an activation secret into a live session.
pub trait Activator: Send + Sync {
    /// Session produced on success.
    type Session: Send;
    /// Failure reported by [`Activator::activate`].
    type Error: StdError + Send + Sync + 'static;

    /// Logs into the resource identified by `secret`.
    fn activate<'a>(
        &'a self,
        secret: &'a ActivationSecret,
    ) -> BackendFuture<'a, Self::Session, Self::Error>;
}

/// A checked-out handle with its live session.
#[derive(Debug)]
pub struct ActivatedResource<S> {
    /// Handle removed from the pool; the caller now owns the resource.
    pub handle: ResourceHandle,
    /// Session returned by the activator.
    pub session: S,
}

/// Why no pooled resource could be handed out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnavailableReason {
    /// The pool held nothing.
    PoolEmpty,
    /// The pool could not be reached or stayed contended.
    PoolUnavailable(String),
    /// A handle was checked out but activation failed; it has been
    /// discarded.
    ActivationFailed {
        /// Identifier of the discarded handle.
        id: String,
        /// Activator error text.
        message: String,
    },
}

/// Result of [`ResourceCheckoutService::acquire`].
#[derive(Debug)]
pub enum Acquisition<S> {
    /// A pooled resource is ready to use.
    Activated(ActivatedResource<S>),
    /// The caller should provision on demand.
    Unavailable(UnavailableReason),
}

/// Checks out a handle and activates it.
#[derive(Debug)]
pub struct ResourceCheckoutService<'a, B, A> {
    store: &'a PoolStore<B>,
    activator: A,
}

impl<'a, B: Backend, A: Activator> ResourceCheckoutService<'a, B, A> {
    /// Creates a service over `store`.
    #[must_use]
    pub const fn new(store: &'a PoolStore<B>, activator: A) -> Self {
        Self { store, activator }
    }

    /// Checks out the front handle and activates it.
    ///
    /// A handle whose activation fails is dropped, never requeued.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Configuration`] and [`PoolError::Corrupt`]
    /// unchanged. Contention and outages are reported as
    /// [`Acquisition::Unavailable`].
    pub async fn acquire(&self) -> Result<Acquisition<A::Session>, PoolError> {
        let handle = match self.store.checkout().await {
            Ok(CheckoutOutcome::Acquired(handle)) => handle,
            Ok(CheckoutOutcome::Empty) => {
                debug!(key = self.store.key(), "pool empty");
                return Ok(Acquisition::Unavailable(UnavailableReason::PoolEmpty));
            }
            Err(PoolError::Unavailable { attempts, reason }) => {
                warn!(key = self.store.key(), attempts, %reason, "pool unavailable");
                return Ok(Acquisition::Unavailable(UnavailableReason::PoolUnavailable(
                    reason,
                )));
            }
            Err(err) => return Err(err),
        };

        match self.activator.activate(&handle.activation_secret).await {
            Ok(session) => Ok(Acquisition::Activated(ActivatedResource { handle, session })),
            Err(err) => {
                warn!(id = %handle.id, error = %err, "activation failed; discarding handle");
                Ok(Acquisition::Unavailable(UnavailableReason::ActivationFailed {
                    id: handle.id,
                    message: err.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::snapshot::InsertPosition;
    use crate::store::RetryPolicy;
    use crate::test_support::{DEFAULT_TEST_PROJECT, ScriptedActivator, ScriptedBackend, handle};

    fn memory_store() -> PoolStore<MemoryBackend> {
        PoolStore::new(MemoryBackend::new(), "checkout tests")
            .expect("store")
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn acquire_activates_front_handle() {
        let store = memory_store();
        store
            .checkin(handle("a"), InsertPosition::Back)
            .await
            .expect("checkin");
        let activator = ScriptedActivator::new();
        let service = ResourceCheckoutService::new(&store, activator.clone());

        let Acquisition::Activated(resource) = service.acquire().await.expect("acquire") else {
            panic!("expected activation");
        };
        assert_eq!(resource.handle.id, "a");
        assert_eq!(resource.session, "session-secret-a");
        assert!(store.read().await.expect("read").is_empty());
        assert_eq!(activator.activated(), ["secret-a"]);
    }

    #[tokio::test]
    async fn empty_pool_is_unavailable_without_activation() {
        let store = memory_store();
        let activator = ScriptedActivator::new();
        let service = ResourceCheckoutService::new(&store, activator.clone());

        let outcome = service.acquire().await.expect("acquire");
        assert!(matches!(
            outcome,
            Acquisition::Unavailable(UnavailableReason::PoolEmpty)
        ));
        assert!(activator.activated().is_empty());
    }

    #[tokio::test]
    async fn failed_activation_discards_handle() {
        let store = memory_store();
        store
            .checkin(handle("bad"), InsertPosition::Back)
            .await
            .expect("checkin");
        let activator = ScriptedActivator::new();
        activator.reject("secret-bad");
        let service = ResourceCheckoutService::new(&store, activator);

        let outcome = service.acquire().await.expect("acquire");
        let Acquisition::Unavailable(UnavailableReason::ActivationFailed { id, .. }) = outcome
        else {
            panic!("expected activation failure, got {outcome:?}");
        };
        assert_eq!(id, "bad");
        assert!(store.read().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn contention_maps_to_pool_unavailable() {
        let backend = ScriptedBackend::new();
        backend.seed(&[handle("a")]).await;
        backend.always_conflict();
        let store = PoolStore::new(backend, DEFAULT_TEST_PROJECT)
            .expect("store")
            .with_retry_policy(RetryPolicy::immediate(2));
        let service = ResourceCheckoutService::new(&store, ScriptedActivator::new());

        let outcome = service.acquire().await.expect("acquire");
        assert!(matches!(
            outcome,
            Acquisition::Unavailable(UnavailableReason::PoolUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn configuration_errors_propagate() {
        let backend = ScriptedBackend::new();
        backend.reject_configuration("token expired");
        let store = PoolStore::new(backend, "checkout tests").expect("store");
        let service = ResourceCheckoutService::new(&store, ScriptedActivator::new());

        let err = service.acquire().await.expect_err("configuration error");
        assert!(matches!(err, PoolError::Configuration(_)), "{err}");
    }
}
