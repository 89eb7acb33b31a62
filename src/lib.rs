//! Core library for the Hangar resource pool manager.
//!
//! Hangar keeps a shared list of pre-provisioned, ready-to-use environments
//! in a pluggable key-value backend so that many independent processes can
//! check handles out and back in without handing the same one to two
//! consumers. A refill engine tops the pool up by provisioning new resources
//! in parallel, and a gate checks backend credentials before any of this
//! runs.

pub mod backend;
pub mod checkout;
pub mod command;
pub mod config;
pub mod config_store;
pub mod gate;
pub mod refill;
pub mod snapshot;
pub mod store;
pub mod test_support;

pub use backend::{
    AnyBackend, Backend, BackendError, BackendKind, BackendParameters, SetupField, SetupPrompter,
};
pub use checkout::{
    Acquisition, ActivatedResource, Activator, ResourceCheckoutService, UnavailableReason,
};
pub use command::{
    ACTIVATION_SECRET_ENV, CommandActivator, CommandError, CommandLine, CommandOutput,
    CommandProvisioner, CommandRunner, ProcessCommandRunner,
};
pub use config::{ConfigError, PoolConfig};
pub use config_store::{ConfigStore, ConfigStoreError, ConfigWriter};
pub use gate::{CredentialGate, Readiness, RunMode};
pub use refill::{PoolRefiller, Provisioner, RefillReport};
pub use snapshot::{
    ActivationSecret, InsertPosition, PoolSnapshot, ResourceHandle, ResourceStatus,
};
pub use store::{CheckinOutcome, CheckoutOutcome, PoolError, PoolStore, RetryPolicy};
