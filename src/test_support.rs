//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{
    Backend, BackendError, BackendFuture, BackendKind, BackendParameters, BlobVersion,
    MemoryBackend, SetOutcome, SetupField, StoredBlob,
};
use crate::checkout::Activator;
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::refill::Provisioner;
use crate::snapshot::{ActivationSecret, PoolSnapshot, ResourceHandle};

fn locked<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|err| panic!("test double lock poisoned: {err}"))
}

/// Builds a ready handle whose secret is `secret-<id>`.
#[must_use]
pub fn handle(id: &str) -> ResourceHandle {
    ResourceHandle::new(id, format!("alias-{id}"), ActivationSecret::new(format!("secret-{id}")))
}

/// Failure raised by the scripted doubles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct ScriptedFailure(pub String);

#[derive(Debug, Default)]
struct BackendFaults {
    always_conflict: bool,
    failing_reads: u32,
    failing_writes: u32,
    configuration_error: Option<String>,
    initialize_error: Option<String>,
    setup_required: bool,
    stalled: bool,
    write_attempts: u32,
}

/// In-memory backend with fault injection.
///
/// Clones share both the stored data and the fault script.
#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    inner: MemoryBackend,
    faults: Arc<StdMutex<BackendFaults>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Backend with conditional writes.
    #[must_use]
    pub fn new() -> Self {
        Self::wrapping(MemoryBackend::new())
    }

    /// Backend without conditional writes, forcing the read-verify-write path.
    #[must_use]
    pub fn best_effort() -> Self {
        Self::wrapping(MemoryBackend::without_conditional_set())
    }

    fn wrapping(inner: MemoryBackend) -> Self {
        Self {
            inner,
            faults: Arc::new(StdMutex::new(BackendFaults::default())),
        }
    }

    /// Underlying storage.
    #[must_use]
    pub const fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Writes a snapshot holding `handles` under the default test key.
    pub async fn seed(&self, handles: &[ResourceHandle]) {
        self.seed_key(DEFAULT_TEST_KEY, handles).await;
    }

    /// Writes a snapshot holding `handles` under `key`.
    pub async fn seed_key(&self, key: &str, handles: &[ResourceHandle]) {
        let snapshot = PoolSnapshot {
            resources: handles.to_vec(),
            ..PoolSnapshot::default()
        };
        let bytes = snapshot
            .encode()
            .unwrap_or_else(|err| panic!("encode seed snapshot: {err}"));
        self.inner
            .set(key, &bytes)
            .await
            .unwrap_or_else(|err| panic!("seed snapshot: {err}"));
    }

    /// Makes every write lose to a concurrent writer.
    pub fn always_conflict(&self) {
        locked(&self.faults).always_conflict = true;
    }

    /// Fails the next `count` reads with a transient error.
    pub fn fail_next_reads(&self, count: u32) {
        locked(&self.faults).failing_reads = count;
    }

    /// Fails the next `count` writes with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        locked(&self.faults).failing_writes = count;
    }

    /// Rejects every operation as misconfigured.
    pub fn reject_configuration(&self, message: &str) {
        locked(&self.faults).configuration_error = Some(message.to_owned());
    }

    /// Fails `initialize` with a transient error.
    pub fn fail_initialize(&self, message: &str) {
        locked(&self.faults).initialize_error = Some(message.to_owned());
    }

    /// Makes every read and write hang without ever completing.
    pub fn stall(&self) {
        locked(&self.faults).stalled = true;
    }

    /// Reports that interactive setup is needed.
    pub fn require_setup(&self) {
        locked(&self.faults).setup_required = true;
    }

    /// Number of write attempts observed, including failed and conflicting
    /// ones.
    #[must_use]
    pub fn write_attempts(&self) -> u32 {
        locked(&self.faults).write_attempts
    }

    async fn wait_if_stalled(&self) {
        let stalled = locked(&self.faults).stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    fn check_configuration(&self) -> Result<(), BackendError> {
        locked(&self.faults)
            .configuration_error
            .clone()
            .map_or(Ok(()), |message| {
                Err(BackendError::configuration(BackendKind::Memory, message))
            })
    }

    fn before_read(&self) -> Result<(), BackendError> {
        self.check_configuration()?;
        let mut faults = locked(&self.faults);
        if faults.failing_reads > 0 {
            faults.failing_reads -= 1;
            return Err(BackendError::unavailable("scripted read failure"));
        }
        Ok(())
    }

    /// Returns `Ok(true)` when the write should actually be stored.
    fn before_write(&self) -> Result<bool, BackendError> {
        self.check_configuration()?;
        let mut faults = locked(&self.faults);
        faults.write_attempts += 1;
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(BackendError::unavailable("scripted write failure"));
        }
        Ok(!faults.always_conflict)
    }
}

/// Key used by [`ScriptedBackend::seed`]; matches project `test pool`.
pub const DEFAULT_TEST_KEY: &str = "pool_test-pool";

/// Project name whose key is [`DEFAULT_TEST_KEY`].
pub const DEFAULT_TEST_PROJECT: &str = "test pool";

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn parameters(&self) -> &BackendParameters {
        self.inner.parameters()
    }

    fn initialize(&self) -> BackendFuture<'_, (), BackendError> {
        Box::pin(async move {
            self.check_configuration()?;
            let outage = locked(&self.faults).initialize_error.clone();
            outage.map_or(Ok(()), |message| Err(BackendError::unavailable(message)))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<StoredBlob>, BackendError> {
        Box::pin(async move {
            self.wait_if_stalled().await;
            self.before_read()?;
            self.inner.get(key).await
        })
    }

    fn set<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            self.wait_if_stalled().await;
            if self.before_write()? {
                self.inner.set(key, bytes).await?;
            }
            Ok(())
        })
    }

    fn supports_conditional_set(&self) -> bool {
        self.inner.supports_conditional_set()
    }

    fn set_if_version<'a>(
        &'a self,
        key: &'a str,
        bytes: &'a [u8],
        expected: Option<&'a BlobVersion>,
    ) -> BackendFuture<'a, SetOutcome, BackendError> {
        Box::pin(async move {
            self.wait_if_stalled().await;
            if !self.before_write()? {
                return Ok(SetOutcome::VersionConflict);
            }
            self.inner.set_if_version(key, bytes, expected).await
        })
    }

    fn requires_interactive_setup(&self) -> bool {
        locked(&self.faults).setup_required
    }

    fn setup_fields(&self) -> Vec<SetupField> {
        self.inner.setup_fields()
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    issued: u32,
    calls: u32,
    failures: VecDeque<bool>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Provisioner issuing `<prefix>-<n>` handles with scripted failures.
#[derive(Clone, Debug)]
pub struct ScriptedProvisioner {
    prefix: String,
    delay: Duration,
    state: Arc<StdMutex<ProvisionerState>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner whose handle ids start with `prefix`.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            delay: Duration::from_millis(2),
            state: Arc::new(StdMutex::new(ProvisionerState::default())),
        }
    }

    /// Scripts the next calls: `true` fails, `false` succeeds.
    pub fn script(&self, outcomes: &[bool]) {
        locked(&self.state).failures.extend(outcomes.iter().copied());
    }

    /// Number of `provision` calls made.
    #[must_use]
    pub fn calls(&self) -> u32 {
        locked(&self.state).calls
    }

    /// Largest number of provisions observed running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        locked(&self.state).max_in_flight
    }
}

impl Provisioner for ScriptedProvisioner {
    type Error = ScriptedFailure;

    fn provision(&self) -> BackendFuture<'_, ResourceHandle, Self::Error> {
        Box::pin(async move {
            let fail = {
                let mut state = locked(&self.state);
                state.calls += 1;
                state.in_flight += 1;
                state.max_in_flight = state.max_in_flight.max(state.in_flight);
                state.failures.pop_front().unwrap_or(false)
            };
            tokio::time::sleep(self.delay).await;
            let mut state = locked(&self.state);
            state.in_flight -= 1;
            if fail {
                return Err(ScriptedFailure(String::from("scripted provisioning failure")));
            }
            state.issued += 1;
            Ok(handle(&format!("{}-{}", self.prefix, state.issued)))
        })
    }
}

#[derive(Debug, Default)]
struct ActivatorState {
    rejected: HashSet<String>,
    activated: Vec<String>,
}

/// Activator returning `session-<secret>` unless the secret is rejected.
#[derive(Clone, Debug, Default)]
pub struct ScriptedActivator {
    state: Arc<StdMutex<ActivatorState>>,
}

impl ScriptedActivator {
    /// Creates an activator accepting every secret.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes activation with `secret` fail.
    pub fn reject(&self, secret: &str) {
        locked(&self.state).rejected.insert(secret.to_owned());
    }

    /// Secrets successfully activated so far.
    #[must_use]
    pub fn activated(&self) -> Vec<String> {
        locked(&self.state).activated.clone()
    }
}

impl Activator for ScriptedActivator {
    type Session = String;
    type Error = ScriptedFailure;

    fn activate<'a>(
        &'a self,
        secret: &'a ActivationSecret,
    ) -> BackendFuture<'a, Self::Session, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if state.rejected.contains(secret.expose()) {
                return Err(ScriptedFailure(String::from("login refused")));
            }
            state.activated.push(secret.expose().to_owned());
            Ok(format!("session-{}", secret.expose()))
        })
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<StdMutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.state).invocations.clone()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.state).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        envs: &'a [(&'a str, &'a str)],
    ) -> BackendFuture<'a, CommandOutput, CommandError> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.invocations.push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                envs: envs
                    .iter()
                    .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                    .collect(),
            });
            state
                .responses
                .pop_front()
                .ok_or_else(|| CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs.iter().map(|(key, value)| (*key, Some(*value)))).await
    }

    /// Sets `set` and removes `removed` while holding the global mutex.
    pub async fn set_and_remove(set: &[(&str, &str)], removed: &[&str]) -> Self {
        let changes = set
            .iter()
            .map(|(key, value)| (*key, Some(*value)))
            .chain(removed.iter().map(|key| (*key, None)));
        Self::apply(changes).await
    }

    async fn apply<'a>(requested: impl Iterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let changes: Vec<_> = requested.collect();
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                changes.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            previous.push((key.to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
