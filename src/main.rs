//! Binary entry point for the Hangar CLI.
//!
//! Stdout carries machine-readable JSON; logs and messages go to stderr.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use chrono::Utc;
use clap::Parser;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use hangar::{
    Acquisition, AnyBackend, Backend, BackendError, CheckinOutcome, CheckoutOutcome,
    CommandActivator, CommandError, CommandLine, CommandProvisioner, ConfigError, ConfigStore,
    ConfigStoreError, ConfigWriter, CredentialGate, InsertPosition, PoolConfig, PoolError,
    PoolRefiller, PoolStore, ProcessCommandRunner, Readiness, ResourceCheckoutService,
    ResourceHandle, RunMode, SetupField, SetupPrompter, UnavailableReason,
};

mod cli;

use cli::{CheckinCommand, Cli, ReadyCommand, RefillCommand};

const LOG_ENV: &str = "HANGAR_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";
const EXIT_ERROR: i32 = 1;
const EXIT_UNAVAILABLE: i32 = 3;
const EXIT_NEEDS_SETUP: i32 = 4;
const CHECKED_IN_AT: &str = "checked_in_at";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("could not save setup: {0}")]
    ConfigStore(#[from] ConfigStoreError),
    #[error("invalid handle input: {0}")]
    Input(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_ERROR
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = PoolConfig::load_without_cli_args()?;
    let backend = AnyBackend::new(config.backend_kind()?, config.backend_parameters());

    match cli {
        Cli::Status => status(&open_store(backend, &config)?).await,
        Cli::Checkout => checkout(&open_store(backend, &config)?).await,
        Cli::Checkin(args) => checkin(&open_store(backend, &config)?, &args).await,
        Cli::Refill(args) => refill(&open_store(backend, &config)?, &config, &args).await,
        Cli::Acquire => acquire(&open_store(backend, &config)?, &config).await,
        Cli::Ready(args) => ready(&backend, &args).await,
    }
}

fn open_store(backend: AnyBackend, config: &PoolConfig) -> Result<PoolStore<AnyBackend>, CliError> {
    config.validate()?;
    Ok(PoolStore::new(backend, &config.project_name)?.with_retry_policy(config.retry_policy()))
}

fn emit(value: &serde_json::Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).map_err(io::Error::from)?;
    writeln!(stdout)?;
    Ok(())
}

fn notice(message: &str) {
    writeln!(io::stderr(), "{message}").ok();
}

async fn status(store: &PoolStore<AnyBackend>) -> Result<i32, CliError> {
    let snapshot = store.read().await?;
    let resources: Vec<_> = snapshot
        .resources
        .iter()
        .map(|handle| {
            json!({
                "id": handle.id,
                "display_alias": handle.display_alias,
                "created_at": handle.created_at,
                "status": handle.status,
                "metadata": handle.metadata,
            })
        })
        .collect();
    emit(&json!({
        "key": store.key(),
        "version": snapshot.version,
        "size": snapshot.len(),
        "resources": resources,
    }))?;
    Ok(0)
}

async fn checkout(store: &PoolStore<AnyBackend>) -> Result<i32, CliError> {
    match store.checkout().await {
        Ok(CheckoutOutcome::Acquired(handle)) => {
            emit(&serde_json::to_value(&handle).map_err(io::Error::from)?)?;
            Ok(0)
        }
        Ok(CheckoutOutcome::Empty) => {
            notice("pool is empty");
            Ok(EXIT_UNAVAILABLE)
        }
        Err(err @ PoolError::Unavailable { .. }) => {
            notice(&err.to_string());
            Ok(EXIT_UNAVAILABLE)
        }
        Err(err) => Err(err.into()),
    }
}

fn read_handle(source: &str) -> Result<ResourceHandle, CliError> {
    let raw = if source == "-" {
        io::read_to_string(io::stdin())?
    } else {
        fs::read_to_string(source)?
    };
    serde_json::from_str(&raw).map_err(|err| CliError::Input(err.to_string()))
}

async fn checkin(store: &PoolStore<AnyBackend>, args: &CheckinCommand) -> Result<i32, CliError> {
    let handle = read_handle(&args.source)?;
    let position = if args.front {
        InsertPosition::Front
    } else {
        InsertPosition::Back
    };
    let id = handle.id.clone();
    let outcome = store.checkin(handle, position).await?;
    if outcome == CheckinOutcome::Inserted {
        let stamp = BTreeMap::from([(String::from(CHECKED_IN_AT), Utc::now().to_rfc3339())]);
        store.update_metadata(&id, stamp).await;
    }
    let label = match outcome {
        CheckinOutcome::Inserted => "inserted",
        CheckinOutcome::AlreadyPresent => "already_present",
        CheckinOutcome::PoolFull => "pool_full",
    };
    emit(&json!({ "id": id, "outcome": label }))?;
    Ok(0)
}

async fn refill(
    store: &PoolStore<AnyBackend>,
    config: &PoolConfig,
    args: &RefillCommand,
) -> Result<i32, CliError> {
    let command = CommandLine::parse("provision", config.provision_command()?)?;
    let provisioner = CommandProvisioner::new(ProcessCommandRunner, command);
    let target = args
        .target
        .unwrap_or_else(|| config.default_refill_target());
    let report = PoolRefiller::new(store, provisioner)
        .with_concurrency(config.refill_concurrency())
        .refill(target)
        .await?;

    let ids = |handles: &[ResourceHandle]| -> Vec<String> {
        handles.iter().map(|handle| handle.id.clone()).collect()
    };
    if !report.surplus.is_empty() {
        notice("some provisioned resources were not pooled because the target was reached; tear them down");
    }
    emit(&json!({
        "target": target,
        "requested": report.requested,
        "succeeded": report.succeeded,
        "failed": report.failed,
        "added": ids(&report.added),
        "surplus": ids(&report.surplus),
        "failures": report.failures,
    }))?;
    Ok(if report.failed == 0 { 0 } else { EXIT_ERROR })
}

async fn acquire(store: &PoolStore<AnyBackend>, config: &PoolConfig) -> Result<i32, CliError> {
    let command = CommandLine::parse("activate", config.activate_command()?)?;
    let activator = CommandActivator::new(ProcessCommandRunner, command);
    match ResourceCheckoutService::new(store, activator).acquire().await? {
        Acquisition::Activated(resource) => {
            emit(&json!({
                "id": resource.handle.id,
                "display_alias": resource.handle.display_alias,
                "session": resource.session,
            }))?;
            Ok(0)
        }
        Acquisition::Unavailable(reason) => {
            notice(&describe_unavailable(&reason));
            Ok(EXIT_UNAVAILABLE)
        }
    }
}

fn describe_unavailable(reason: &UnavailableReason) -> String {
    match reason {
        UnavailableReason::PoolEmpty => String::from("pool is empty"),
        UnavailableReason::PoolUnavailable(detail) => format!("pool unavailable: {detail}"),
        UnavailableReason::ActivationFailed { id, message } => {
            format!("activation of {id} failed and it was discarded: {message}")
        }
    }
}

async fn ready(backend: &AnyBackend, args: &ReadyCommand) -> Result<i32, CliError> {
    let mode = RunMode::detect();
    let (kind, reason) = match CredentialGate::new(backend).ensure_ready_for(mode).await? {
        Readiness::Ready => {
            emit(&json!({ "backend": backend.kind().as_str(), "ready": true }))?;
            return Ok(0);
        }
        Readiness::NeedsInteractiveSetup { kind, reason } => (kind, reason),
    };

    if !args.setup {
        notice(&format!(
            "{kind} backend needs setup: {reason}; rerun with --setup to configure it"
        ));
        return Ok(EXIT_NEEDS_SETUP);
    }

    let config_store = ConfigStore::new();
    let recorded = config_store
        .current_backend()?
        .filter(|recorded| recorded != kind.as_str());
    if let Some(previous) = recorded {
        notice(&format!("replacing the recorded `{previous}` backend with {kind}"));
    }
    let parameters = backend.run_interactive_setup(&StdinPrompter).await?;
    let path = config_store.write_backend_setup(kind, &parameters)?;
    notice(&format!("saved {kind} backend settings to {path}"));

    let configured = AnyBackend::new(kind, parameters);
    match CredentialGate::new(&configured).ensure_ready().await? {
        Readiness::Ready => {
            emit(&json!({ "backend": kind.as_str(), "ready": true }))?;
            Ok(0)
        }
        Readiness::NeedsInteractiveSetup { reason: remaining, .. } => {
            notice(&format!("{kind} backend still needs setup: {remaining}"));
            Ok(EXIT_NEEDS_SETUP)
        }
    }
}

/// Asks setup questions on stderr and reads answers from stdin.
struct StdinPrompter;

impl SetupPrompter for StdinPrompter {
    fn prompt(
        &self,
        field: &SetupField,
        current: Option<&str>,
    ) -> Result<Option<String>, BackendError> {
        let mut stderr = io::stderr();
        let suffix = current.map(|value| format!(" [{value}]")).unwrap_or_default();
        write!(stderr, "{}{suffix}: ", field.prompt)
            .and_then(|()| stderr.flush())
            .map_err(|err| BackendError::unavailable(format!("cannot prompt: {err}")))?;

        let mut answer = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|err| BackendError::unavailable(format!("cannot read answer: {err}")))?;
        Ok((read > 0).then(|| answer.trim().to_owned()))
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Input(String::from("expected value"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("invalid handle input: expected value"),
            "rendered: {rendered}"
        );
    }

    #[rstest]
    #[case(UnavailableReason::PoolEmpty, "pool is empty")]
    #[case(UnavailableReason::PoolUnavailable(String::from("busy")), "pool unavailable: busy")]
    #[case(
        UnavailableReason::ActivationFailed {
            id: String::from("vm-1"),
            message: String::from("denied"),
        },
        "activation of vm-1 failed"
    )]
    fn unavailable_reasons_are_described(#[case] reason: UnavailableReason, #[case] text: &str) {
        assert!(describe_unavailable(&reason).contains(text));
    }

    #[test]
    fn cli_parses_checkin_flags() {
        let cli = Cli::try_parse_from(["hangar", "checkin", "--front", "handle.json"])
            .expect("parse");
        let Cli::Checkin(args) = cli else {
            panic!("expected checkin");
        };
        assert!(args.front);
        assert_eq!(args.source, "handle.json");
    }

    #[test]
    fn cli_checkin_defaults_to_stdin() {
        let cli = Cli::try_parse_from(["hangar", "checkin"]).expect("parse");
        let Cli::Checkin(args) = cli else {
            panic!("expected checkin");
        };
        assert_eq!(args.source, "-");
    }
}
