//! Provisioning and activation through external commands.
//!
//! The provision command prints one JSON object describing the new resource
//! on stdout. The activate command receives the activation secret in
//! `HANGAR_ACTIVATION_SECRET` and prints a session token.

use std::collections::BTreeMap;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::backend::BackendFuture;
use crate::checkout::Activator;
use crate::refill::Provisioner;
use crate::snapshot::{ActivationSecret, ResourceHandle, ResourceStatus};

/// Environment variable carrying the activation secret.
pub const ACTIVATION_SECRET_ENV: &str = "HANGAR_ACTIVATION_SECRET";

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors surfaced while running provision or activate commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exits unsuccessfully.
    #[error("{program} exited with status {status}: {stderr}")]
    Failure {
        /// Command that failed.
        program: String,
        /// Exit status, or `signal` when the process was killed.
        status: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when the command output cannot be interpreted.
    #[error("could not parse output of {program}: {message}")]
    Parse {
        /// Command whose output was rejected.
        program: String,
        /// Parser message.
        message: String,
    },
    /// Raised when a configured command line has no program.
    #[error("{name} command is empty")]
    Empty {
        /// Which command was empty.
        name: &'static str,
    },
}

/// A program plus its arguments, split from a configured command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Splits `line` on whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Empty`] when `line` has no words.
    pub fn parse(name: &'static str, line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or(CommandError::Empty { name })?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    /// Program to run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and extra environment variables, capturing
    /// stdout and stderr.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        envs: &'a [(&'a str, &'a str)],
    ) -> BackendFuture<'a, CommandOutput, CommandError>;
}

/// Real command runner that spawns processes on the host.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        envs: &'a [(&'a str, &'a str)],
    ) -> BackendFuture<'a, CommandOutput, CommandError> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .envs(envs.iter().copied())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| CommandError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

async fn run_checked<R: CommandRunner>(
    runner: &R,
    command: &CommandLine,
    envs: &[(&str, &str)],
) -> Result<String, CommandError> {
    let output = runner.run(&command.program, &command.args, envs).await?;
    if !output.is_success() {
        return Err(CommandError::Failure {
            program: command.program.clone(),
            status: output
                .code
                .map_or_else(|| String::from("signal"), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

#[derive(Deserialize)]
struct ProvisionedResource {
    id: String,
    #[serde(default)]
    display_alias: Option<String>,
    activation_secret: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Provisions resources by running a configured command.
#[derive(Clone, Debug)]
pub struct CommandProvisioner<R> {
    runner: R,
    command: CommandLine,
}

impl<R: CommandRunner> CommandProvisioner<R> {
    /// Creates a provisioner running `command`.
    #[must_use]
    pub const fn new(runner: R, command: CommandLine) -> Self {
        Self { runner, command }
    }

    async fn provision_once(&self) -> Result<ResourceHandle, CommandError> {
        let stdout = run_checked(&self.runner, &self.command, &[]).await?;
        let parsed: ProvisionedResource =
            serde_json::from_str(stdout.trim()).map_err(|err| CommandError::Parse {
                program: self.command.program.clone(),
                message: err.to_string(),
            })?;
        if parsed.id.trim().is_empty() {
            return Err(CommandError::Parse {
                program: self.command.program.clone(),
                message: String::from("`id` is empty"),
            });
        }
        Ok(ResourceHandle {
            display_alias: parsed
                .display_alias
                .filter(|alias| !alias.trim().is_empty())
                .unwrap_or_else(|| parsed.id.clone()),
            id: parsed.id,
            activation_secret: ActivationSecret::new(parsed.activation_secret),
            created_at: parsed.created_at.unwrap_or_else(Utc::now),
            status: ResourceStatus::Ready,
            metadata: BTreeMap::new(),
        })
    }
}

impl<R: CommandRunner> Provisioner for CommandProvisioner<R> {
    type Error = CommandError;

    fn provision(&self) -> BackendFuture<'_, ResourceHandle, Self::Error> {
        Box::pin(self.provision_once())
    }
}

/// Activates resources by running a configured command.
#[derive(Clone, Debug)]
pub struct CommandActivator<R> {
    runner: R,
    command: CommandLine,
}

impl<R: CommandRunner> CommandActivator<R> {
    /// Creates an activator running `command`.
    #[must_use]
    pub const fn new(runner: R, command: CommandLine) -> Self {
        Self { runner, command }
    }
}

impl<R: CommandRunner> Activator for CommandActivator<R> {
    type Session = String;
    type Error = CommandError;

    fn activate<'a>(
        &'a self,
        secret: &'a ActivationSecret,
    ) -> BackendFuture<'a, Self::Session, Self::Error> {
        Box::pin(async move {
            let envs = [(ACTIVATION_SECRET_ENV, secret.expose())];
            let stdout = run_checked(&self.runner, &self.command, &envs).await?;
            Ok(stdout.trim().to_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    fn line(raw: &str) -> CommandLine {
        CommandLine::parse("test", raw).expect("command line")
    }

    #[rstest]
    #[case("", true)]
    #[case("   ", true)]
    #[case("provision --fast", false)]
    fn command_line_rejects_blank(#[case] raw: &str, #[case] empty: bool) {
        assert_eq!(CommandLine::parse("provision", raw).is_err(), empty);
    }

    #[test]
    fn command_line_splits_words() {
        let parsed = line("vm-tool create  --size small");
        assert_eq!(parsed.program(), "vm-tool");
        assert_eq!(parsed.args(), ["create", "--size", "small"]);
    }

    #[tokio::test]
    async fn provisioner_parses_json_and_defaults_alias() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"id":"vm-1","activation_secret":"s"}"#, "");
        let provisioner = CommandProvisioner::new(runner.clone(), line("vm-tool create"));

        let handle = provisioner.provision().await.expect("provision");
        assert_eq!(handle.id, "vm-1");
        assert_eq!(handle.display_alias, "vm-1");
        assert_eq!(handle.activation_secret.expose(), "s");
        assert_eq!(
            runner.invocations()[0].command_string(),
            "vm-tool create"
        );
    }

    #[tokio::test]
    async fn provisioner_keeps_reported_creation_time() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{"id":"vm-2","display_alias":"blue","activation_secret":"s","created_at":"2024-05-01T10:00:00Z"}"#,
            "",
        );
        let provisioner = CommandProvisioner::new(runner, line("vm-tool"));

        let handle = provisioner.provision().await.expect("provision");
        assert_eq!(handle.display_alias, "blue");
        assert_eq!(handle.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[rstest]
    #[case(Some(0), "not json")]
    #[case(Some(0), r#"{"id":" ","activation_secret":"s"}"#)]
    #[case(Some(2), "")]
    #[case(None, "")]
    #[tokio::test]
    async fn provisioner_reports_failures(#[case] code: Option<i32>, #[case] stdout: &str) {
        let runner = ScriptedRunner::new();
        runner.push_output(code, stdout, "boom");
        let provisioner = CommandProvisioner::new(runner, line("vm-tool"));

        let err = provisioner.provision().await.expect_err("failure");
        assert!(
            matches!(err, CommandError::Parse { .. } | CommandError::Failure { .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn activator_passes_secret_in_environment() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "session-token\n", "");
        let activator = CommandActivator::new(runner.clone(), line("vm-tool login"));

        let session = activator
            .activate(&ActivationSecret::new("hunter2"))
            .await
            .expect("activate");
        assert_eq!(session, "session-token");
        let invocation = &runner.invocations()[0];
        assert_eq!(
            invocation.envs,
            [(ACTIVATION_SECRET_ENV.to_owned(), String::from("hunter2"))]
        );
        assert!(!invocation.command_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn activator_surfaces_nonzero_exit() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "denied\n");
        let activator = CommandActivator::new(runner, line("vm-tool login"));

        let err = activator
            .activate(&ActivationSecret::new("x"))
            .await
            .expect_err("failure");
        assert_eq!(
            err,
            CommandError::Failure {
                program: String::from("vm-tool"),
                status: String::from("1"),
                stderr: String::from("denied"),
            }
        );
    }
}
