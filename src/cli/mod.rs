//! Command-line interface definitions for the `hangar` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `hangar` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hangar",
    about = "Share a pool of pre-provisioned environments between machines",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Print the pool without activation secrets.
    #[command(name = "status", about = "Print the pool without activation secrets")]
    Status,
    /// Take the next handle out of the pool and print it as JSON.
    #[command(name = "checkout", about = "Take the next handle out of the pool")]
    Checkout,
    /// Return a handle to the pool.
    #[command(name = "checkin", about = "Return a handle to the pool")]
    Checkin(CheckinCommand),
    /// Provision resources until the pool reaches its target size.
    #[command(name = "refill", about = "Provision resources up to the target size")]
    Refill(RefillCommand),
    /// Check out a handle and activate it with the configured command.
    #[command(name = "acquire", about = "Check out a handle and activate it")]
    Acquire,
    /// Check that the backend is configured and reachable.
    #[command(name = "ready", about = "Check that the backend is configured")]
    Ready(ReadyCommand),
}

/// Arguments for the `hangar checkin` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckinCommand {
    /// Put the handle first in line instead of last.
    #[arg(long)]
    pub(crate) front: bool,
    /// JSON file holding the handle, or `-` for stdin.
    #[arg(value_name = "FILE", default_value = "-")]
    pub(crate) source: String,
}

/// Arguments for the `hangar refill` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RefillCommand {
    /// Pool size to reach; defaults to `max_pool_size`.
    #[arg(long, value_name = "N")]
    pub(crate) target: Option<usize>,
}

/// Arguments for the `hangar ready` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ReadyCommand {
    /// Prompt for missing connection details and save them to hangar.toml.
    ///
    /// Ignored when `CI` is set; unattended runs fail instead.
    #[arg(long)]
    pub(crate) setup: bool,
}
