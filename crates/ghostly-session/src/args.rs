//! CLI argument parsing with clap derive macros.

use clap::{ArgAction, Parser, Subcommand};

/// Detachable shell sessions over a per-user local socket.
///
/// `create` daemonises a shell on a pseudoterminal; any number of
/// terminals can `attach` to it and share it live. Sessions survive the
/// terminal that created them and are private to your user.
#[derive(Debug, Parser)]
#[command(
    name = "ghostly-session",
    version,
    disable_version_flag = true,
    after_help = "\
Session names: alphanumeric, dash, underscore, dot (max 64 chars)
Detach key: Ctrl+\\ (0x1C)"
)]
pub struct Cli {
    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a detached session (daemonises)
    #[command(after_help = "\
Examples:
  ghostly-session create work                   # Login shell named 'work'
  ghostly-session create build -- make -j8      # Run a command instead
  ghostly-session attach work                   # Connect to it later")]
    Create(CreateArgs),

    /// Attach to a running session
    Attach(NameArgs),

    /// Attach to a session, creating it first if needed
    #[command(after_help = "\
Examples:
  ghostly-session open work                     # Attach-or-create
  ghostly-session open tail -- tail -f app.log")]
    Open(CreateArgs),

    /// List live sessions
    List(ListArgs),

    /// Report host and scheduler information
    Info(InfoArgs),

    /// Terminate a session and clean its registry files
    Kill(NameArgs),

    /// Print version information
    Version,
}

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Session name
    pub name: String,

    /// Command to run inside the session, given after `--`.
    /// Defaults to a login shell.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct NameArgs {
    /// Session name
    pub name: String,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Emit machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct InfoArgs {
    /// Emit machine-readable JSON
    #[arg(long)]
    pub json: bool,
}
