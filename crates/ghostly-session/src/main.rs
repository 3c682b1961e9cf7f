//! ghostly-session CLI entry point.

mod args;
mod daemon;
mod info;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Commands};
use crate::daemon::registry::Registry;
use crate::daemon::{client, server};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Create(args) => {
            server::create(&args.name, join_command(&args.command).as_deref())
        }
        Commands::Attach(args) => client::attach(&args.name),
        Commands::Open(args) => client::open(&args.name, join_command(&args.command).as_deref()),
        Commands::List(args) => list_sessions(args.json),
        Commands::Info(args) => info::report(args.json),
        Commands::Kill(args) => client::kill(&args.name),
        Commands::Version => {
            println!("ghostly-session {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Join the argv captured after `--` into the single command string the
/// session shell receives via `-c`.
fn join_command(parts: &[String]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn list_sessions(json: bool) -> Result<i32> {
    let registry = Registry::open()?;
    let sessions = registry.enumerate();

    if json {
        println!("{}", serde_json::json!({ "sessions": sessions }));
    } else if sessions.is_empty() {
        println!("No active sessions.");
    } else {
        println!("Active sessions:");
        for session in &sessions {
            println!(
                "  {:<20}  pid={:<6}  clients={}  cmd={}",
                session.name, session.pid, session.clients, session.command
            );
        }
    }
    Ok(0)
}
