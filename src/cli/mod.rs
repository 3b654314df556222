//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the pairing gateway (`serve`, the default)
//! - Inspecting stored sessions (`sessions list`)
//! - Deleting a stored session (`sessions purge <ID>`)

mod sessions;

pub use sessions::{SessionsCommand, run_sessions_command, run_sessions_command_with_store};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(about = "Links secondary devices to a messaging account with pairing codes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP gateway (default if no subcommand given)
    Serve,

    /// Inspect or delete stored pairing sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),
}
