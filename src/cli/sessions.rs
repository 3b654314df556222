//! Session store CLI commands.
//!
//! Works directly on `SESSION_DIR`, so it can be used while the gateway is
//! stopped. Purging a session that a running gateway still drives makes its
//! later credential saves fail; the driver logs and carries on.

use std::io::Write;

use clap::Subcommand;

use crate::config::Config;
use crate::pairing::{FileSessionStore, SessionId, SessionStore};

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommand {
    /// List stored sessions
    List {
        /// Show registration state and credential field count
        #[arg(short, long)]
        verbose: bool,
    },

    /// Delete a stored session and its credentials
    Purge {
        /// Session id as printed by `sessions list`
        id: String,
    },
}

/// Run a sessions command against the configured session directory.
pub fn run_sessions_command(cmd: SessionsCommand) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = FileSessionStore::new(&config.pairing.session_dir);
    let mut stdout = std::io::stdout();
    run_sessions_command_with_store(cmd, &store, &mut stdout)
}

/// Run a sessions command against `store`, writing human output to `out`.
pub fn run_sessions_command_with_store(
    cmd: SessionsCommand,
    store: &dyn SessionStore,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match cmd {
        SessionsCommand::List { verbose } => list_sessions(store, verbose, out),
        SessionsCommand::Purge { id } => purge_session(store, &id, out),
    }
}

fn list_sessions(store: &dyn SessionStore, verbose: bool, out: &mut dyn Write) -> anyhow::Result<()> {
    let ids = store.list()?;
    if ids.is_empty() {
        writeln!(out, "No stored sessions.")?;
        return Ok(());
    }

    writeln!(out, "Stored sessions ({}):", ids.len())?;
    for id in ids {
        if verbose {
            let credentials = store.open(&id)?;
            let state = if credentials.registered() {
                "registered"
            } else {
                "pending"
            };
            writeln!(
                out,
                "  {}  {:<10}  {} field(s)",
                id,
                state,
                credentials.state.len()
            )?;
        } else {
            writeln!(out, "  {}", id)?;
        }
    }
    Ok(())
}

fn purge_session(store: &dyn SessionStore, id: &str, out: &mut dyn Write) -> anyhow::Result<()> {
    let id = SessionId::parse(id)?;
    if !store.exists(&id) {
        anyhow::bail!("Session '{}' not found", id);
    }
    store.purge(&id)?;
    writeln!(out, "Purged session {}", id)?;
    Ok(())
}
