//! Catalog: keep chart repository indexes in sync.
//!
//! # Usage
//!
//! ```text
//! catalog repo add <name> (--git <url> [--branch <b>] | --http <url>) [--namespace <ns>]
//!                  [--insecure] [--ca-bundle <file>] [--secret <name>] [--disable-same-origin-check]
//! catalog repo list [--json]
//! catalog repo remove <name>
//! catalog refresh <name>
//! catalog reconcile <name> [--follower]
//! catalog reconcile --all [--follower]
//! catalog index show <name> [--json]
//! catalog daemon start [--follower] | stop | status | reconcile [<name>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, index::IndexCommand, reconcile::ReconcileArgs, refresh::RefreshArgs,
    repo::RepoCommand,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "catalog",
    version,
    about = "Download chart repository indexes and publish them as chunked objects",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register, list and remove repositories.
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Request a refresh on the next reconcile, regardless of the interval.
    Refresh(RefreshArgs),

    /// Run one reconcile pass in the foreground.
    Reconcile(ReconcileArgs),

    /// Inspect published indexes.
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },

    /// Run or talk to the background reconcile daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Repo { command } => commands::repo::run(command),
        Commands::Refresh(args) => args.run(),
        Commands::Reconcile(args) => args.run(),
        Commands::Index { command } => commands::index::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
