//! `catalog reconcile`: run the leader or follower path once, in-process.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use catalog_core::{config, registry, types::RepoName};
use catalog_sync::{pipeline, NoRequeue, ReconcileOutcome, Role};

use super::home;

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Repository to reconcile (omit when using `--all`).
    pub name: Option<String>,

    /// Reconcile every registered repository.
    #[arg(long, conflicts_with = "name")]
    pub all: bool,

    /// Run the follower path (keep the local working copy current only).
    #[arg(long)]
    pub follower: bool,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let role = if self.follower {
            Role::Follower
        } else {
            Role::Leader
        };
        let settings = config::load_at(&home).context("failed to load settings")?;
        let handler = pipeline::default_handler(&home, settings, Arc::new(NoRequeue));

        let names: Vec<RepoName> = if self.all {
            registry::list_repos_at(&home)
                .context("failed to load repositories")?
                .into_iter()
                .map(|repo| repo.metadata.name)
                .collect()
        } else {
            let name = self
                .name
                .clone()
                .context("provide a repository name or use --all")?;
            vec![RepoName::from(name)]
        };

        if names.is_empty() {
            println!("No repositories registered. Run `catalog repo add` first.");
            return Ok(());
        }

        let mut failed = 0usize;
        for name in &names {
            match pipeline::reconcile_at(&home, &handler, name, role) {
                Ok(outcome) => print_outcome(&outcome),
                Err(err) if names.len() == 1 => {
                    return Err(err).with_context(|| format!("reconcile failed for '{name}'"));
                }
                Err(err) => {
                    failed += 1;
                    eprintln!("✗ '{name}': {err}");
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} of {} repositories failed to reconcile", names.len());
        }
        Ok(())
    }
}

fn print_outcome(outcome: &ReconcileOutcome) {
    let status = &outcome.status;
    if !outcome.changed {
        println!("✓ '{}' [{}] up to date", outcome.name, outcome.role);
        return;
    }
    match &status.index {
        Some(index) => println!(
            "✓ '{}' [{}] published {}/{} (commit {})",
            outcome.name,
            outcome.role,
            index.namespace,
            index.name,
            if status.commit.is_empty() { "-" } else { &status.commit },
        ),
        None => println!("✓ '{}' [{}] status updated", outcome.name, outcome.role),
    }
}
