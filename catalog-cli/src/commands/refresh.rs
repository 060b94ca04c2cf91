//! `catalog refresh <name>`: stamp a forced-refresh request on the descriptor.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;

use catalog_core::{registry, types::RepoName};

use super::home;

#[derive(Args, Debug)]
pub struct RefreshArgs {
    pub name: String,
}

impl RefreshArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let requested = Utc::now();
        let repo = registry::update_spec_at(&home, &RepoName::from(self.name.as_str()), |spec| {
            spec.force_update = Some(requested);
        })
        .with_context(|| format!("failed to request refresh for '{}'", self.name))?;

        println!(
            "✓ Refresh requested for '{}' at {} (generation {})",
            repo.metadata.name,
            requested.to_rfc3339(),
            repo.metadata.generation
        );
        Ok(())
    }
}
