//! `catalog index show <name>`: reassemble a published chunk chain.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use catalog_core::{registry, types::RepoName, FileStore};
use catalog_sync::chunker;

use super::home;

#[derive(Subcommand, Debug)]
pub enum IndexCommand {
    /// Print the chart versions of a repository's published index.
    Show {
        name: String,

        /// Emit the full index document as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct ChartRow {
    #[tabled(rename = "chart")]
    chart: String,
    #[tabled(rename = "latest")]
    latest: String,
    #[tabled(rename = "versions")]
    versions: usize,
}

pub fn run(cmd: IndexCommand) -> Result<()> {
    match cmd {
        IndexCommand::Show { name, json } => show(&name, json),
    }
}

fn show(name: &str, json: bool) -> Result<()> {
    let home = home()?;
    let status = registry::load_status_at(&home, &RepoName::from(name))
        .with_context(|| format!("failed to load status for '{name}'"))?;
    let root = status.index.with_context(|| {
        format!("'{name}' has no published index yet; run `catalog reconcile {name}`")
    })?;

    let store = FileStore::at(&home);
    let document = chunker::read_chain(&store, &root)
        .with_context(|| format!("failed to read index chain for '{name}'"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&document).context("failed to serialize index")?
        );
        return Ok(());
    }

    println!(
        "{} {}/{} | {} charts | {} versions",
        name.bold(),
        root.namespace,
        root.name,
        document.entries.len(),
        document.version_count(),
    );
    let rows: Vec<ChartRow> = document
        .entries
        .iter()
        .map(|(chart, versions)| ChartRow {
            chart: chart.clone(),
            latest: versions
                .first()
                .map(|v| v.version.clone())
                .unwrap_or_default(),
            versions: versions.len(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
