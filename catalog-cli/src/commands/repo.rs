//! `catalog repo add|list|remove`

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use catalog_core::{
    config, registry,
    types::{ClusterRepo, ConditionType, Namespace, RepoName, RepoSpec, SecretReference, SourceLocation},
    FileStore,
};
use catalog_sync::staleness::{self, format_datetime_age};

use super::home;

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Register a repository.
    Add(AddArgs),

    /// List repositories with their last sync and whether a refresh is due.
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a repository, its status and every published chunk.
    Remove {
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Repository name (lowercase letters, digits, '-' and '.').
    pub name: String,

    /// Git URL to clone.
    #[arg(long, conflicts_with = "http")]
    pub git: Option<String>,

    /// Branch to track for a git source.
    #[arg(long, default_value = "master", requires = "git")]
    pub branch: String,

    /// Base URL of a server that hosts `index.yaml`.
    #[arg(long)]
    pub http: Option<String>,

    /// Make the repository namespaced. Its chunks are stored there.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Skip TLS certificate verification.
    #[arg(long)]
    pub insecure: bool,

    /// PEM file with extra CA certificates to trust.
    #[arg(long, value_name = "FILE")]
    pub ca_bundle: Option<PathBuf>,

    /// Name of the credentials document under `~/.catalog/secrets/`.
    #[arg(long)]
    pub secret: Option<String>,

    /// Send credentials on redirects to other hosts.
    #[arg(long)]
    pub disable_same_origin_check: bool,
}

pub fn run(cmd: RepoCommand) -> Result<()> {
    match cmd {
        RepoCommand::Add(args) => add(args),
        RepoCommand::List { json } => list(json),
        RepoCommand::Remove { name } => remove(&name),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = home()?;

    let source = match (args.git, args.http) {
        (Some(url), None) => SourceLocation::Git {
            url,
            branch: args.branch,
        },
        (None, Some(url)) => SourceLocation::Http { url },
        (None, None) => SourceLocation::None,
        (Some(_), Some(_)) => bail!("--git and --http are mutually exclusive"),
    };

    let mut spec = RepoSpec {
        source,
        disable_same_origin_check: args.disable_same_origin_check,
        client_secret: args.secret.map(|name| SecretReference {
            name,
            namespace: None,
        }),
        ..RepoSpec::default()
    };
    spec.tls.insecure_skip_tls_verify = args.insecure;
    if let Some(path) = &args.ca_bundle {
        let pem = fs::read_to_string(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
        spec.tls.ca_bundle = Some(pem);
    }

    let mut repo = ClusterRepo::new(args.name.as_str(), spec);
    if let Some(namespace) = args.namespace {
        repo.metadata.namespace = Namespace::from(namespace);
    }

    registry::add_repo_at(&home, &repo)
        .with_context(|| format!("failed to add repository '{}'", args.name))?;
    println!("✓ Added '{}' ({})", repo.metadata.name, repo.spec.source);
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RepoRow {
    name: String,
    namespace: String,
    source: String,
    commit: String,
    last_download_at: Option<String>,
    last_download_age: String,
    /// `None` when the status is fresh.
    refresh_reason: Option<String>,
    healthy: Option<bool>,
    message: String,
}

#[derive(Tabled)]
struct RepoTableRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "commit")]
    commit: String,
    #[tabled(rename = "last download")]
    last_download: String,
    #[tabled(rename = "state")]
    state: String,
}

fn list(json: bool) -> Result<()> {
    let home = home()?;
    let settings = config::load_at(&home).context("failed to load settings")?;
    let repos = registry::list_repos_at(&home).context("failed to load repositories")?;
    let now = Utc::now();

    let mut rows = Vec::with_capacity(repos.len());
    for repo in &repos {
        let status = registry::load_status_at(&home, repo.name())
            .with_context(|| format!("failed to load status for '{}'", repo.name()))?;
        let reason = staleness::check(&repo.spec, &status, now, settings.refresh_interval());
        let condition = status.condition(ConditionType::Downloaded);

        rows.push(RepoRow {
            name: repo.metadata.name.0.clone(),
            namespace: repo.metadata.namespace.0.clone(),
            source: repo.spec.source.to_string(),
            commit: status.commit.clone(),
            last_download_at: status.download_time.map(|at| at.to_rfc3339()),
            last_download_age: status
                .download_time
                .map(format_datetime_age)
                .unwrap_or_else(|| "never".to_string()),
            refresh_reason: reason.map(|r| r.to_string()),
            healthy: condition.map(|c| c.status),
            message: condition.map(|c| c.message.clone()).unwrap_or_default(),
        });
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("failed to serialize repository list")?
        );
        return Ok(());
    }

    if rows.is_empty() {
        println!("No repositories registered.");
        println!("Run: catalog repo add <name> --git <url>");
        return Ok(());
    }

    let table_rows: Vec<RepoTableRow> = rows.into_iter().map(table_row).collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn table_row(row: RepoRow) -> RepoTableRow {
    let state = match (row.healthy, &row.refresh_reason) {
        (Some(false), _) => format!("{} {}", "■".red().bold(), row.message),
        (_, Some(reason)) => format!("{} {reason}", "■".yellow().bold()),
        (_, None) => format!("{} current", "■".green().bold()),
    };
    let name = if row.namespace.is_empty() {
        row.name
    } else {
        format!("{}/{}", row.namespace, row.name)
    };
    RepoTableRow {
        name,
        source: row.source,
        commit: row.commit.chars().take(12).collect(),
        last_download: row.last_download_age,
        state,
    }
}

// ---------------------------------------------------------------------------
// remove
// ---------------------------------------------------------------------------

fn remove(name: &str) -> Result<()> {
    let home = home()?;
    let repo = registry::remove_repo_at(&home, &RepoName::from(name))
        .with_context(|| format!("failed to remove repository '{name}'"))?;
    let removed = FileStore::at(&home)
        .remove_owned(&repo.metadata.uid)
        .with_context(|| format!("failed to remove chunks owned by '{name}'"))?;
    println!("✓ Removed '{name}' ({removed} chunk(s) deleted)");
    Ok(())
}
