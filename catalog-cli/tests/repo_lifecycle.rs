use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use catalog_core::{
    registry,
    types::{ConditionType, RepoName, SourceLocation},
};

fn catalog_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("catalog"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

#[test]
fn add_list_refresh_remove() {
    let home = TempDir::new().expect("home");

    catalog_cmd(home.path())
        .args(["repo", "add", "charts", "--git", "https://git.invalid/charts.git", "--branch", "main"])
        .assert()
        .success()
        .stdout(contains("Added 'charts'"));

    let repo = registry::load_repo_at(home.path(), &RepoName::from("charts")).expect("descriptor");
    assert_eq!(
        repo.spec.source,
        SourceLocation::Git {
            url: "https://git.invalid/charts.git".into(),
            branch: "main".into(),
        }
    );
    assert_eq!(repo.metadata.generation, 1);

    catalog_cmd(home.path())
        .args(["repo", "add", "charts", "--http", "https://charts.invalid"])
        .assert()
        .failure()
        .stderr(contains("already exists"));

    let output = catalog_cmd(home.path())
        .args(["repo", "list", "--json"])
        .output()
        .expect("list");
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(rows[0]["name"], "charts");
    assert_eq!(rows[0]["last_download_age"], "never");
    assert!(rows[0]["refresh_reason"]
        .as_str()
        .unwrap()
        .starts_with("branch changed"));

    catalog_cmd(home.path())
        .args(["refresh", "charts"])
        .assert()
        .success()
        .stdout(contains("generation 2"));
    let repo = registry::load_repo_at(home.path(), &RepoName::from("charts")).unwrap();
    assert!(repo.spec.force_update.is_some());

    catalog_cmd(home.path())
        .args(["repo", "remove", "charts"])
        .assert()
        .success()
        .stdout(contains("Removed 'charts'"));
    assert!(registry::list_repos_at(home.path()).unwrap().is_empty());
}

#[test]
fn add_reads_ca_bundle_and_namespace() {
    let home = TempDir::new().expect("home");
    let pem = home.path().join("ca.pem");
    fs::write(&pem, "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").unwrap();

    catalog_cmd(home.path())
        .args(["repo", "add", "internal", "--http", "https://charts.corp.invalid"])
        .args(["--namespace", "team-a", "--secret", "corp-creds", "--ca-bundle"])
        .arg(&pem)
        .assert()
        .success();

    let repo = registry::load_repo_at(home.path(), &RepoName::from("internal")).unwrap();
    assert_eq!(repo.metadata.namespace.as_str(), "team-a");
    assert_eq!(repo.spec.client_secret.unwrap().name, "corp-creds");
    assert!(repo.spec.tls.ca_bundle.unwrap().contains("BEGIN CERTIFICATE"));
    assert!(!repo.spec.tls.insecure_skip_tls_verify);
}

#[test]
fn git_and_http_are_exclusive() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["repo", "add", "both", "--git", "https://a.invalid", "--http", "https://b.invalid"])
        .assert()
        .failure();
    assert!(registry::list_repos_at(home.path()).unwrap().is_empty());
}

#[test]
fn empty_registry_lists_nothing() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["repo", "list"])
        .assert()
        .success()
        .stdout(contains("No repositories registered."));
}

#[test]
fn reconcile_none_source_records_condition() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["repo", "add", "placeholder"])
        .assert()
        .success();

    catalog_cmd(home.path())
        .args(["reconcile", "placeholder"])
        .assert()
        .success()
        .stdout(contains("'placeholder' [leader]"));

    let status = registry::load_status_at(home.path(), &RepoName::from("placeholder")).unwrap();
    assert_eq!(status.observed_generation, 1);
    assert!(status.condition(ConditionType::Downloaded).unwrap().status);

    catalog_cmd(home.path())
        .args(["reconcile", "--all"])
        .assert()
        .success()
        .stdout(contains("up to date"));
}

#[test]
fn reconcile_unknown_repo_fails() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["reconcile", "ghost"])
        .assert()
        .failure()
        .stderr(contains("reconcile failed for 'ghost'"));
}

#[test]
fn index_show_without_published_index_fails() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["repo", "add", "placeholder"])
        .assert()
        .success();

    catalog_cmd(home.path())
        .args(["index", "show", "placeholder"])
        .assert()
        .failure()
        .stderr(contains("no published index yet"));
}

#[test]
fn daemon_status_reports_not_running() {
    let home = TempDir::new().expect("home");
    catalog_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    catalog_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running").and(contains("requested").not()));
}
