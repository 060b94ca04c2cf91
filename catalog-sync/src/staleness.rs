//! Refresh decision for the leader path.
//!
//! Trigger precedence (first match wins):
//! 1. `BranchChanged` (git source, recorded branch differs from the declared one)
//! 2. `UrlChanged` (http source, recorded url differs)
//! 3. `UrlChanged` (git source, recorded url differs)
//! 4. `NoIndex` (no chunk-chain root recorded)
//! 5. `ForcedRefresh` (forced timestamp after the last download and already in the past)
//! 6. `Expired` (last download older than the refresh interval)
//!
//! Nothing here touches the filesystem; the clock and the interval are
//! parameters so callers and tests control them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use catalog_core::types::{RepoSpec, RepoStatus, SourceLocation};

/// Why a repository needs a fresh download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReason {
    BranchChanged { from: String, to: String },
    UrlChanged { from: String, to: String },
    NoIndex,
    ForcedRefresh { requested: DateTime<Utc> },
    Expired { last_download: Option<DateTime<Utc>> },
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshReason::BranchChanged { from, to } => {
                write!(f, "branch changed ({} -> {to})", or_unset(from))
            }
            RefreshReason::UrlChanged { from, to } => {
                write!(f, "url changed ({} -> {to})", or_unset(from))
            }
            RefreshReason::NoIndex => write!(f, "no index published"),
            RefreshReason::ForcedRefresh { requested } => {
                write!(f, "refresh requested {} ago", format_datetime_age(*requested))
            }
            RefreshReason::Expired {
                last_download: Some(at),
            } => write!(f, "last download {} ago", format_datetime_age(*at)),
            RefreshReason::Expired { last_download: None } => write!(f, "never downloaded"),
        }
    }
}

fn or_unset(value: &str) -> &str {
    if value.is_empty() {
        "<unset>"
    } else {
        value
    }
}

/// Evaluate the refresh triggers in order and return the first that fires.
pub fn check(
    spec: &RepoSpec,
    status: &RepoStatus,
    now: DateTime<Utc>,
    interval: Duration,
) -> Option<RefreshReason> {
    match &spec.source {
        SourceLocation::Git { branch, .. } if status.branch != *branch => {
            return Some(RefreshReason::BranchChanged {
                from: status.branch.clone(),
                to: branch.clone(),
            });
        }
        SourceLocation::Http { url } | SourceLocation::Git { url, .. } if status.url != *url => {
            return Some(RefreshReason::UrlChanged {
                from: status.url.clone(),
                to: url.clone(),
            });
        }
        _ => {}
    }

    if status.index.is_none() {
        return Some(RefreshReason::NoIndex);
    }

    // A missing download time compares as the earliest instant.
    let last = status.download_time.unwrap_or(DateTime::<Utc>::MIN_UTC);

    if let Some(forced) = spec.force_update {
        if forced > last && forced < now {
            return Some(RefreshReason::ForcedRefresh { requested: forced });
        }
    }

    let expired = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .is_some_and(|threshold| threshold > last);
    if expired {
        return Some(RefreshReason::Expired {
            last_download: status.download_time,
        });
    }

    None
}

/// `true` when any refresh trigger fires.
pub fn should_refresh(
    spec: &RepoSpec,
    status: &RepoStatus,
    now: DateTime<Utc>,
    interval: Duration,
) -> bool {
    check(spec, status, now, interval).is_some()
}

/// Format age from a chrono timestamp (`download_time`, `force_update`).
pub fn format_datetime_age(timestamp: DateTime<Utc>) -> String {
    let now = Utc::now();
    let age = now.signed_duration_since(timestamp).num_seconds().max(0) as u64;
    format_seconds(age)
}

fn format_seconds(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
