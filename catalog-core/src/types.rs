//! Domain types for catalog repositories.
//!
//! A [`ClusterRepo`] pairs its identity ([`ObjectMeta`]) with user-owned
//! desired state ([`RepoSpec`]). [`RepoStatus`] is owned by the controller
//! and persisted separately. All types are serializable via serde + serde_yaml.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `apiVersion` recorded on owner references of generated objects.
pub const API_VERSION: &str = "catalog.io/v1";
/// `kind` recorded on owner references of generated objects.
pub const KIND: &str = "ClusterRepo";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a repository resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoName(pub String);

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepoName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepoName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Namespace of a resource. Empty for cluster-scoped resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique identifier assigned to a repository resource when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub String);

impl Uid {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

/// Where the catalog index comes from. Exactly one kind is populated;
/// `None` is a valid no-op source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceLocation {
    /// A version-controlled tree checked out at `branch`.
    Git { url: String, branch: String },
    /// A plain HTTP(S) server hosting `index.yaml`.
    Http { url: String },
    #[default]
    None,
}

impl SourceLocation {
    pub fn url(&self) -> Option<&str> {
        match self {
            SourceLocation::Git { url, .. } | SourceLocation::Http { url } => Some(url),
            SourceLocation::None => None,
        }
    }

    /// Declared branch; only git sources are branch-scoped.
    pub fn branch(&self) -> Option<&str> {
        match self {
            SourceLocation::Git { branch, .. } => Some(branch),
            _ => None,
        }
    }

    pub fn is_git(&self) -> bool {
        matches!(self, SourceLocation::Git { .. })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Git { url, branch } => write!(f, "git {url}@{branch}"),
            SourceLocation::Http { url } => write!(f, "http {url}"),
            SourceLocation::None => write!(f, "none"),
        }
    }
}

/// TLS verification policy applied to both git and http fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsPolicy {
    pub insecure_skip_tls_verify: bool,
    /// Extra PEM-encoded CA certificates to trust.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Reference to a credentials document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Desired state of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepoSpec {
    #[serde(default)]
    pub source: SourceLocation,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default)]
    pub disable_same_origin_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretReference>,
    /// Set to request a refresh regardless of the regular interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_update: Option<DateTime<Utc>>,
}

/// Identity of a repository resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: RepoName,
    #[serde(default)]
    pub namespace: Namespace,
    pub uid: Uid,
    #[serde(default)]
    pub generation: i64,
}

/// A repository descriptor: identity plus desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRepo {
    pub metadata: ObjectMeta,
    pub spec: RepoSpec,
}

impl ClusterRepo {
    /// New cluster-scoped repository with a fresh uid at generation 1.
    pub fn new(name: impl Into<RepoName>, spec: RepoSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: Namespace::default(),
                uid: Uid::generate(),
                generation: 1,
            },
            spec,
        }
    }

    pub fn name(&self) -> &RepoName {
        &self.metadata.name
    }

    /// Owner reference stamped on every object generated for this repository.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.metadata.name.0.clone(),
            uid: self.metadata.uid.clone(),
        }
    }
}

/// Parent identity carried by generated objects; deleting the owner
/// cascades to every object that carries its uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
}

// ---------------------------------------------------------------------------
// Observed state
// ---------------------------------------------------------------------------

/// Identity of a stored object: name, namespace and revision token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub name: String,
    pub namespace: Namespace,
    pub revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// Leader path: the index was downloaded and published.
    Downloaded,
    /// Follower path: the local working copy is current.
    FollowerDownloaded,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Downloaded => write!(f, "Downloaded"),
            ConditionType::FollowerDownloaded => write!(f, "FollowerDownloaded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_update_time: DateTime<Utc>,
}

/// Last observed synchronization outcome for one repository.
///
/// `branch` is only ever set to the declared branch as the result of a
/// successful download; the follower path relies on that ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RepoStatus {
    pub url: String,
    pub branch: String,
    /// Last observed commit (git only, empty for http).
    pub commit: String,
    /// Root of the published chunk chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_time: Option<DateTime<Utc>>,
    pub observed_generation: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RepoStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Record a condition. The timestamp only moves when status or message
    /// change, so re-reporting the same outcome leaves the status equal.
    pub fn set_condition(
        &mut self,
        kind: ConditionType,
        status: bool,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status || existing.message != message {
                    existing.status = status;
                    existing.message = message;
                    existing.last_update_time = now;
                }
            }
            None => self.conditions.push(Condition {
                kind,
                status,
                message,
                last_update_time: now,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Index document
// ---------------------------------------------------------------------------

/// One released version of a catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Every other field of the remote entry, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Normalized catalog contents: entries keyed by name, each holding its
/// released versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

impl Default for IndexDocument {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            generated: None,
            entries: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl IndexDocument {
    /// Parse a YAML (or JSON) `index.yaml` document.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Total number of versions across all entries.
    pub fn version_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Order versions within every entry, newest first. Entry keys are
    /// already ordered by the map.
    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
        }
    }
}

/// Semantic versions newest first, then non-semver versions lexically.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| semver::Version::parse(v.trim_start_matches('v')).ok();
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn version(name: &str, v: &str) -> ChartVersion {
        ChartVersion {
            name: name.to_string(),
            version: v.to_string(),
            app_version: None,
            description: None,
            digest: None,
            urls: vec![],
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn newtype_display() {
        assert_eq!(RepoName::from("rancher-charts").to_string(), "rancher-charts");
        assert_eq!(Namespace::from("ns").to_string(), "ns");
        assert_eq!(Uid::from("abc").to_string(), "abc");
    }

    #[test]
    fn source_location_yaml_is_tagged_by_kind() {
        let spec = RepoSpec {
            source: SourceLocation::Git {
                url: "https://git.example.com/charts".into(),
                branch: "main".into(),
            },
            ..RepoSpec::default()
        };
        let yaml = serde_yaml::to_string(&spec).expect("serialize");
        assert!(yaml.contains("kind: git"), "got: {yaml}");

        let parsed: RepoSpec = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(parsed, spec);
    }

    #[test]
    fn missing_source_defaults_to_none() {
        let spec: RepoSpec = serde_yaml::from_str("disable_same_origin_check: true\n").unwrap();
        assert_eq!(spec.source, SourceLocation::None);
        assert!(spec.source.url().is_none());
    }

    #[test]
    fn sort_entries_orders_versions_newest_first() {
        let mut doc = IndexDocument::default();
        doc.entries.insert(
            "nginx".into(),
            vec![
                version("nginx", "1.2.0"),
                version("nginx", "latest"),
                version("nginx", "v1.10.0"),
                version("nginx", "1.9.3"),
            ],
        );
        doc.sort_entries();
        let order: Vec<_> = doc.entries["nginx"].iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, ["v1.10.0", "1.9.3", "1.2.0", "latest"]);
    }

    #[test]
    fn index_yaml_preserves_unknown_fields() {
        let yaml = br#"
apiVersion: v1
generated: "2024-01-01T00:00:00Z"
entries:
  redis:
    - name: redis
      version: 17.0.1
      appVersion: "7.0"
      icon: https://example.com/redis.png
      urls: [https://example.com/redis-17.0.1.tgz]
"#;
        let doc = IndexDocument::from_yaml(yaml).expect("parse");
        let redis = &doc.entries["redis"][0];
        assert_eq!(redis.app_version.as_deref(), Some("7.0"));
        assert_eq!(
            redis.extra.get("icon"),
            Some(&serde_json::Value::String("https://example.com/redis.png".into()))
        );
        assert_eq!(doc.version_count(), 1);
        assert!(!doc.is_empty());
    }

    #[test]
    fn set_condition_keeps_timestamp_when_unchanged() {
        let mut status = RepoStatus::default();
        let first = Utc::now();
        status.set_condition(ConditionType::Downloaded, true, "", first);
        let later = first + chrono::Duration::seconds(30);
        status.set_condition(ConditionType::Downloaded, true, "", later);
        assert_eq!(
            status.condition(ConditionType::Downloaded).unwrap().last_update_time,
            first
        );

        status.set_condition(ConditionType::Downloaded, false, "boom", later);
        let cond = status.condition(ConditionType::Downloaded).unwrap();
        assert!(!cond.status);
        assert_eq!(cond.last_update_time, later);
    }

    #[test]
    fn owner_reference_carries_uid() {
        let repo = ClusterRepo::new("charts", RepoSpec::default());
        let owner = repo.owner_reference();
        assert_eq!(owner.kind, KIND);
        assert_eq!(owner.name, "charts");
        assert_eq!(owner.uid, repo.metadata.uid);
        assert_eq!(repo.metadata.generation, 1);
    }
}
