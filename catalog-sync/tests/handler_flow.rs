use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use catalog_core::{
    registry,
    types::{
        ChartVersion, ClusterRepo, ConditionType, IndexDocument, Namespace, ObjectRef,
        OwnerReference, RepoName, RepoSpec, RepoStatus, SecretReference, SourceLocation,
        TlsPolicy,
    },
    Credentials, FileStore, ObjectStore, SecretLookup, Settings, StoreError, StoredObject,
};
use catalog_sync::{
    chunker, reconcile_at, GitProvider, GitRepository, IndexFetcher, RepoHandler, Requeue, Role,
    SyncError,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GitState {
    commit: String,
    index: Option<IndexDocument>,
    opened: Vec<String>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeGit(Arc<Mutex<GitState>>);

impl FakeGit {
    fn set(&self, commit: &str, index: Option<IndexDocument>) {
        let mut state = self.0.lock().unwrap();
        state.commit = commit.to_string();
        state.index = index;
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    fn opened(&self) -> Vec<String> {
        self.0.lock().unwrap().opened.clone()
    }

    fn clear(&self) {
        let mut state = self.0.lock().unwrap();
        state.calls.clear();
        state.opened.clear();
    }
}

impl GitProvider for FakeGit {
    fn open(
        &self,
        _credentials: Option<&Credentials>,
        _namespace: &Namespace,
        _name: &RepoName,
        url: &str,
        _tls: &TlsPolicy,
    ) -> Result<Box<dyn GitRepository>, SyncError> {
        self.0.lock().unwrap().opened.push(url.to_string());
        Ok(Box::new(self.clone()))
    }
}

impl GitRepository for FakeGit {
    fn head(&self, branch: &str) -> Result<String, SyncError> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(format!("head {branch}"));
        Ok(state.commit.clone())
    }

    fn check_update(&self, branch: &str, baseline: &str) -> Result<String, SyncError> {
        let mut state = self.0.lock().unwrap();
        state.calls.push(format!("check_update {branch} {baseline}"));
        Ok(state.commit.clone())
    }

    fn ensure(&self, branch: &str) -> Result<(), SyncError> {
        self.0.lock().unwrap().calls.push(format!("ensure {branch}"));
        Ok(())
    }

    fn build_or_get_index(&self) -> Result<Option<IndexDocument>, SyncError> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("build".to_string());
        Ok(state.index.clone())
    }
}

#[derive(Default)]
struct FakeHttp {
    documents: Mutex<HashMap<String, IndexDocument>>,
    fail: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl IndexFetcher for FakeHttp {
    fn download_index(
        &self,
        _credentials: Option<&Credentials>,
        url: &str,
        _tls: &TlsPolicy,
        _disable_same_origin_check: bool,
    ) -> Result<Option<IndexDocument>, SyncError> {
        self.calls.lock().unwrap().push(url.to_string());
        if *self.fail.lock().unwrap() {
            return Err(SyncError::Http {
                url: url.to_string(),
                message: "503 Service Unavailable".to_string(),
            });
        }
        Ok(self.documents.lock().unwrap().get(url).cloned())
    }
}

struct FakeSecrets;

impl SecretLookup for FakeSecrets {
    fn get_secret(
        &self,
        namespace: &Namespace,
        spec: &RepoSpec,
    ) -> Result<Option<Credentials>, StoreError> {
        match &spec.client_secret {
            None => Ok(None),
            Some(reference) => Err(StoreError::SecretNotFound {
                namespace: namespace.to_string(),
                name: reference.name.clone(),
                path: "/nowhere".into(),
            }),
        }
    }
}

/// Store whose writes always fail, as when the object backend is unavailable.
struct FailingStore;

impl ObjectStore for FailingStore {
    fn get(&self, _namespace: &Namespace, _name: &str) -> Result<Option<StoredObject>, StoreError> {
        Ok(None)
    }

    fn apply_owned(
        &self,
        _owner: &OwnerReference,
        namespace: &Namespace,
        _objects: Vec<StoredObject>,
    ) -> Result<Vec<ObjectRef>, StoreError> {
        Err(StoreError::Io {
            path: format!("/objects/{namespace}").into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}

#[derive(Default)]
struct RecordingRequeue(Mutex<Vec<(RepoName, Duration)>>);

impl Requeue for RecordingRequeue {
    fn enqueue_after(&self, name: &RepoName, after: Duration) {
        self.0.lock().unwrap().push((name.clone(), after));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    store: Arc<FileStore>,
    git: FakeGit,
    http: Arc<FakeHttp>,
    requeue: Arc<RecordingRequeue>,
    handler: RepoHandler,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("objects")));
    let git = FakeGit::default();
    let http = Arc::new(FakeHttp::default());
    let requeue = Arc::new(RecordingRequeue::default());
    let settings = Settings {
        max_chunk_size: 200,
        ..Settings::default()
    };
    let handler = RepoHandler::new(
        settings,
        store.clone(),
        Arc::new(FakeSecrets),
        Arc::new(git.clone()),
        http.clone(),
        requeue.clone(),
    );
    Harness {
        _dir: dir,
        store,
        git,
        http,
        requeue,
        handler,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

fn index(names: &[&str], version: &str) -> IndexDocument {
    let mut doc = IndexDocument::default();
    for name in names {
        doc.entries.insert(
            name.to_string(),
            vec![ChartVersion {
                name: name.to_string(),
                version: version.to_string(),
                app_version: None,
                description: Some(format!("the {name} chart, packaged for the catalog")),
                digest: None,
                urls: vec![format!("https://charts.example.com/{name}-{version}.tgz")],
                extra: BTreeMap::new(),
            }],
        );
    }
    doc
}

fn git_repo(name: &str, branch: &str) -> ClusterRepo {
    ClusterRepo::new(
        name,
        RepoSpec {
            source: SourceLocation::Git {
                url: "https://git.example.com/charts".into(),
                branch: branch.into(),
            },
            ..RepoSpec::default()
        },
    )
}

fn http_repo(name: &str, url: &str) -> ClusterRepo {
    ClusterRepo::new(
        name,
        RepoSpec {
            source: SourceLocation::Http { url: url.into() },
            ..RepoSpec::default()
        },
    )
}

// ---------------------------------------------------------------------------
// Leader path
// ---------------------------------------------------------------------------

#[test]
fn first_git_download_clones_and_publishes() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis", "nginx"], "1.0.0")));

    let status = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();

    assert_eq!(h.git.calls(), ["head main", "build"]);
    assert_eq!(status.url, "https://git.example.com/charts");
    assert_eq!(status.branch, "main");
    assert_eq!(status.commit, "c1");
    assert_eq!(status.download_time, Some(t0()));
    assert_eq!(status.observed_generation, 1);

    let root = status.index.expect("index root");
    assert_eq!(root.namespace, Namespace::from("catalog-system"));
    let read = chunker::read_chain(h.store.as_ref(), &root).unwrap();
    assert_eq!(read, index(&["nginx", "redis"], "1.0.0"));

    let requeued = h.requeue.0.lock().unwrap().clone();
    assert_eq!(requeued, [(RepoName::from("charts"), Duration::from_secs(300))]);
}

#[test]
fn unchanged_commit_only_advances_download_time() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();
    h.git.clear();

    let later = t0() + minutes(10);
    let second = h
        .handler
        .download_status_at(&repo, first.clone(), later)
        .unwrap();

    assert_eq!(h.git.calls(), ["check_update main external"]);
    assert_eq!(second.index, first.index);
    assert_eq!(second.commit, first.commit);
    assert_eq!(second.download_time, Some(later));
}

#[test]
fn moved_commit_republishes_with_a_new_revision() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();

    h.git.set("c2", Some(index(&["redis"], "1.1.0")));
    let second = h
        .handler
        .download_status_at(&repo, first.clone(), t0() + minutes(10))
        .unwrap();

    assert_eq!(second.commit, "c2");
    let (a, b) = (first.index.unwrap(), second.index.unwrap());
    assert_eq!(a.name, b.name);
    assert_ne!(a.revision, b.revision);
    let read = chunker::read_chain(h.store.as_ref(), &b).unwrap();
    assert_eq!(read.entries["redis"][0].version, "1.1.0");
}

#[test]
fn identical_content_keeps_revision_across_rebuilds() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis", "nginx"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();

    // Commit moves but the built index is byte-identical.
    h.git.set("c2", Some(index(&["nginx", "redis"], "1.0.0")));
    let second = h
        .handler
        .download_status_at(&repo, first.clone(), t0() + minutes(10))
        .unwrap();
    assert_eq!(second.index, first.index);
}

#[test]
fn fresh_status_is_returned_untouched() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();
    h.git.clear();

    let again = h
        .handler
        .download_status_at(&repo, first.clone(), t0() + minutes(1))
        .unwrap();
    assert_eq!(again, first);
    assert!(h.git.calls().is_empty());
    assert_eq!(h.requeue.0.lock().unwrap().len(), 2);
}

#[test]
fn branch_switch_refetches_on_new_branch() {
    let h = harness();
    let base = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&base, RepoStatus::default(), t0())
        .unwrap();
    h.git.clear();

    let mut repo = base.clone();
    repo.spec.source = SourceLocation::Git {
        url: "https://git.example.com/charts".into(),
        branch: "release".into(),
    };
    repo.metadata.generation = 2;
    h.git.set("c9", Some(index(&["redis"], "2.0.0")));
    let second = h
        .handler
        .download_status_at(&repo, first, t0() + minutes(1))
        .unwrap();

    assert_eq!(h.git.calls(), ["check_update release external", "build"]);
    assert_eq!(second.branch, "release");
    assert_eq!(second.commit, "c9");
    assert_eq!(second.observed_generation, 2);
}

#[test]
fn http_url_switch_refetches_and_republishes() {
    let h = harness();
    h.http
        .documents
        .lock()
        .unwrap()
        .insert("https://a.example.com".into(), index(&["redis"], "1.0.0"));
    h.http
        .documents
        .lock()
        .unwrap()
        .insert("https://b.example.com".into(), index(&["nginx"], "3.0.0"));

    let repo_a = http_repo("web", "https://a.example.com");
    let mut status = RepoStatus {
        branch: "leftover".into(),
        ..RepoStatus::default()
    };
    status = h.handler.download_status_at(&repo_a, status, t0()).unwrap();
    assert_eq!(status.url, "https://a.example.com");
    assert!(status.branch.is_empty());
    assert!(status.commit.is_empty());

    let repo_b = ClusterRepo {
        spec: http_repo("web", "https://b.example.com").spec,
        ..repo_a
    };
    let status = h
        .handler
        .download_status_at(&repo_b, status, t0() + minutes(1))
        .unwrap();

    assert_eq!(
        *h.http.calls.lock().unwrap(),
        ["https://a.example.com", "https://b.example.com"]
    );
    assert_eq!(status.url, "https://b.example.com");
    let read = chunker::read_chain(h.store.as_ref(), status.index.as_ref().unwrap()).unwrap();
    assert!(read.entries.contains_key("nginx"));
    assert!(!read.entries.contains_key("redis"));
}

#[test]
fn empty_remote_is_a_successful_no_op() {
    let h = harness();
    let repo = http_repo("web", "https://empty.example.com");
    let status = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();
    assert_eq!(status.url, "https://empty.example.com");
    assert!(status.index.is_none());
    assert!(status.download_time.is_none());
}

#[test]
fn none_source_is_a_successful_no_op() {
    let h = harness();
    let repo = ClusterRepo::new("nothing", RepoSpec::default());
    let status = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();
    assert!(status.index.is_none());
    assert!(status.url.is_empty());
    assert!(h.git.opened().is_empty());
    assert!(h.http.calls.lock().unwrap().is_empty());
}

#[test]
fn fetch_error_propagates_and_still_requeues() {
    let h = harness();
    *h.http.fail.lock().unwrap() = true;
    let repo = http_repo("web", "https://a.example.com");
    let err = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap_err();
    assert!(matches!(err, SyncError::Http { .. }));
    assert_eq!(h.requeue.0.lock().unwrap().len(), 1);
}

fn failing_store_handler(git: &FakeGit) -> RepoHandler {
    RepoHandler::new(
        Settings {
            max_chunk_size: 200,
            ..Settings::default()
        },
        Arc::new(FailingStore),
        Arc::new(FakeSecrets),
        Arc::new(git.clone()),
        Arc::new(FakeHttp::default()),
        Arc::new(RecordingRequeue::default()),
    )
}

#[test]
fn publish_failure_propagates() {
    let _ = env_logger::builder().is_test(true).try_init();
    let git = FakeGit::default();
    git.set("c1", Some(index(&["redis"], "1.0.0")));
    let handler = failing_store_handler(&git);

    let err = handler
        .download_status_at(&git_repo("charts", "main"), RepoStatus::default(), t0())
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Io { .. })), "{err}");
}

#[test]
fn publish_failure_records_only_the_failed_condition() {
    let _ = env_logger::builder().is_test(true).try_init();
    let home = TempDir::new().unwrap();
    let repo = git_repo("charts", "main");
    registry::add_repo_at(home.path(), &repo).unwrap();
    let git = FakeGit::default();
    git.set("c1", Some(index(&["redis"], "1.0.0")));
    let handler = failing_store_handler(&git);

    let err = reconcile_at(home.path(), &handler, repo.name(), Role::Leader).unwrap_err();
    assert!(matches!(err, SyncError::Store(_)), "{err}");

    let status = registry::load_status_at(home.path(), repo.name()).unwrap();
    assert_eq!(status.commit, "");
    assert_eq!(status.download_time, None);
    assert_eq!(status.index, None);
    let condition = status.condition(ConditionType::Downloaded).expect("condition");
    assert!(!condition.status);
    assert!(condition.message.contains("read-only"), "{}", condition.message);
}

#[test]
fn credential_failure_propagates() {
    let h = harness();
    let mut repo = git_repo("private", "main");
    repo.spec.client_secret = Some(SecretReference {
        name: "missing".into(),
        namespace: None,
    });
    let err = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::SecretNotFound { .. })));
    assert!(h.git.opened().is_empty());
}

// ---------------------------------------------------------------------------
// Index self-check
// ---------------------------------------------------------------------------

#[test]
fn dangling_root_is_cleared_then_rebuilt_as_first_clone() {
    let h = harness();
    let repo = git_repo("charts", "main");
    h.git.set("c1", Some(index(&["redis"], "1.0.0")));
    let first = h
        .handler
        .download_status_at(&repo, RepoStatus::default(), t0())
        .unwrap();

    h.store.remove_owned(&repo.metadata.uid).unwrap();

    let mut healed = first.clone();
    h.handler.ensure_index_object(&repo, &mut healed).unwrap();
    assert!(healed.index.is_none());
    assert_eq!(healed.commit, first.commit);

    h.git.clear();
    let rebuilt = h
        .handler
        .download_status_at(&repo, first, t0() + minutes(1))
        .unwrap();
    assert_eq!(h.git.calls(), ["head main", "build"]);
    let root = rebuilt.index.unwrap();
    assert!(h.store.get(&root.namespace, &root.name).unwrap().is_some());
}

#[test]
fn self_check_ignores_http_sources() {
    let h = harness();
    let repo = http_repo("web", "https://a.example.com");
    let mut status = RepoStatus {
        index: Some(catalog_core::types::ObjectRef {
            name: "web-0-gone".into(),
            namespace: Namespace::from("catalog-system"),
            revision: "r".into(),
        }),
        ..RepoStatus::default()
    };
    h.handler.ensure_index_object(&repo, &mut status).unwrap();
    assert!(status.index.is_some());
}

// ---------------------------------------------------------------------------
// Follower path
// ---------------------------------------------------------------------------

#[test]
fn follower_waits_until_the_declared_branch_is_recorded() {
    let h = harness();
    let repo = git_repo("charts", "main");

    let untouched = h
        .handler
        .ensure_status(&repo, RepoStatus::default())
        .unwrap();
    assert_eq!(untouched, RepoStatus::default());

    let behind = RepoStatus {
        branch: "old".into(),
        url: "https://git.example.com/charts".into(),
        ..RepoStatus::default()
    };
    assert_eq!(h.handler.ensure_status(&repo, behind.clone()).unwrap(), behind);
    assert!(h.git.opened().is_empty());
    assert_eq!(h.requeue.0.lock().unwrap().len(), 2);
}

#[test]
fn follower_ensures_working_copy_at_recorded_url() {
    let h = harness();
    let repo = git_repo("charts", "main");
    let status = RepoStatus {
        branch: "main".into(),
        url: "https://mirror.example.com/charts".into(),
        ..RepoStatus::default()
    };

    let after = h.handler.ensure_status(&repo, status.clone()).unwrap();
    assert_eq!(h.git.opened(), ["https://mirror.example.com/charts"]);
    assert_eq!(h.git.calls(), ["ensure main"]);
    assert_eq!(after.observed_generation, 1);
    assert_eq!(after.index, status.index);
}

#[test]
fn follower_does_nothing_for_http_sources() {
    let h = harness();
    let repo = http_repo("web", "https://a.example.com");
    let status = RepoStatus {
        url: "https://a.example.com".into(),
        ..RepoStatus::default()
    };
    assert_eq!(h.handler.ensure_status(&repo, status.clone()).unwrap(), status);
    assert!(h.git.opened().is_empty());
}

#[test]
fn follower_propagates_credential_failure() {
    let h = harness();
    let mut repo = git_repo("private", "main");
    repo.spec.client_secret = Some(SecretReference {
        name: "missing".into(),
        namespace: Some("team".into()),
    });
    let status = RepoStatus {
        branch: "main".into(),
        url: "https://git.example.com/charts".into(),
        ..RepoStatus::default()
    };
    assert!(h.handler.ensure_status(&repo, status).is_err());
}
