use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::time::Instant;

use catalog_core::{config, registry, types::RepoName, StoreError};
use catalog_sync::{pipeline, ReconcileOutcome, RepoHandler, Requeue, Role, SyncError};

use crate::error::{io_err, DaemonError};
use crate::paths::{repos_root, run_dir, socket_path, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::queue::{retry_delay, WorkQueue};

/// Last run of each repository, keyed by name.
pub type RunLog = HashMap<String, RunRecord>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunRecord {
    pub last_run_unix: u64,
    pub ok: bool,
    /// Whether the run rewrote the persisted status.
    pub changed: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// How one reconcile ended, as seen by the processor.
#[derive(Debug)]
enum RunResult {
    Done(ReconcileOutcome),
    /// The descriptor was removed while queued.
    Gone,
    Failed(String),
}

struct RunDone {
    name: RepoName,
    result: RunResult,
    duration: Duration,
}

struct Worker {
    home: PathBuf,
    role: Role,
    handler: RepoHandler,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, role: Role) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), role))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf, role: Role) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let settings = config::load_at(&home)?;
    let workers = settings.workers.max(1);

    let (queue, work_rx) = WorkQueue::new(tokio::runtime::Handle::current());
    let handler = pipeline::default_handler(&home, settings, Arc::new(queue.clone()));
    let worker = Arc::new(Worker {
        home: home.clone(),
        role,
        handler,
    });
    let runs: Arc<RwLock<RunLog>> = Arc::new(RwLock::new(HashMap::new()));
    let started_at_unix = unix_seconds_now();

    for repo in registry::list_repos_at(&home)? {
        queue.enqueue(repo.metadata.name);
    }
    tracing::info!(role = %role, workers, "catalog daemon started");

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let result = watcher_task(home, queue, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let queue = queue.clone();
        let runs = runs.clone();
        tokio::spawn(async move {
            let result =
                processor_task(worker, workers, queue, work_rx, runs, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let server = SocketContext {
            home,
            role,
            queue,
            runs,
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(server, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, processor_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, processor_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("processor", processor_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    home: PathBuf,
    queue: WorkQueue,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let repos = repos_root(&home);
    if !repos.exists() {
        fs::create_dir_all(&repos).map_err(|e| io_err(&repos, e))?;
    }
    // Events arrive with canonical paths on some platforms.
    let repos = fs::canonicalize(&repos).unwrap_or(repos);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&repos, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %repos.display(), "watching repository descriptors");

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    let Some(name) = repo_name_for_path(&path, &repos) else {
                        continue;
                    };
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }
                    tracing::info!(repo = %name, "descriptor changed");
                    queue.enqueue(name);
                }
            }
        }
    }

    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// `<repos>/<name>.yaml` → `name`.
fn repo_name_for_path(path: &Path, repos: &Path) -> Option<RepoName> {
    if path.parent() != Some(repos) {
        return None;
    }
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false);
    if !is_yaml {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(RepoName::from)
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Runs queued reconciles: one at a time per name, up to `workers` names in
/// parallel. A name queued while it is running is re-run once afterwards.
async fn processor_task(
    worker: Arc<Worker>,
    workers: usize,
    queue: WorkQueue,
    mut work_rx: mpsc::UnboundedReceiver<RepoName>,
    runs: Arc<RwLock<RunLog>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let permits = Arc::new(Semaphore::new(workers));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RunDone>();
    let mut in_flight = HashSet::<RepoName>::new();
    let mut dirty = HashSet::<RepoName>::new();
    let mut failures = HashMap::<RepoName, u32>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_name = work_rx.recv() => {
                let Some(name) = maybe_name else { break };
                if in_flight.contains(&name) {
                    dirty.insert(name);
                    continue;
                }
                in_flight.insert(name.clone());
                spawn_run(worker.clone(), permits.clone(), done_tx.clone(), name);
            }
            Some(done) = done_rx.recv() => {
                in_flight.remove(&done.name);
                let record = record_run(&done, &mut failures, &queue);
                runs.write().await.insert(done.name.0.clone(), record);
                if dirty.remove(&done.name) {
                    queue.enqueue(done.name);
                }
            }
        }
    }

    Ok(())
}

fn spawn_run(
    worker: Arc<Worker>,
    permits: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<RunDone>,
    name: RepoName,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let result = match permits.acquire_owned().await {
            Ok(_permit) => {
                let job_name = name.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    pipeline::reconcile_at(&worker.home, &worker.handler, &job_name, worker.role)
                })
                .await;
                match joined {
                    Ok(Ok(outcome)) => RunResult::Done(outcome),
                    Ok(Err(SyncError::Store(StoreError::RepoNotFound { .. }))) => RunResult::Gone,
                    Ok(Err(err)) => RunResult::Failed(err.to_string()),
                    Err(err) => RunResult::Failed(format!("reconcile task join error: {err}")),
                }
            }
            Err(_) => RunResult::Failed("worker pool closed".to_string()),
        };
        let _ = done_tx.send(RunDone {
            name,
            result,
            duration: started.elapsed(),
        });
    });
}

/// Log the outcome, update the failure streak and schedule a retry on error.
fn record_run(
    done: &RunDone,
    failures: &mut HashMap<RepoName, u32>,
    queue: &WorkQueue,
) -> RunRecord {
    let duration_ms = u64::try_from(done.duration.as_millis()).unwrap_or(u64::MAX);
    let (ok, changed, error) = match &done.result {
        RunResult::Done(outcome) => {
            failures.remove(&done.name);
            tracing::info!(
                repo = %done.name,
                changed = outcome.changed,
                commit = %outcome.status.commit,
                duration_ms,
                "reconcile completed",
            );
            (true, outcome.changed, None)
        }
        RunResult::Gone => {
            failures.remove(&done.name);
            tracing::info!(repo = %done.name, "repository removed, nothing to reconcile");
            (true, false, None)
        }
        RunResult::Failed(message) => {
            let streak = failures.entry(done.name.clone()).or_insert(0);
            *streak = streak.saturating_add(1);
            let delay = retry_delay(*streak);
            tracing::warn!(
                repo = %done.name,
                error = %message,
                failures = *streak,
                retry_in_ms = delay.as_millis() as u64,
                "reconcile failed",
            );
            queue.enqueue_after(&done.name, delay);
            (false, false, Some(message.clone()))
        }
    };

    RunRecord {
        last_run_unix: unix_seconds_now(),
        ok,
        changed,
        consecutive_failures: failures.get(&done.name).copied().unwrap_or(0),
        error,
        duration_ms,
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct SocketContext {
    home: PathBuf,
    role: Role,
    queue: WorkQueue,
    runs: Arc<RwLock<RunLog>>,
    started_at_unix: u64,
}

async fn socket_server_task(
    ctx: SocketContext,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let run = run_dir(&ctx.home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }

    let socket = socket_path(&ctx.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    ctx: SocketContext,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => DaemonResponse::ok(build_status_payload(&ctx).await),
            "reconcile" => match queue_reconcile(&ctx, request.repo.clone()).await {
                Ok(queued) => DaemonResponse::ok(json!({ "queued": queued })),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Queue `repo`, or every known repository when `None`.
async fn queue_reconcile(
    ctx: &SocketContext,
    repo: Option<String>,
) -> Result<Vec<String>, DaemonError> {
    let names = match repo {
        Some(name) => {
            registry::validate_name(&name)?;
            let name = RepoName::from(name);
            if !registry::repo_path_at(&ctx.home, &name).exists() {
                return Err(DaemonError::Protocol(format!("unknown repository '{name}'")));
            }
            vec![name]
        }
        None => {
            let home = ctx.home.clone();
            tokio::task::spawn_blocking(move || registry::list_repos_at(&home))
                .await
                .map_err(|err| DaemonError::Protocol(format!("registry scan join error: {err}")))??
                .into_iter()
                .map(|repo| repo.metadata.name)
                .collect()
        }
    };

    let queued = names.iter().map(|name| name.0.clone()).collect();
    for name in names {
        ctx.queue.enqueue(name);
    }
    Ok(queued)
}

async fn build_status_payload(ctx: &SocketContext) -> Value {
    let snapshot: RunLog = ctx.runs.read().await.clone();
    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort();

    let repos: Vec<Value> = names
        .into_iter()
        .map(|name| {
            let mut entry = json!(snapshot[name]);
            entry["name"] = json!(name);
            entry
        })
        .collect();
    let last_run_at_unix = snapshot.values().map(|r| r.last_run_unix).max().unwrap_or(0);

    json!({
        "running": true,
        "role": ctx.role.to_string(),
        "pid": std::process::id(),
        "started_at_unix": ctx.started_at_unix,
        "last_run_at_unix": last_run_at_unix,
        "pending_timers": ctx.queue.pending(),
        "repos": repos,
        "socket": socket_path(&ctx.home).display().to_string(),
        "repos_root": repos_root(&ctx.home).display().to_string(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [repos_root(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber: `RUST_LOG` filter, `info` by default.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
