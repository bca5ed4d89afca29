//! Auto-evolve: filesystem changes become scoped pipeline runs.
//!
//! The `notify` callback only forwards changed paths onto a channel. A single
//! dispatch task owns all watcher state: it filters, debounces per path and
//! asks the orchestrator for a run. While a run is active, at most one
//! request is kept pending (last write wins) and is started once the active
//! run completes. A supervisor task recreates the `notify` watcher with
//! exponential backoff whenever it fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use codelore_shared::{LoreError, Result, Trigger, WatchConfig};

use crate::events::PipelineEvent;
use crate::pipeline::Orchestrator;

const CHANGE_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Disabled,
    Enabled,
    /// A change arrived and is being checked against the debounce window.
    Debouncing,
    /// A change passed the debounce window and a run is being requested.
    Triggered,
}

impl WatcherState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Debouncing => "debouncing",
            Self::Triggered => "triggered",
        }
    }
}

/// Per-path debounce keyed on the last accepted trigger.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_trigger: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_trigger: HashMap::new(),
        }
    }

    /// Returns true when a change to `path` at `now` should trigger a run.
    /// A change within the window of the previous trigger is coalesced.
    pub fn accept(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(last) = self.last_trigger.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_trigger.insert(path.to_path_buf(), now);
        if self.last_trigger.len() > 1024 {
            self.prune(now);
        }
        true
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_trigger
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }
}

/// Doubling restart delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

struct Session {
    changes: mpsc::Sender<PathBuf>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Watches the scan root and requests runs through the [`Orchestrator`].
pub struct Watcher {
    orchestrator: Orchestrator,
    config: WatchConfig,
    state: Arc<watch::Sender<WatcherState>>,
    session: Mutex<Option<Session>>,
}

impl Watcher {
    pub fn new(orchestrator: Orchestrator, config: WatchConfig) -> Self {
        let (state, _) = watch::channel(WatcherState::Disabled);
        Self {
            orchestrator,
            config,
            state: Arc::new(state),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub async fn is_enabled(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Start watching. Enabling twice is a no-op.
    pub async fn enable_auto_evolve(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatch = Dispatch {
            orchestrator: self.orchestrator.clone(),
            extensions: self
                .config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            debouncer: Debouncer::new(self.config.debounce()),
            pending: None,
            state: Arc::clone(&self.state),
        };
        let supervisor = Supervisor {
            root: self.orchestrator.scanner().root().to_path_buf(),
            backoff: Backoff::new(
                Duration::from_millis(self.config.backoff_initial_ms),
                Duration::from_millis(self.config.backoff_max_ms),
            ),
            healthy_after: Duration::from_millis(self.config.backoff_max_ms),
        };

        let tasks = vec![
            tokio::spawn(dispatch.run(changes_rx, stop_rx.clone())),
            tokio::spawn(supervisor.run(changes_tx.clone(), stop_rx)),
        ];

        self.state.send_replace(WatcherState::Enabled);
        info!(
            root = %self.orchestrator.scanner().root().display(),
            debounce_ms = self.config.debounce_ms,
            "auto-evolve enabled"
        );

        *session = Some(Session {
            changes: changes_tx,
            stop: stop_tx,
            tasks,
        });
        Ok(())
    }

    /// Stop watching. A pending request is dropped; an active run continues.
    pub async fn disable_auto_evolve(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.stop.send_replace(true);
        drop(session.changes);
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task ended abnormally");
            }
        }
        self.state.send_replace(WatcherState::Disabled);
        info!("auto-evolve disabled");
    }

    /// Report a change directly, as the filesystem watcher would. Returns
    /// false when auto-evolve is disabled.
    pub async fn notify_change(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let path = if path.is_absolute() {
            path
        } else {
            self.orchestrator.scanner().root().join(path)
        };

        let changes = match self.session.lock().await.as_ref() {
            Some(session) => session.changes.clone(),
            None => return false,
        };
        changes.send(path).await.is_ok()
    }
}

/// Single consumer of change events.
struct Dispatch {
    orchestrator: Orchestrator,
    extensions: Vec<String>,
    debouncer: Debouncer,
    pending: Option<PathBuf>,
    state: Arc<watch::Sender<WatcherState>>,
}

impl Dispatch {
    async fn run(mut self, mut changes: mpsc::Receiver<PathBuf>, mut stop: watch::Receiver<bool>) {
        let mut events = self.orchestrator.events().subscribe();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                change = changes.recv() => {
                    let Some(path) = change else { break };
                    self.on_change(path).await;
                }
                event = events.recv() => match event {
                    Some(PipelineEvent::RunCompleted { .. }) => self.flush_pending().await,
                    Some(_) => {}
                    None => {
                        // Lagged behind the bus; resubscribe and recheck.
                        events = self.orchestrator.events().subscribe();
                        if !self.orchestrator.is_running().await {
                            self.flush_pending().await;
                        }
                    }
                },
            }
        }

        if let Some(path) = self.pending.take() {
            debug!(path = %path.display(), "dropping pending watch request");
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        let scanner = self.orchestrator.scanner();
        if !path.starts_with(scanner.root()) || scanner.is_excluded(path) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    async fn on_change(&mut self, path: PathBuf) {
        if !self.accepts(&path) {
            return;
        }

        self.state.send_replace(WatcherState::Debouncing);
        if self.debouncer.accept(&path, Instant::now()) {
            self.trigger(path).await;
        } else {
            debug!(path = %path.display(), "change coalesced");
        }
        self.state.send_replace(WatcherState::Enabled);
    }

    async fn flush_pending(&mut self) {
        if let Some(path) = self.pending.take() {
            self.trigger(path).await;
            self.state.send_replace(WatcherState::Enabled);
        }
    }

    async fn trigger(&mut self, path: PathBuf) {
        self.state.send_replace(WatcherState::Triggered);
        match self
            .orchestrator
            .start_run(Some(&path), Trigger::Watch)
            .await
        {
            Ok(run_id) => info!(%run_id, path = %path.display(), "change triggered run"),
            Err(LoreError::AlreadyRunning { run_id }) => {
                debug!(active = %run_id, path = %path.display(), "run active, queueing request");
                if let Some(replaced) = self.pending.replace(path) {
                    debug!(path = %replaced.display(), "pending request replaced");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to start watch run"),
        }
    }
}

/// Keeps a `notify` watcher alive, recreating it after failures.
struct Supervisor {
    root: PathBuf,
    backoff: Backoff,
    healthy_after: Duration,
}

impl Supervisor {
    async fn run(mut self, changes: mpsc::Sender<PathBuf>, mut stop: watch::Receiver<bool>) {
        loop {
            let (errors_tx, mut errors_rx) = mpsc::channel(16);
            let failure = match start_notify(&self.root, changes.clone(), errors_tx) {
                Ok(watcher) => {
                    let started = Instant::now();
                    debug!(root = %self.root.display(), "filesystem watcher started");
                    tokio::select! {
                        _ = stop.changed() => return,
                        error = errors_rx.recv() => {
                            drop(watcher);
                            if started.elapsed() >= self.healthy_after {
                                self.backoff.reset();
                            }
                            match error {
                                Some(e) => LoreError::Watcher(e.to_string()),
                                None => LoreError::Watcher("event stream closed".into()),
                            }
                        }
                    }
                }
                Err(e) => e,
            };

            let delay = self.backoff.next_delay();
            warn!(
                error = %failure,
                delay_ms = delay.as_millis() as u64,
                "filesystem watcher failed, restarting"
            );
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn start_notify(
    root: &Path,
    changes: mpsc::Sender<PathBuf>,
    errors: mpsc::Sender<notify::Error>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if !is_content_change(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if changes.blocking_send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = errors.blocking_send(e);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| LoreError::Watcher(e.to_string()))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| LoreError::Watcher(format!("cannot watch {}: {e}", root.display())))?;
    Ok(watcher)
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use codelore_shared::{AppConfig, RunStatus};
    use codelore_storage::Storage;
    use uuid::Uuid;

    const SRC: &str = "import asyncio\n\nasync def fetch(url):\n    await asyncio.sleep(1)\n";

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn setup(root: &Path, debounce_ms: u64) -> (Orchestrator, Watcher) {
        let mut config = AppConfig::default();
        config.scan.root = root.to_string_lossy().into_owned();
        config.scan.batch_size = 1;
        config.watch.debounce_ms = debounce_ms;
        let db = std::env::temp_dir().join(format!("codelore_watch_{}.db", Uuid::now_v7()));
        let store = Arc::new(Storage::open(&db).await.unwrap());
        let orch = Orchestrator::from_config(&config, store, EventBus::new(4096)).unwrap();
        let watcher = Watcher::new(orch.clone(), config.watch.clone());
        (orch, watcher)
    }

    /// Wait until `count` runs are recorded and nothing is running.
    async fn settle(orch: &Orchestrator, count: usize) -> Vec<codelore_shared::PipelineRun> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let runs = orch.store().list_runs(50).await.unwrap();
            let done = runs.iter().filter(|r| r.status.is_terminal()).count();
            if done >= count && !orch.is_running().await {
                // Give the dispatcher a moment to start anything still queued.
                tokio::time::sleep(Duration::from_millis(300)).await;
                if !orch.is_running().await {
                    return orch.store().list_runs(50).await.unwrap();
                }
            }
            assert!(Instant::now() < deadline, "runs did not settle");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn debouncer_coalesces_within_window() {
        let mut d = Debouncer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let a = Path::new("/r/a.py");

        assert!(d.accept(a, t0));
        assert!(!d.accept(a, t0 + Duration::from_secs(2)));
        assert!(!d.accept(a, t0 + Duration::from_millis(4999)));
        assert!(d.accept(a, t0 + Duration::from_secs(5)));
        // Windows are per path.
        assert!(d.accept(Path::new("/r/b.py"), t0 + Duration::from_secs(1)));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_millis(3000));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn burst_on_one_path_triggers_one_run() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/a.py", SRC);
        let (orch, watcher) = setup(dir.path(), 5000).await;
        watcher.enable_auto_evolve().await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Enabled);

        for _ in 0..5 {
            assert!(watcher.notify_change("pkg/a.py").await);
        }

        let runs = settle(&orch, 1).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, Trigger::Watch);
        assert_eq!(runs[0].scope.as_deref(), Some("pkg/a.py"));
        assert_eq!(runs[0].status, RunStatus::Completed);

        watcher.disable_auto_evolve().await;
        assert_eq!(watcher.state(), WatcherState::Disabled);
    }

    #[tokio::test]
    async fn two_saves_inside_window_trigger_one_run() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", SRC);
        let (orch, watcher) = setup(dir.path(), 5000).await;
        watcher.enable_auto_evolve().await.unwrap();

        watcher.notify_change("a.py").await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        watcher.notify_change("a.py").await;

        let runs = settle(&orch, 1).await;
        assert_eq!(runs.len(), 1);
        watcher.disable_auto_evolve().await;
    }

    #[tokio::test]
    async fn requests_during_a_run_coalesce_to_the_last() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..200 {
            write(dir.path(), &format!("bulk/m{i}.py"), SRC);
        }
        write(dir.path(), "a.py", SRC);
        write(dir.path(), "b.py", SRC);
        let (orch, watcher) = setup(dir.path(), 5000).await;
        watcher.enable_auto_evolve().await.unwrap();

        orch.start_run(None, Trigger::Manual).await.unwrap();
        watcher.notify_change("a.py").await;
        watcher.notify_change("b.py").await;

        let runs = settle(&orch, 2).await;
        assert_eq!(runs.len(), 2);
        let watch_runs: Vec<_> = runs.iter().filter(|r| r.trigger == Trigger::Watch).collect();
        assert_eq!(watch_runs.len(), 1);
        assert_eq!(watch_runs[0].scope.as_deref(), Some("b.py"));
        watcher.disable_auto_evolve().await;
    }

    #[tokio::test]
    async fn filtered_and_disabled_changes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "notes.bin", "x");
        write(dir.path(), "node_modules/x/index.js", "module.exports = 1;\n");
        let (orch, watcher) = setup(dir.path(), 5000).await;

        assert!(!watcher.notify_change("a.py").await);

        watcher.enable_auto_evolve().await.unwrap();
        watcher.notify_change("notes.bin").await;
        watcher.notify_change("node_modules/x/index.js").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(orch.store().list_runs(10).await.unwrap().is_empty());

        watcher.disable_auto_evolve().await;
        assert!(!watcher.is_enabled().await);
    }
}
