//! Pipeline orchestrator: scope → scan → classify → extract → persist.
//!
//! At most one run is active per [`Orchestrator`]. Each run executes on its
//! own task; the caller gets a [`RunId`] back immediately and follows the run
//! through the [`EventBus`], [`Orchestrator::get_status`] or
//! [`Orchestrator::wait_for`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use codelore_classifier::Classifier;
use codelore_extractor::{Extraction, Extractor, ModuleIndex};
use codelore_scanner::Scanner;
use codelore_shared::{
    AppConfig, ClassifiedResult, LoreError, PipelineRun, Result, RunCounts, RunId, RunStatus,
    ScanConfig, ScanResult, Stage, Trigger,
};
use codelore_storage::Storage;

use crate::events::{EventBus, PipelineEvent};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Classifying,
    Extracting,
    Persisting,
    /// Last run failed. Accepts new runs like `Idle`.
    Failed,
    /// Last run was cancelled. Accepts new runs like `Idle`.
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Classifying => "classifying",
            Self::Extracting => "extracting",
            Self::Persisting => "persisting",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Classifying | Self::Extracting | Self::Persisting
        )
    }
}

impl From<Stage> for Phase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Scanning => Self::Scanning,
            Stage::Classifying => Self::Classifying,
            Stage::Extracting => Self::Extracting,
            Stage::Persisting => Self::Persisting,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: Phase,
    pub stage: Option<Stage>,
    /// Active run, or the last finished one when idle.
    pub run_id: Option<RunId>,
    pub counts: RunCounts,
}

struct ActiveRun {
    run_id: RunId,
    stage: Option<Stage>,
    counts: RunCounts,
    cancel: Arc<AtomicBool>,
}

struct RunState {
    phase: Phase,
    active: Option<ActiveRun>,
    last: Option<PipelineRun>,
}

struct Inner {
    scanner: Scanner,
    classifier: Classifier,
    store: Arc<Storage>,
    events: EventBus,
    importance_threshold: f64,
    state: Mutex<RunState>,
    finished: watch::Sender<Option<PipelineRun>>,
}

/// Runs the discovery pipeline. Cheap to clone; clones share one run slot.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        scanner: Scanner,
        classifier: Classifier,
        store: Arc<Storage>,
        events: EventBus,
        importance_threshold: f64,
    ) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                scanner,
                classifier,
                store,
                events,
                importance_threshold,
                state: Mutex::new(RunState {
                    phase: Phase::Idle,
                    active: None,
                    last: None,
                }),
                finished,
            }),
        }
    }

    /// Build scanner and classifier from `config`.
    pub fn from_config(config: &AppConfig, store: Arc<Storage>, events: EventBus) -> Result<Self> {
        let scanner = Scanner::new(ScanConfig::from(config))?;
        let classifier = Classifier::new(config.classify.clone())?;
        Ok(Self::new(
            scanner,
            classifier,
            store,
            events,
            config.extract.importance_threshold,
        ))
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<Storage> {
        &self.inner.store
    }

    pub fn scanner(&self) -> &Scanner {
        &self.inner.scanner
    }

    /// Accept a run over `scope` (the whole root when `None`) and start it in
    /// the background. Fails with [`LoreError::AlreadyRunning`] while another
    /// run is active.
    #[instrument(skip(self, trigger), fields(trigger = trigger.as_str()))]
    pub async fn start_run(&self, scope: Option<&Path>, trigger: Trigger) -> Result<RunId> {
        let scanner = &self.inner.scanner;
        let scope_path = scanner.resolve_scope(scope)?;
        let relative = scanner.relative_path(&scope_path);
        let run = PipelineRun::start(trigger, (!relative.is_empty()).then_some(relative));
        let run_id = run.run_id.clone();
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut state = self.inner.state.lock().await;
            if let Some(active) = &state.active {
                return Err(LoreError::AlreadyRunning {
                    run_id: active.run_id.clone(),
                });
            }
            state.phase = Phase::Scanning;
            state.active = Some(ActiveRun {
                run_id: run_id.clone(),
                stage: None,
                counts: RunCounts::default(),
                cancel: Arc::clone(&cancel),
            });
        }

        info!(%run_id, scope = run.scope.as_deref().unwrap_or("."), "run accepted");
        tokio::spawn(Arc::clone(&self.inner).execute(run, scope_path, cancel));
        Ok(run_id)
    }

    /// Request cancellation. Takes effect at the next batch boundary.
    /// Returns false when `run_id` is not the active run.
    pub async fn cancel_run(&self, run_id: &RunId) -> bool {
        let state = self.inner.state.lock().await;
        match &state.active {
            Some(active) if &active.run_id == run_id => {
                active.cancel.store(true, Ordering::SeqCst);
                info!(%run_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub async fn get_status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().await;
        match &state.active {
            Some(active) => StatusSnapshot {
                state: state.phase,
                stage: active.stage,
                run_id: Some(active.run_id.clone()),
                counts: active.counts.clone(),
            },
            None => StatusSnapshot {
                state: state.phase,
                stage: None,
                run_id: state.last.as_ref().map(|r| r.run_id.clone()),
                counts: state
                    .last
                    .as_ref()
                    .map(|r| r.counts.clone())
                    .unwrap_or_default(),
            },
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.active.is_some()
    }

    /// Most recent finished run of this orchestrator.
    pub async fn last_run(&self) -> Option<PipelineRun> {
        self.inner.state.lock().await.last.clone()
    }

    /// Wait until `run_id` reaches a terminal status.
    pub async fn wait_for(&self, run_id: &RunId) -> Result<PipelineRun> {
        let mut finished = self.inner.finished.subscribe();
        loop {
            {
                let state = self.inner.state.lock().await;
                if let Some(last) = state.last.as_ref().filter(|r| &r.run_id == run_id) {
                    return Ok(last.clone());
                }
                let active = state.active.as_ref().map(|a| &a.run_id) == Some(run_id);
                if !active {
                    drop(state);
                    return match self.inner.store.get_run(run_id).await? {
                        Some(run) if run.status.is_terminal() => Ok(run),
                        _ => Err(LoreError::validation(format!("unknown run {run_id}"))),
                    };
                }
            }
            if finished.changed().await.is_err() {
                return Err(LoreError::Cancelled);
            }
        }
    }

    /// Start a run and wait for it to finish.
    pub async fn run_to_completion(
        &self,
        scope: Option<&Path>,
        trigger: Trigger,
    ) -> Result<PipelineRun> {
        let run_id = self.start_run(scope, trigger).await?;
        self.wait_for(&run_id).await
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, run: PipelineRun, scope: PathBuf, cancel: Arc<AtomicBool>) {
        let run_id = run.run_id.clone();
        let worker = tokio::spawn(Arc::clone(&self).run_stages(run.clone(), scope, cancel));

        let (mut run, outcome) = match worker.await {
            Ok(done) => done,
            Err(e) => {
                let (stage, counts) = {
                    let state = self.state.lock().await;
                    let active = state.active.as_ref();
                    (
                        active.and_then(|a| a.stage).unwrap_or(Stage::Scanning),
                        active.map(|a| a.counts.clone()).unwrap_or_default(),
                    )
                };
                let mut run = run;
                run.counts = counts;
                (run, Err(LoreError::stage(stage, format!("stage task aborted: {e}"))))
            }
        };

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(LoreError::Cancelled) => (RunStatus::Cancelled, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        run.finish(status, error.clone());

        if let Err(e) = self.store.save_run(&run).await {
            warn!(%run_id, error = %e, "failed to record run outcome");
        }

        {
            let mut state = self.state.lock().await;
            state.phase = match status {
                RunStatus::Failed => Phase::Failed,
                RunStatus::Cancelled => Phase::Cancelled,
                _ => Phase::Idle,
            };
            state.active = None;
            state.last = Some(run.clone());
        }

        match &error {
            Some(error) => warn!(%run_id, %error, "run failed"),
            None => info!(%run_id, status = status.as_str(), "run finished"),
        }

        self.events.publish(PipelineEvent::RunCompleted {
            run_id,
            status,
            summary: run.counts.clone(),
            error,
        });
        self.finished.send_replace(Some(run));
    }

    async fn run_stages(
        self: Arc<Self>,
        mut run: PipelineRun,
        scope: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> (PipelineRun, Result<()>) {
        let span = info_span!("pipeline_run", run_id = %run.run_id, scope = %scope.display());
        let outcome = self
            .stages(&mut run, &scope, &cancel)
            .instrument(span)
            .await;
        (run, outcome)
    }

    async fn stages(
        self: &Arc<Self>,
        run: &mut PipelineRun,
        scope: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        if let Err(e) = self.store.save_run(run).await {
            warn!(error = %e, "failed to record run start");
        }
        info!(trigger = run.trigger.as_str(), "starting pipeline run");

        // --- Stage 1: Scanning ---
        let started = self.begin_stage(run, Stage::Scanning).await;
        let scanned = self
            .scan_stage(run, scope, cancel)
            .await
            .map_err(|e| in_stage(Stage::Scanning, e))?;
        self.end_stage(run, Stage::Scanning, started).await;

        // --- Stage 2: Classifying ---
        let started = self.begin_stage(run, Stage::Classifying).await;
        let classified = self
            .classify_stage(run, scanned, cancel)
            .await
            .map_err(|e| in_stage(Stage::Classifying, e))?;
        self.end_stage(run, Stage::Classifying, started).await;

        // --- Stage 3: Extracting ---
        let started = self.begin_stage(run, Stage::Extracting).await;
        let extraction = self
            .extract_stage(run, classified, cancel)
            .await
            .map_err(|e| in_stage(Stage::Extracting, e))?;
        self.end_stage(run, Stage::Extracting, started).await;

        // --- Stage 4: Persisting ---
        let started = self.begin_stage(run, Stage::Persisting).await;
        self.persist_stage(run, extraction, cancel)
            .await
            .map_err(|e| in_stage(Stage::Persisting, e))?;
        self.end_stage(run, Stage::Persisting, started).await;

        Ok(())
    }

    async fn scan_stage(
        self: &Arc<Self>,
        run: &mut PipelineRun,
        scope: &Path,
        cancel: &AtomicBool,
    ) -> Result<Vec<ScanResult>> {
        let paths: Vec<PathBuf> = if scope.exists() {
            let inner = Arc::clone(self);
            let scope = scope.to_path_buf();
            tokio::task::spawn_blocking(move || inner.scanner.walk(&scope).collect::<Vec<_>>())
                .await
                .map_err(|e| LoreError::stage(Stage::Scanning, format!("walk task failed: {e}")))?
        } else {
            Vec::new()
        };

        run.counts.files_removed = self.remove_missing(scope, &paths).await?;
        let total = paths.len();
        run.counts.files_total = total;
        self.progress(run, Stage::Scanning, 0, total);

        let batch_size = self.scanner.config().batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.scanner.config().workers.max(1)));
        let mut scanned = Vec::with_capacity(total);
        let mut processed = 0;

        for batch in paths.chunks(batch_size) {
            check_cancelled(cancel)?;

            for (path, outcome) in self.scan_batch(batch, &semaphore).await {
                match outcome {
                    Ok(result) => {
                        self.store.record_scan(&result, Some(&run.run_id)).await?;
                        self.announce_patterns(run, &result);
                        run.counts.files_scanned += 1;
                        if result.file.oversized {
                            run.counts.files_oversized += 1;
                        }
                        run.counts.elements += result.elements.len();
                        run.counts.patterns += result.patterns.len();
                        scanned.push(result);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping file");
                        run.counts.files_skipped += 1;
                    }
                }
            }

            processed += batch.len();
            self.sync_counts(&run.counts).await;
            self.progress(run, Stage::Scanning, processed, total);
        }

        Ok(scanned)
    }

    /// Scan one batch on up to `workers` blocking threads. Results come back
    /// in input order.
    async fn scan_batch(
        self: &Arc<Self>,
        batch: &[PathBuf],
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(PathBuf, Result<ScanResult>)> {
        let timeout = self.scanner.config().parse_timeout;
        let mut handles = Vec::with_capacity(batch.len());

        for path in batch {
            let inner = Arc::clone(self);
            let semaphore = Arc::clone(semaphore);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(permit) => inner.scan_with_timeout(&path, permit, timeout).await,
                    Err(e) => Err(LoreError::stage(Stage::Scanning, e)),
                };
                (path, outcome)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, path) in handles.into_iter().zip(batch) {
            match handle.await {
                Ok(pair) => results.push(pair),
                Err(e) => results.push((
                    path.clone(),
                    Err(LoreError::parse(format!("scan task failed: {e}"))),
                )),
            }
        }
        results
    }

    async fn scan_with_timeout(
        self: &Arc<Self>,
        path: &Path,
        permit: OwnedSemaphorePermit,
        timeout: Duration,
    ) -> Result<ScanResult> {
        let inner = Arc::clone(self);
        let owned = path.to_path_buf();
        match blocking_with_timeout(permit, timeout, move || inner.scanner.scan_file(&owned)).await? {
            Some(result) => result,
            None => Err(LoreError::parse(format!(
                "{}: timed out after {} ms",
                path.display(),
                timeout.as_millis()
            ))),
        }
    }

    /// Drop stored files under `scope` that no longer exist on disk.
    async fn remove_missing(&self, scope: &Path, found: &[PathBuf]) -> Result<usize> {
        let prefix = self.scanner.relative_path(scope);
        let seen: HashSet<String> = found
            .iter()
            .map(|p| self.scanner.relative_path(p))
            .collect();

        let mut removed = 0;
        for path in self.store.list_file_paths_under(&prefix).await? {
            if seen.contains(&path) || self.scanner.root().join(&path).exists() {
                continue;
            }
            if self.store.remove_file(&path).await? {
                debug!(path = %path, "removed deleted file");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn announce_patterns(&self, run: &PipelineRun, result: &ScanResult) {
        let mut seen = HashSet::new();
        for pattern in &result.patterns {
            if seen.insert(pattern.pattern_type.as_str()) {
                self.events.publish(PipelineEvent::PatternDiscovered {
                    run_id: run.run_id.clone(),
                    file: result.file.path.clone(),
                    pattern_type: pattern.pattern_type.clone(),
                    value: pattern.value.clone(),
                });
            }
        }
    }

    async fn classify_stage(
        &self,
        run: &mut PipelineRun,
        scanned: Vec<ScanResult>,
        cancel: &AtomicBool,
    ) -> Result<Vec<ClassifiedResult>> {
        check_cancelled(cancel)?;
        let total = scanned.len();
        let classified = self.classifier.classify_all(scanned);
        self.progress(run, Stage::Classifying, 0, total);

        let batch_size = self.scanner.config().batch_size.max(1);
        let mut processed = 0;
        for batch in classified.chunks(batch_size) {
            check_cancelled(cancel)?;
            for item in batch {
                self.store
                    .upsert_classification(&item.classification)
                    .await?;
            }
            processed += batch.len();
            run.counts.classified = processed;
            self.sync_counts(&run.counts).await;
            self.progress(run, Stage::Classifying, processed, total);
        }

        Ok(classified)
    }

    async fn extract_stage(
        &self,
        run: &mut PipelineRun,
        classified: Vec<ClassifiedResult>,
        cancel: &AtomicBool,
    ) -> Result<Extraction> {
        check_cancelled(cancel)?;
        let total = classified.len();
        let index = ModuleIndex::new(self.store.list_file_paths().await?);
        let threshold = self.importance_threshold;
        let extraction = tokio::task::spawn_blocking(move || {
            Extractor::new(index).extract(&classified, threshold)
        })
        .await
        .map_err(|e| LoreError::stage(Stage::Extracting, format!("extract task failed: {e}")))?;

        run.counts.extracted_files = extraction.files_processed;
        run.counts.extraction_records = extraction.records.len();
        self.progress(run, Stage::Extracting, total, total);
        Ok(extraction)
    }

    async fn persist_stage(
        &self,
        run: &mut PipelineRun,
        extraction: Extraction,
        cancel: &AtomicBool,
    ) -> Result<()> {
        check_cancelled(cancel)?;
        self.store
            .insert_extractions(&run.run_id, &extraction.records)
            .await?;

        let batch_size = self.scanner.config().batch_size.max(1);
        let total = extraction.concepts.len() + extraction.relationships.len();
        let mut processed = 0;
        self.progress(run, Stage::Persisting, 0, total);

        for batch in extraction.concepts.chunks(batch_size) {
            check_cancelled(cancel)?;
            for observation in batch {
                self.store.upsert_concept(observation).await?;
            }
            processed += batch.len();
            run.counts.concepts += batch.len();
            self.sync_counts(&run.counts).await;
            self.progress(run, Stage::Persisting, processed, total);
        }

        for batch in extraction.relationships.chunks(batch_size) {
            check_cancelled(cancel)?;
            for observation in batch {
                self.store.upsert_relationship(observation).await?;
            }
            processed += batch.len();
            run.counts.relationships += batch.len();
            self.sync_counts(&run.counts).await;
            self.progress(run, Stage::Persisting, processed, total);
        }

        Ok(())
    }

    // --- Bookkeeping ---

    async fn begin_stage(&self, run: &PipelineRun, stage: Stage) -> Instant {
        {
            let mut state = self.state.lock().await;
            state.phase = Phase::from(stage);
            if let Some(active) = state.active.as_mut() {
                active.stage = Some(stage);
            }
        }
        debug!(stage = stage.as_str(), "stage started");
        self.events.publish(PipelineEvent::StageStarted {
            run_id: run.run_id.clone(),
            stage,
        });
        Instant::now()
    }

    async fn end_stage(&self, run: &mut PipelineRun, stage: Stage, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        run.stage_durations
            .insert(stage.as_str().to_string(), elapsed_ms);
        self.sync_counts(&run.counts).await;
        info!(stage = stage.as_str(), elapsed_ms, "stage completed");
        self.events.publish(PipelineEvent::StageCompleted {
            run_id: run.run_id.clone(),
            stage,
            summary: run.counts.clone(),
        });
    }

    async fn sync_counts(&self, counts: &RunCounts) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.as_mut() {
            active.counts = counts.clone();
        }
    }

    fn progress(&self, run: &PipelineRun, stage: Stage, processed: usize, total: usize) {
        self.events.publish(PipelineEvent::StageProgress {
            run_id: run.run_id.clone(),
            stage,
            processed,
            total,
        });
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(LoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run `work` on a blocking thread that holds `permit` until `work` returns,
/// even after the caller stops waiting. `None` when `timeout` elapses first.
async fn blocking_with_timeout<T, F>(
    permit: OwnedSemaphorePermit,
    timeout: Duration,
    work: F,
) -> Result<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        work()
    });
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(e)) => Err(LoreError::parse(format!("scan task failed: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Attribute an error to `stage` unless it already carries one.
fn in_stage(stage: Stage, err: LoreError) -> LoreError {
    match err {
        LoreError::Cancelled | LoreError::StageFailed { .. } => err,
        other => LoreError::stage(stage, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelore_classifier::rules::UTILITY_WEIGHT;
    use codelore_shared::{ConceptFilter, RelationshipFilter};
    use uuid::Uuid;

    const ASYNC_SRC: &str = "import asyncio\n\nasync def fetch(url):\n    await asyncio.sleep(1)\n    return url\n";

    async fn open_store() -> Arc<Storage> {
        let db = std::env::temp_dir().join(format!("codelore_core_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&db).await.unwrap())
    }

    fn config_for(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.scan.root = root.to_string_lossy().into_owned();
        config.scan.batch_size = 2;
        config
    }

    async fn setup(root: &Path) -> Orchestrator {
        Orchestrator::from_config(&config_for(root), open_store().await, EventBus::new(1024))
            .unwrap()
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn drain(sub: &mut crate::events::Subscription) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn empty_directory_completes_with_zero_counts() {
        let dir = tempfile::tempdir().unwrap();
        let orch = setup(dir.path()).await;
        let mut sub = orch.events().subscribe();

        let run = orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts, RunCounts::default());
        assert_eq!(run.stage_durations.len(), Stage::ALL.len());

        let events = drain(&mut sub);
        let started: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageStarted { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(started, Stage::ALL.to_vec());
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunCompleted { status: RunStatus::Completed, .. })
        ));
        assert!(events.iter().all(|e| e.run_id() == &run.run_id));

        let status = orch.get_status().await;
        assert_eq!(status.state, Phase::Idle);
        assert_eq!(status.run_id, Some(run.run_id));
    }

    #[tokio::test]
    async fn async_file_flows_into_knowledge_store() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "svc/fetch.py", ASYNC_SRC);
        let orch = setup(dir.path()).await;
        let mut sub = orch.events().subscribe();

        let run = orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.files_scanned, 1);

        let store = orch.store();
        assert!(store.get_file("svc/fetch.py").await.unwrap().is_some());
        let patterns = store.get_patterns("svc/fetch.py").await.unwrap();
        assert!(patterns.iter().any(|p| p.pattern_type == "async"));

        let elements = store.get_elements("svc/fetch.py").await.unwrap();
        let distinct: HashSet<&str> = patterns.iter().map(|p| p.pattern_type.as_str()).collect();
        let score = 0.5 * (distinct.len() as f64 / 6.0).min(1.0)
            + 0.3 * (patterns.len() as f64 / 20.0).min(1.0)
            + 0.2 * (elements.len() as f64 / 15.0).min(1.0);
        let file = store.get_file("svc/fetch.py").await.unwrap().unwrap();
        assert!((file.score - score).abs() < 1e-9);

        let config = config_for(dir.path());
        let classification = store.get_classification("svc/fetch.py").await.unwrap().unwrap();
        assert_eq!(classification.category, "utility");
        let expected = (10.0 * (0.6 * score + 0.4 * UTILITY_WEIGHT)).max(config.classify.baseline_importance);
        assert!((classification.importance - expected).abs() < 1e-9);
        assert!(classification.importance >= config.extract.importance_threshold);

        let records = store.list_extractions(Some(&run.run_id)).await.unwrap();
        assert!(
            records
                .iter()
                .any(|r| r.file == "svc/fetch.py" && r.line == 3)
        );
        let concept = store.get_concept("module:svc/fetch").await.unwrap();
        assert!(concept.is_some());

        let discovered = drain(&mut sub).into_iter().any(|e| {
            matches!(e, PipelineEvent::PatternDiscovered { ref pattern_type, .. } if pattern_type == "async")
        });
        assert!(discovered);
    }

    #[tokio::test]
    async fn oversized_file_is_recorded_empty_and_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let body = ASYNC_SRC.repeat(10);
        write(dir.path(), "big/blob.py", &body);
        let mut config = config_for(dir.path());
        config.scan.max_file_size = 64;
        let orch = Orchestrator::from_config(&config, open_store().await, EventBus::new(256)).unwrap();
        let mut sub = orch.events().subscribe();

        let run = orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts.files_scanned, 1);
        assert_eq!(run.counts.files_oversized, 1);
        assert_eq!(run.counts.patterns, 0);

        let store = orch.store();
        let file = store.get_file("big/blob.py").await.unwrap().unwrap();
        assert!(file.oversized);
        assert_eq!(file.score, 0.0);
        assert_eq!(file.size, body.len() as u64);
        assert!(store.get_patterns("big/blob.py").await.unwrap().is_empty());
        assert!(store.get_elements("big/blob.py").await.unwrap().is_empty());

        assert_eq!(orch.get_status().await.state, Phase::Idle);
        let events = drain(&mut sub);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, PipelineEvent::PatternDiscovered { .. }))
        );
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunCompleted { status: RunStatus::Completed, error: None, .. })
        ));
    }

    #[tokio::test]
    async fn timed_out_work_keeps_its_permit_until_it_finishes() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();

        let outcome = blocking_with_timeout(permit, Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            7
        })
        .await
        .unwrap();
        assert_eq!(outcome, None);
        assert_eq!(semaphore.available_permits(), 0);

        let reacquired = tokio::time::timeout(Duration::from_secs(5), semaphore.acquire())
            .await
            .unwrap();
        assert!(reacquired.is_ok());
        drop(reacquired);

        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();
        let done = blocking_with_timeout(permit, Duration::from_secs(5), || 7).await.unwrap();
        assert_eq!(done, Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_run_accepted_under_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..200 {
            write(dir.path(), &format!("pkg/m{i}.py"), ASYNC_SRC);
        }
        let orch = setup(dir.path()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                orch.start_run(None, Trigger::Manual).await
            }));
        }

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(id) => accepted.push(id),
                Err(LoreError::AlreadyRunning { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected, 7);

        let run = orch.wait_for(&accepted[0]).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!orch.is_running().await);
        orch.start_run(None, Trigger::Manual).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_run_stops_at_batch_boundary() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..50 {
            write(dir.path(), &format!("m{i}.py"), ASYNC_SRC);
        }
        let orch = setup(dir.path()).await;

        let run_id = orch.start_run(None, Trigger::Manual).await.unwrap();
        assert!(orch.cancel_run(&run_id).await);

        let run = orch.wait_for(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error.is_none());
        assert_eq!(orch.get_status().await.state, Phase::Cancelled);
        assert!(!orch.cancel_run(&run_id).await);

        let stored = orch.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_run_with_stage() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", ASYNC_SRC);
        let db = std::env::temp_dir().join(format!("codelore_core_{}.db", Uuid::now_v7()));
        drop(Storage::open(&db).await.unwrap());
        let store = Arc::new(Storage::open_readonly(&db).await.unwrap());
        let orch =
            Orchestrator::from_config(&config_for(dir.path()), store, EventBus::new(64)).unwrap();
        let mut sub = orch.events().subscribe();

        let run = orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("scanning"));
        assert_eq!(orch.get_status().await.state, Phase::Failed);

        let completed = drain(&mut sub).into_iter().find_map(|e| match e {
            PipelineEvent::RunCompleted { status, error, .. } => Some((status, error)),
            _ => None,
        });
        let (status, error) = completed.unwrap();
        assert_eq!(status, RunStatus::Failed);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn reruns_accumulate_without_duplicating_edges() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "import b\nasync def run():\n    await b.go()\n");
        write(dir.path(), "b.py", "def go():\n    return 1\n");
        let orch = setup(dir.path()).await;

        orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        let store = orch.store();
        let edges = store.count_relationships().await.unwrap();
        let first = store.get_concept("module:a").await.unwrap().unwrap();
        let deps = store
            .get_relationships(&RelationshipFilter {
                concept: Some("module:a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(deps.iter().any(|r| r.target == "module:b"));

        orch.run_to_completion(None, Trigger::Manual).await.unwrap();
        assert_eq!(store.count_relationships().await.unwrap(), edges);
        let second = store.get_concept("module:a").await.unwrap().unwrap();
        assert_eq!(second.occurrence_count, first.occurrence_count * 2);

        let concepts = store.get_concepts(&ConceptFilter::default()).await.unwrap();
        assert!(!concepts.is_empty());
    }

    #[tokio::test]
    async fn scoped_run_drops_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/a.py", ASYNC_SRC);
        write(dir.path(), "pkg/b.py", ASYNC_SRC);
        let orch = setup(dir.path()).await;
        orch.run_to_completion(None, Trigger::Manual).await.unwrap();

        std::fs::remove_file(dir.path().join("pkg/a.py")).unwrap();
        let run = orch
            .run_to_completion(Some(Path::new("pkg/a.py")), Trigger::Watch)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.scope.as_deref(), Some("pkg/a.py"));
        assert_eq!(run.counts.files_removed, 1);
        assert!(orch.store().get_file("pkg/a.py").await.unwrap().is_none());
        assert!(orch.store().get_file("pkg/b.py").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn scope_outside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = setup(dir.path()).await;
        let err = orch
            .start_run(Some(Path::new("../elsewhere")), Trigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, LoreError::Validation { .. }));
        assert!(!orch.is_running().await);
    }
}
