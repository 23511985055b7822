//! Daemon orchestration.
//!
//! Wires the components together and owns their lifecycle:
//!
//! 1. Acquire the single-instance lock (a second daemon on the same data
//!    directory is refused, not queued).
//! 2. Open the three databases and run migrations — fatal on failure.
//! 3. Start the control plane, the watcher bridge, and the single job
//!    consumer loop.
//! 4. In the background: recover interrupted jobs, prune old ones, and
//!    reconcile the vector store against the catalog; readiness flips to
//!    true when that completes.
//!
//! Shutdown (signal or `POST /shutdown`): the watcher stops emitting, the
//! in-flight job gets a grace period (default 30 s) before being marked
//! cancelled, stores are closed, and the control plane answers 503 in
//! between.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::correlate::CorrelationEngine;
use crate::db;
use crate::fae;
use crate::migrate;
use crate::models::FileStatus;
use crate::pipeline::{discover_files, Pipeline};
use crate::queue::{JobPayload, JobPriority, JobQueue, JobStatus};
use crate::tracker::{Operation, OperationTracker};
use crate::vector_store::VectorStore;
use crate::watcher::{Debouncer, EventFilter, FileWatcher, FsChange};

pub struct Daemon {
    pub config: Config,
    pub catalog: Catalog,
    pub vectors: VectorStore,
    pub queue: Arc<JobQueue>,
    pub tracker: Arc<OperationTracker>,
    pub engine: Arc<CorrelationEngine>,
    pub pipeline: Arc<Pipeline>,
    pub started_at: i64,
    ready: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: Notify,
    _lock: InstanceLock,
}

impl Daemon {
    /// Open stores and construct the component graph. Refuses to start on
    /// a locked data directory or an unopenable catalog.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
            format!(
                "Cannot create data directory: {}",
                config.storage.data_dir.display()
            )
        })?;

        let lock = InstanceLock::acquire(config.storage.lock_path())?;

        let catalog_pool = db::connect(&config.storage.catalog_path())
            .await
            .context("Cannot open catalog database")?;
        migrate::migrate_catalog(&catalog_pool).await?;
        let catalog = Catalog::new(catalog_pool);

        let jobs_pool = db::connect(&config.storage.jobs_path())
            .await
            .context("Cannot open jobs database")?;
        migrate::migrate_jobs(&jobs_pool).await?;

        let vectors_pool = db::connect(&config.storage.vectors_path())
            .await
            .context("Cannot open vector index")?;
        migrate::migrate_vectors(&vectors_pool).await?;
        let vectors = VectorStore::new(vectors_pool);

        let queue = Arc::new(JobQueue::new(
            jobs_pool.clone(),
            config.queue.max_attempts,
            config.queue.recent_ring,
        ));
        let tracker = Arc::new(OperationTracker::new(jobs_pool));
        let engine = Arc::new(CorrelationEngine::new(
            catalog.clone(),
            tracker.clone(),
            config.correlation.clone(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            catalog.clone(),
            vectors.clone(),
            config.clone(),
        ));

        info!(data_dir = %config.storage.data_dir.display(), "daemon starting");

        Ok(Arc::new(Self {
            config,
            catalog,
            vectors,
            queue,
            tracker,
            engine,
            pipeline,
            started_at: Utc::now().timestamp(),
            ready: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
            _lock: lock,
        }))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.started_at
    }

    /// Request a graceful shutdown (signal handler and `POST /shutdown`).
    pub fn request_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.shutdown.notify_waiters();
        }
    }

    /// Run until shutdown: control plane + watcher bridge + job consumer.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        // Startup recovery runs in the background; readiness flips when it
        // completes so health checks respond immediately.
        let startup = {
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(e) = daemon.startup_recovery().await {
                    error!(error = %e, "startup recovery failed");
                }
                daemon.ready.store(true, Ordering::SeqCst);
                info!("daemon ready");
            })
        };

        // Watcher: notify thread → channel → bridge task on this loop.
        let (tx, rx) = mpsc::unbounded_channel::<FsChange>();
        let watcher = FileWatcher::start(&self.config, tx)?;
        info!(roots = watcher.watched_roots(), "file watcher started");
        let bridge = {
            let daemon = self.clone();
            tokio::spawn(async move { daemon.watch_bridge(rx).await })
        };

        let worker = {
            let daemon = self.clone();
            tokio::spawn(async move { daemon.consume_jobs().await })
        };

        let signals = {
            let daemon = self.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                daemon.request_shutdown();
            })
        };

        crate::server::serve(self.clone()).await?;

        // Server has drained; stop emitting and give the in-flight job its
        // grace period.
        drop(watcher);
        bridge.abort();
        signals.abort();
        startup.abort();

        let grace = Duration::from_secs(self.config.daemon.shutdown_grace_secs);
        match tokio::time::timeout(grace, worker).await {
            Ok(_) => {}
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "grace period expired, cancelling current job");
                if let Ok(Some(job)) = self.queue.current().await {
                    let _ = self
                        .queue
                        .complete(&job.id, JobStatus::Cancelled, Some("shutdown grace expired"))
                        .await;
                }
            }
        }

        info!("daemon stopped");
        Ok(())
    }

    pub fn shutdown_notified(&self) -> &Notify {
        &self.shutdown
    }

    async fn startup_recovery(&self) -> Result<()> {
        let requeued = self.queue.recover().await?;
        if requeued > 0 {
            info!(requeued, "startup queue recovery complete");
        }
        self.queue.cleanup_old_jobs(7).await?;

        let report = self
            .vectors
            .reconcile(&self.catalog, &self.config.embedding)
            .await?;
        if report.reembedded > 0 || report.orphans_removed > 0 {
            info!(
                reembedded = report.reembedded,
                orphans_removed = report.orphans_removed,
                "startup reconciliation complete"
            );
        }
        Ok(())
    }

    /// Daemon side of the watcher channel: debounce, filter, enqueue.
    async fn watch_bridge(&self, mut rx: mpsc::UnboundedReceiver<FsChange>) {
        let filter = EventFilter::new(&self.config);
        let mut debouncer = Debouncer::new(Duration::from_millis(self.config.watcher.debounce_ms));

        while let Some(change) = rx.recv().await {
            if self.is_shutting_down() {
                break;
            }

            match change {
                FsChange::Changed(path) => {
                    if !path.is_file() || !filter.should_process(&path) {
                        continue;
                    }
                    if !debouncer.admit(&path, Instant::now()) {
                        continue;
                    }

                    let path_str = path.to_string_lossy().to_string();
                    // Re-extraction of a known file returns it to `queued`.
                    if let Ok(Some(file)) = self.catalog.get_file_by_path(&path_str).await {
                        let _ = self
                            .catalog
                            .update_file_status(&file.id, FileStatus::Queued, None)
                            .await;
                    }

                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let payload = if fae::looks_like_export(&file_name) {
                        JobPayload::FaeImport {
                            path: path_str,
                            provider: None,
                        }
                    } else {
                        JobPayload::FileExtraction { path: path_str }
                    };
                    let priority = match &payload {
                        JobPayload::FaeImport { .. } => JobPriority::Import,
                        _ => JobPriority::Normal,
                    };

                    if let Err(e) = self.queue.enqueue(payload, priority).await {
                        error!(error = %e, "failed to enqueue watcher job");
                    }
                }
                FsChange::Removed(path) => {
                    let path_str = path.to_string_lossy().to_string();
                    match self.catalog.mark_path_skipped(&path_str).await {
                        Ok(n) if n > 0 => {
                            info!(path = %path_str, "file removed, records marked skipped")
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "failed to mark removed file"),
                    }
                }
            }
        }
    }

    /// The single consumer loop: one in-flight job at a time.
    async fn consume_jobs(&self) {
        // Hold off until recovery has re-queued interrupted jobs.
        while !self.is_ready() && !self.is_shutting_down() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        loop {
            if self.is_shutting_down() {
                break;
            }

            let job = match self.queue.claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "queue claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match self.process_job(&job.payload).await {
                Ok(()) => {
                    let _ = self.queue.complete(&job.id, JobStatus::Succeeded, None).await;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(job_id = %job.id, error = %message, "job failed");
                    let _ = self
                        .queue
                        .complete(&job.id, JobStatus::Failed, Some(&message))
                        .await;
                }
            }
        }
    }

    async fn process_job(&self, payload: &JobPayload) -> Result<()> {
        match payload {
            JobPayload::FileExtraction { path } | JobPayload::FaeImport { path, .. } => {
                let path = PathBuf::from(path);
                self.tracker
                    .begin(Operation::Extraction {
                        path: path.to_string_lossy().to_string(),
                    })
                    .await?;
                let outcome = self.pipeline.process_file(&path).await;
                self.tracker.finish().await?;
                outcome.map(|_| ())
            }
            JobPayload::BatchExtraction { scope } => {
                let mut paths = discover_files(&self.config)?;
                if let Some(prefix) = scope {
                    paths.retain(|p| p.starts_with(prefix));
                }
                info!(files = paths.len(), "batch discovery scan complete");
                for path in paths {
                    self.queue
                        .enqueue(
                            JobPayload::FileExtraction {
                                path: path.to_string_lossy().to_string(),
                            },
                            JobPriority::Background,
                        )
                        .await?;
                }
                Ok(())
            }
            JobPayload::Correlation {} => self.engine.run().await.map(|_| ()),
            JobPayload::Transcribe { file_id } => {
                bail!("no transcription provider configured (file {})", file_id)
            }
            JobPayload::VisionAnalyze { file_id } => {
                bail!("no vision provider configured (file {})", file_id)
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Single-instance lock file in the data directory. A live holder refuses
/// the new instance; a stale file (dead pid) is replaced.
struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        match Self::try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder: Option<u32> = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
                if let Some(pid) = holder {
                    if PathBuf::from(format!("/proc/{}", pid)).exists() {
                        bail!(
                            "another daemon instance (pid {}) holds {}",
                            pid,
                            path.display()
                        );
                    }
                }
                warn!(path = %path.display(), "removing stale instance lock");
                std::fs::remove_file(&path)?;
                Self::try_create(&path)
                    .with_context(|| format!("Cannot acquire instance lock: {}", path.display()))?;
                Ok(Self { path })
            }
            Err(e) => Err(e).with_context(|| format!("Cannot acquire instance lock: {}", path.display())),
        }
    }

    fn try_create(path: &std::path::Path) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        write!(file, "{}", std::process::id())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Entry point for `strata serve`: build the runtime state and run to
/// completion.
pub async fn run(config: Config) -> Result<()> {
    let daemon = Daemon::start(config).await?;
    daemon.serve().await
}
