//! Correlation engine orchestration.
//!
//! One batch run: consolidate → co-occurrence → detect → surface. The
//! stages are CPU-bound and run on blocking worker threads via
//! `spawn_blocking`; the orchestrator awaits them cooperatively so health
//! and telemetry requests stay responsive throughout. The Operation
//! Tracker carries a stage tag the whole way and an ETA derived from prior
//! runs.
//!
//! Runs are serialized by an engine-level async mutex; the job queue
//! already serializes queued correlation against extraction, and the
//! mutex extends the same guarantee to the synchronous control-plane path.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::CorrelationConfig;
use crate::consolidate::{build_cooccurrence, consolidate, CoOccurrenceBounds};
use crate::discovery::surface;
use crate::models::FileStatus;
use crate::patterns::detect_all;
use crate::tracker::{Operation, OperationTracker};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationResult {
    pub entities_consolidated: usize,
    pub co_occurrence_pairs: usize,
    pub dropped_pairs: u64,
    pub patterns_detected: usize,
    pub discoveries_created: usize,
    pub discoveries_updated: usize,
    pub discoveries_superseded: usize,
    pub consolidation_secs: f64,
    pub detection_secs: f64,
    pub surfacing_secs: f64,
    pub total_secs: f64,
}

pub struct CorrelationEngine {
    catalog: Catalog,
    tracker: Arc<OperationTracker>,
    config: CorrelationConfig,
    run_lock: Mutex<()>,
}

impl CorrelationEngine {
    pub fn new(catalog: Catalog, tracker: Arc<OperationTracker>, config: CorrelationConfig) -> Self {
        Self {
            catalog,
            tracker,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Run the full correlation batch. Returns run statistics.
    pub async fn run(&self) -> Result<CorrelationResult> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        let mut result = CorrelationResult::default();

        self.tracker
            .begin(Operation::Correlation {
                stage: "consolidate".to_string(),
            })
            .await?;

        let outcome = self.run_stages(&mut result).await;

        self.tracker.finish().await?;
        result.total_secs = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                self.catalog
                    .log_audit(
                        "correlation_run",
                        "correlation",
                        "batch",
                        Some(&serde_json::to_string(&result)?),
                    )
                    .await?;
                info!(
                    entities = result.entities_consolidated,
                    pairs = result.co_occurrence_pairs,
                    patterns = result.patterns_detected,
                    discoveries = result.discoveries_created,
                    secs = result.total_secs,
                    "correlation complete"
                );
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_stages(&self, result: &mut CorrelationResult) -> Result<()> {
        // Stage 1: consolidation (worker thread).
        let stage_start = Instant::now();
        let rows = self.catalog.iter_entities().await?;
        let consolidated = tokio::task::spawn_blocking(move || consolidate(&rows)).await?;
        self.catalog.replace_consolidated(&consolidated).await?;
        result.entities_consolidated = consolidated.len();

        // Stage 2: bounded co-occurrence (worker thread).
        self.tracker.update(Operation::Correlation {
            stage: "co_occurrence".to_string(),
        });
        let bounds = CoOccurrenceBounds {
            max_entities: self.config.max_entities,
            max_pairs_per_file: self.config.max_pairs_per_file,
            max_total_pairs: self.config.max_total_pairs,
        };
        let matrix =
            tokio::task::spawn_blocking(move || build_cooccurrence(consolidated, bounds)).await?;
        result.co_occurrence_pairs = matrix.pairs.len();
        result.dropped_pairs = matrix.dropped_pairs;
        result.consolidation_secs = stage_start.elapsed().as_secs_f64();

        // Stage 3: pattern detection (worker thread).
        self.tracker.update(Operation::Correlation {
            stage: "detect".to_string(),
        });
        let stage_start = Instant::now();
        let files = self.catalog.iter_files(FileStatus::Indexed).await?;
        let now = Utc::now().timestamp();
        let patterns =
            tokio::task::spawn_blocking(move || detect_all(&files, &matrix, now)).await?;
        self.catalog.replace_patterns(&patterns).await?;
        result.patterns_detected = patterns.len();
        result.detection_secs = stage_start.elapsed().as_secs_f64();

        // Stage 4: discovery surfacing (catalog writes, already async).
        self.tracker.update(Operation::Correlation {
            stage: "surface".to_string(),
        });
        let stage_start = Instant::now();
        let report = surface(
            &self.catalog,
            &patterns,
            self.config.min_confidence,
            self.config.min_sources,
        )
        .await?;
        result.discoveries_created = report.created;
        result.discoveries_updated = report.updated;
        result.discoveries_superseded = report.superseded;
        result.surfacing_secs = stage_start.elapsed().as_secs_f64();

        Ok(())
    }
}
