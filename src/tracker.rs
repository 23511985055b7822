//! Operation tracking and telemetry.
//!
//! One process-wide slot describes the currently executing heavy operation
//! (kind, elapsed, ETA, stage tag); it is replaced atomically on every
//! transition so control-plane reads never observe a half-written state.
//! Completion durations are persisted per kind in the jobs database, and
//! the ETA for a new run is the rolling mean of the last runs of the same
//! kind.
//!
//! The telemetry snapshot adds process CPU/memory (procfs; absent →
//! unavailable), a GPU probe via `nvidia-smi` (absent → unavailable, not an
//! error), storage sizes, and catalog rollups.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// How many prior runs feed the rolling-mean ETA.
const ETA_HISTORY: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Extraction,
    Correlation,
    Transcription,
    Vision,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Extraction => "extraction",
            OperationKind::Correlation => "correlation",
            OperationKind::Transcription => "transcription",
            OperationKind::Vision => "vision",
        }
    }
}

/// The running operation, one variant per kind. Kept polymorphic rather
/// than as a bag of optional fields so a stage tag cannot leak between
/// kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Extraction { path: String },
    Correlation { stage: String },
    Transcription { file_id: String },
    Vision { file_id: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Extraction { .. } => OperationKind::Extraction,
            Operation::Correlation { .. } => OperationKind::Correlation,
            Operation::Transcription { .. } => OperationKind::Transcription,
            Operation::Vision { .. } => OperationKind::Vision,
        }
    }

    pub fn details(&self) -> String {
        match self {
            Operation::Extraction { path } => path.clone(),
            Operation::Correlation { stage } => stage.clone(),
            Operation::Transcription { file_id } | Operation::Vision { file_id } => file_id.clone(),
        }
    }
}

struct ActiveOperation {
    operation: Operation,
    started_wall: i64,
    started: Instant,
    eta_seconds: Option<f64>,
}

/// Point-in-time view of the current operation for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub kind: OperationKind,
    pub details: String,
    pub started_at: i64,
    pub elapsed_seconds: f64,
    pub eta_seconds: Option<f64>,
}

pub struct OperationTracker {
    slot: Mutex<Option<ActiveOperation>>,
    pool: SqlitePool,
}

impl OperationTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            slot: Mutex::new(None),
            pool,
        }
    }

    /// Enter an operation, deriving its ETA from prior runs of the kind.
    pub async fn begin(&self, operation: Operation) -> Result<()> {
        let eta = self.mean_duration(operation.kind()).await?;
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(ActiveOperation {
            operation,
            started_wall: Utc::now().timestamp(),
            started: Instant::now(),
            eta_seconds: eta,
        });
        Ok(())
    }

    /// Replace the operation payload (stage transition) keeping start/ETA.
    pub fn update(&self, operation: Operation) {
        let mut slot = self.slot.lock().unwrap();
        if let Some(active) = slot.as_mut() {
            active.operation = operation;
        }
    }

    /// Exit the current operation and persist its duration for future ETAs.
    pub async fn finish(&self) -> Result<()> {
        let finished = {
            let mut slot = self.slot.lock().unwrap();
            slot.take()
        };

        if let Some(active) = finished {
            let duration = active.started.elapsed().as_secs_f64();
            sqlx::query(
                "INSERT INTO operation_history (kind, started_at, duration_secs) VALUES (?, ?, ?)",
            )
            .bind(active.operation.kind().as_str())
            .bind(active.started_wall)
            .bind(duration)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub fn snapshot(&self) -> Option<OperationSnapshot> {
        let slot = self.slot.lock().unwrap();
        slot.as_ref().map(|active| OperationSnapshot {
            kind: active.operation.kind(),
            details: active.operation.details(),
            started_at: active.started_wall,
            elapsed_seconds: active.started.elapsed().as_secs_f64(),
            eta_seconds: active.eta_seconds,
        })
    }

    async fn mean_duration(&self, kind: OperationKind) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT AVG(duration_secs) AS mean FROM (
                SELECT duration_secs FROM operation_history
                WHERE kind = ? ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(ETA_HISTORY)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Option<f64>, _>("mean"))
    }
}

// ============ System probes ============

#[derive(Debug, Clone, Serialize, Default)]
pub struct SystemStats {
    pub cpu_percent: Option<f64>,
    pub memory_rss_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStats {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_mb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub catalog_bytes: u64,
    pub jobs_bytes: u64,
    pub vectors_bytes: u64,
}

/// CPU sampling needs two observations; the previous one lives here.
static CPU_SAMPLE: Mutex<Option<(Instant, u64)>> = Mutex::new(None);

/// Process CPU percent and resident memory from procfs. Unreadable (or
/// non-Linux) values come back as `None`, never as an error.
pub fn system_stats() -> SystemStats {
    SystemStats {
        cpu_percent: cpu_percent(),
        memory_rss_bytes: memory_rss_bytes(),
    }
}

fn memory_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

fn cpu_percent() -> Option<f64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15 (utime, stime) follow the parenthesized command name.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = utime + stime;
    let now = Instant::now();

    let mut sample = CPU_SAMPLE.lock().unwrap();
    let result = sample.map(|(prev_t, prev_ticks)| {
        let wall = now.duration_since(prev_t).as_secs_f64();
        if wall <= 0.0 {
            return 0.0;
        }
        let tick_hz = 100.0; // USER_HZ on effectively all Linux targets
        ((ticks.saturating_sub(prev_ticks)) as f64 / tick_hz / wall) * 100.0
    });
    *sample = Some((now, ticks));
    result
}

/// GPU utilization via the external `nvidia-smi` probe. A missing or
/// failing probe reports unavailable.
pub fn gpu_stats() -> GpuStats {
    let unavailable = GpuStats {
        available: false,
        name: None,
        utilization_percent: None,
        memory_used_mb: None,
        memory_total_mb: None,
    };

    let output = match std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return unavailable,
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let Some(line) = text.lines().next() else {
        return unavailable;
    };
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 4 {
        return unavailable;
    }

    GpuStats {
        available: true,
        name: Some(parts[0].to_string()),
        utilization_percent: parts[1].parse().ok(),
        memory_used_mb: parts[2].parse().ok(),
        memory_total_mb: parts[3].parse().ok(),
    }
}

pub fn storage_stats(catalog: &Path, jobs: &Path, vectors_dir: &Path) -> StorageStats {
    StorageStats {
        catalog_bytes: file_size(catalog),
        jobs_bytes: file_size(jobs),
        vectors_bytes: dir_size(vectors_dir),
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_and_details() {
        let op = Operation::Correlation {
            stage: "co_occurrence".to_string(),
        };
        assert_eq!(op.kind(), OperationKind::Correlation);
        assert_eq!(op.details(), "co_occurrence");

        let op = Operation::Extraction {
            path: "/x/a.md".to_string(),
        };
        assert_eq!(op.kind(), OperationKind::Extraction);
    }

    #[test]
    fn test_gpu_probe_never_errors() {
        // With or without a GPU on the host, the probe must return a value.
        let stats = gpu_stats();
        if !stats.available {
            assert!(stats.name.is_none());
        }
    }
}
