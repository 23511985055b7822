//! Durable job queue.
//!
//! SQLite-backed (its own database file, WAL) FIFO with typed payloads and
//! a status lifecycle: pending → running → {succeeded, failed, cancelled}.
//! Producers are the watcher, the control plane, and batch discovery; the
//! daemon runs a single consumer loop, and `claim_next` additionally
//! refuses to hand out work while another job is running, so at most one
//! job is in flight regardless of producer count.
//!
//! Durability: `enqueue` persists before returning. On startup,
//! [`JobQueue::recover`] re-queues jobs left `running` by a crash as
//! `pending` with an incremented attempt count; a job whose attempts exceed
//! the configured ceiling is failed terminally with its last error.
//!
//! Terminal jobs are mirrored into a bounded in-memory ring (default 256)
//! that backs `recent(n)` without unbounded growth.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FileExtraction,
    BatchExtraction,
    FaeImport,
    Correlation,
    Transcribe,
    VisionAnalyze,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FileExtraction => "file_extraction",
            JobType::BatchExtraction => "batch_extraction",
            JobType::FaeImport => "fae_import",
            JobType::Correlation => "correlation",
            JobType::Transcribe => "transcribe",
            JobType::VisionAnalyze => "vision_analyze",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_extraction" => Some(JobType::FileExtraction),
            "batch_extraction" => Some(JobType::BatchExtraction),
            "fae_import" => Some(JobType::FaeImport),
            "correlation" => Some(JobType::Correlation),
            "transcribe" => Some(JobType::Transcribe),
            "vision_analyze" => Some(JobType::VisionAnalyze),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Lower number claims first; FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    User = 1,
    Import = 2,
    Normal = 3,
    Scheduled = 4,
    Background = 5,
}

/// Type-specific job payloads. The serde tag doubles as the `job_type`
/// column so an invalid payload/type combination cannot be represented.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    FileExtraction { path: String },
    BatchExtraction { scope: Option<String> },
    FaeImport { path: String, provider: Option<String> },
    Correlation {},
    Transcribe { file_id: String },
    VisionAnalyze { file_id: String },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::FileExtraction { .. } => JobType::FileExtraction,
            JobPayload::BatchExtraction { .. } => JobType::BatchExtraction,
            JobPayload::FaeImport { .. } => JobType::FaeImport,
            JobPayload::Correlation {} => JobType::Correlation,
            JobPayload::Transcribe { .. } => JobType::Transcribe,
            JobPayload::VisionAnalyze { .. } => JobType::VisionAnalyze,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded_total: i64,
    pub failed_total: i64,
    pub cancelled_total: i64,
    pub by_type: BTreeMap<String, i64>,
}

pub struct JobQueue {
    pool: SqlitePool,
    max_attempts: i64,
    ring_capacity: usize,
    recent: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, max_attempts: i64, ring_capacity: usize) -> Self {
        Self {
            pool,
            max_attempts,
            ring_capacity,
            recent: Mutex::new(VecDeque::with_capacity(ring_capacity)),
        }
    }

    /// Append a job; the row is durable before the id is returned.
    pub async fn enqueue(&self, payload: JobPayload, priority: JobPriority) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, priority, payload, created_at, attempts)
            VALUES (?, ?, 'pending', ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(payload.job_type().as_str())
        .bind(priority as i64)
        .bind(serde_json::to_string(&payload)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim the oldest pending job at the highest priority.
    /// Returns `None` when the queue is empty or another job is running.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs WHERE status = 'pending'
                ORDER BY priority, created_at, rowid LIMIT 1
            )
            AND NOT EXISTS (SELECT 1 FROM jobs WHERE status = 'running')
            RETURNING *
            "#,
        )
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_job).transpose()
    }

    /// Mark a job terminal and mirror it into the recent ring.
    pub async fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal(), "complete() requires a terminal status");

        sqlx::query("UPDATE jobs SET status = ?, finished_at = ?, last_error = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if let Some(job) = self.get(job_id).await? {
            let mut ring = self.recent.lock().unwrap();
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(job);
        }

        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// The currently running job, if any.
    pub async fn current(&self) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE status = 'running' LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// Most recent terminal jobs, newest first, served from the bounded ring.
    pub fn recent(&self, n: usize) -> Vec<Job> {
        let ring = self.recent.lock().unwrap();
        ring.iter().rev().take(n).cloned().collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            by_status.insert(row.get::<String, _>("status"), row.get::<i64, _>("n"));
        }

        let type_rows = sqlx::query("SELECT job_type, COUNT(*) AS n FROM jobs GROUP BY job_type")
            .fetch_all(&self.pool)
            .await?;
        let by_type = type_rows
            .into_iter()
            .map(|r| (r.get::<String, _>("job_type"), r.get::<i64, _>("n")))
            .collect();

        Ok(QueueStats {
            pending: by_status.get("pending").copied().unwrap_or(0),
            running: by_status.get("running").copied().unwrap_or(0),
            succeeded_total: by_status.get("succeeded").copied().unwrap_or(0),
            failed_total: by_status.get("failed").copied().unwrap_or(0),
            cancelled_total: by_status.get("cancelled").copied().unwrap_or(0),
            by_type,
        })
    }

    /// Startup recovery: jobs left `running` by a crash go back to
    /// `pending` with an incremented attempt count; past the ceiling they
    /// fail terminally. Also seeds the recent ring from the last completed
    /// jobs.
    pub async fn recover(&self) -> Result<u64> {
        let interrupted = sqlx::query("SELECT * FROM jobs WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;

        let mut requeued = 0u64;
        for row in interrupted {
            let job = row_to_job(row)?;
            let attempts = job.attempts + 1;

            if attempts > self.max_attempts {
                warn!(job_id = %job.id, attempts, "attempt ceiling exceeded, failing terminally");
                sqlx::query(
                    "UPDATE jobs SET status = 'failed', finished_at = ?, attempts = ?, last_error = COALESCE(last_error, 'attempt ceiling exceeded') WHERE id = ?",
                )
                .bind(Utc::now().timestamp())
                .bind(attempts)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', started_at = NULL, attempts = ? WHERE id = ?",
                )
                .bind(attempts)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(requeued, "re-queued jobs interrupted by shutdown or crash");
        }

        // Seed the ring so `recent` is useful immediately after restart.
        let recent_rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('succeeded', 'failed', 'cancelled')
            ORDER BY COALESCE(finished_at, started_at, created_at) DESC
            LIMIT ?
            "#,
        )
        .bind(self.ring_capacity as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut ring = self.recent.lock().unwrap();
        ring.clear();
        for row in recent_rows.into_iter().rev() {
            ring.push_back(row_to_job(row)?);
        }

        Ok(requeued)
    }

    /// Drop terminal jobs older than `days`. Housekeeping, run at startup.
    pub async fn cleanup_old_jobs(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - days * 86_400;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('succeeded', 'failed', 'cancelled') AND finished_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let payload_json: String = row.get("payload");
    let payload: JobPayload = serde_json::from_str(&payload_json)?;
    let type_str: String = row.get("job_type");

    Ok(Job {
        id: row.get("id"),
        job_type: JobType::parse(&type_str).unwrap_or(payload.job_type()),
        payload,
        status: JobStatus::parse(&row.get::<String, _>("status")).unwrap_or(JobStatus::Pending),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
    })
}
