//! Job queue durability, ordering, and crash recovery.

use tempfile::TempDir;

use strata::queue::{JobPayload, JobPriority, JobQueue, JobStatus};
use strata::{db, migrate};

async fn queue_in(tmp: &TempDir) -> JobQueue {
    let pool = db::connect(&tmp.path().join("jobs.sqlite")).await.unwrap();
    migrate::migrate_jobs(&pool).await.unwrap();
    JobQueue::new(pool, 3, 256)
}

fn extraction(path: &str) -> JobPayload {
    JobPayload::FileExtraction {
        path: path.to_string(),
    }
}

#[tokio::test]
async fn test_enqueue_is_durable_before_return() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    let id = queue
        .enqueue(extraction("/x/a.md"), JobPriority::Normal)
        .await
        .unwrap();

    // A second handle over the same database sees the row.
    let pool = db::connect(&tmp.path().join("jobs.sqlite")).await.unwrap();
    let other = JobQueue::new(pool, 3, 256);
    let job = other.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.payload, extraction("/x/a.md"));
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    let first = queue
        .enqueue(extraction("/x/1.md"), JobPriority::Normal)
        .await
        .unwrap();
    let second = queue
        .enqueue(extraction("/x/2.md"), JobPriority::Normal)
        .await
        .unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    queue
        .complete(&claimed.id, JobStatus::Succeeded, None)
        .await
        .unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, second);
}

#[tokio::test]
async fn test_priority_beats_arrival_order() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    queue
        .enqueue(extraction("/x/background.md"), JobPriority::Background)
        .await
        .unwrap();
    let urgent = queue
        .enqueue(JobPayload::Correlation {}, JobPriority::User)
        .await
        .unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, urgent);
}

#[tokio::test]
async fn test_at_most_one_running() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    queue
        .enqueue(extraction("/x/a.md"), JobPriority::Normal)
        .await
        .unwrap();
    queue
        .enqueue(extraction("/x/b.md"), JobPriority::Normal)
        .await
        .unwrap();

    let first = queue.claim_next().await.unwrap().unwrap();
    // Second claim refuses while the first is still running.
    assert!(queue.claim_next().await.unwrap().is_none());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.running, 1);

    queue
        .complete(&first.id, JobStatus::Succeeded, None)
        .await
        .unwrap();
    assert!(queue.claim_next().await.unwrap().is_some());
}

#[tokio::test]
async fn test_crash_recovery_requeues_with_attempt_increment() {
    let tmp = TempDir::new().unwrap();

    let interrupted_id;
    {
        let queue = queue_in(&tmp).await;
        for i in 0..3 {
            queue
                .enqueue(extraction(&format!("/x/{}.md", i)), JobPriority::Normal)
                .await
                .unwrap();
        }
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        interrupted_id = claimed.id;
        // Daemon dies here with the job still running.
    }

    let queue = queue_in(&tmp).await;
    let requeued = queue.recover().await.unwrap();
    assert_eq!(requeued, 1);

    let job = queue.get(&interrupted_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 2);
    assert!(job.started_at.is_none());

    // No job is left running after recovery.
    assert!(queue.current().await.unwrap().is_none());

    // The interrupted job is claimable again, ahead of its peers.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, interrupted_id);
}

#[tokio::test]
async fn test_attempt_ceiling_fails_terminally() {
    let tmp = TempDir::new().unwrap();

    let id = {
        let queue = queue_in(&tmp).await;
        let id = queue
            .enqueue(extraction("/x/poison.md"), JobPriority::Normal)
            .await
            .unwrap();
        queue.claim_next().await.unwrap().unwrap();
        id
    };

    // Crash-loop: each restart recovers, re-claims, crashes again.
    for _ in 0..2 {
        let queue = queue_in(&tmp).await;
        queue.recover().await.unwrap();
        if queue.claim_next().await.unwrap().is_none() {
            break;
        }
    }

    let queue = queue_in(&tmp).await;
    queue.recover().await.unwrap();

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.attempts > 3);
    assert!(job.last_error.is_some());
}

#[tokio::test]
async fn test_recent_ring_is_bounded() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("jobs.sqlite")).await.unwrap();
    migrate::migrate_jobs(&pool).await.unwrap();
    let queue = JobQueue::new(pool, 3, 4);

    for i in 0..6 {
        let id = queue
            .enqueue(extraction(&format!("/x/{}.md", i)), JobPriority::Normal)
            .await
            .unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        queue
            .complete(&id, JobStatus::Succeeded, None)
            .await
            .unwrap();
    }

    let recent = queue.recent(100);
    assert_eq!(recent.len(), 4, "ring must stay bounded");
    // Newest first.
    assert_eq!(
        recent[0].payload,
        extraction("/x/5.md"),
        "most recent job leads"
    );
}

#[tokio::test]
async fn test_failed_job_records_error() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    let id = queue
        .enqueue(extraction("/x/broken.md"), JobPriority::Normal)
        .await
        .unwrap();
    queue.claim_next().await.unwrap().unwrap();
    queue
        .complete(&id, JobStatus::Failed, Some("Cannot read file: /x/broken.md"))
        .await
        .unwrap();

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.last_error.as_deref(),
        Some("Cannot read file: /x/broken.md")
    );
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_stats_by_type() {
    let tmp = TempDir::new().unwrap();
    let queue = queue_in(&tmp).await;

    queue
        .enqueue(extraction("/x/a.md"), JobPriority::Normal)
        .await
        .unwrap();
    queue
        .enqueue(JobPayload::Correlation {}, JobPriority::User)
        .await
        .unwrap();
    queue
        .enqueue(
            JobPayload::FaeImport {
                path: "/x/conversations.json".to_string(),
                provider: None,
            },
            JobPriority::Import,
        )
        .await
        .unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.by_type.get("file_extraction"), Some(&1));
    assert_eq!(stats.by_type.get("correlation"), Some(&1));
    assert_eq!(stats.by_type.get("fae_import"), Some(&1));
}
