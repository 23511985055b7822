//! Correlation engine end-to-end: consolidation, bounded co-occurrence,
//! pattern detection, discovery surfacing, and feedback stickiness.

use std::sync::Arc;
use tempfile::TempDir;

use strata::catalog::Catalog;
use strata::config::CorrelationConfig;
use strata::correlate::CorrelationEngine;
use strata::discovery::apply_feedback;
use strata::entities::normalize;
use strata::models::{
    chunk_id, ChunkKind, ChunkRecord, DiscoveryStatus, EntityOccurrence, EntityType, FileRecord,
    FileStatus, PatternType,
};
use strata::tracker::OperationTracker;
use strata::{db, migrate};

async fn setup(tmp: &TempDir) -> (Catalog, Arc<OperationTracker>) {
    let catalog_pool = db::connect(&tmp.path().join("catalog.sqlite")).await.unwrap();
    migrate::migrate_catalog(&catalog_pool).await.unwrap();

    let jobs_pool = db::connect(&tmp.path().join("jobs.sqlite")).await.unwrap();
    migrate::migrate_jobs(&jobs_pool).await.unwrap();

    (
        Catalog::new(catalog_pool),
        Arc::new(OperationTracker::new(jobs_pool)),
    )
}

fn engine(catalog: &Catalog, tracker: &Arc<OperationTracker>) -> CorrelationEngine {
    CorrelationEngine::new(catalog.clone(), tracker.clone(), CorrelationConfig::default())
}

/// Insert an indexed file with one chunk and the given entity mentions.
async fn seed_file(
    catalog: &Catalog,
    file_id: &str,
    path: &str,
    indexed_at: i64,
    mentions: &[(EntityType, &str)],
) {
    let record = FileRecord {
        id: file_id.to_string(),
        path: path.to_string(),
        extension: "md".to_string(),
        size_bytes: 64,
        modified_at: indexed_at,
        status: FileStatus::Indexed,
        last_error: None,
        discovered_at: indexed_at,
        indexed_at: Some(indexed_at),
        content_hash: None,
        word_count: Some(10),
    };
    catalog.upsert_file(&record).await.unwrap();

    let cid = chunk_id(file_id, 0);
    let chunk = ChunkRecord {
        id: cid.clone(),
        file_id: file_id.to_string(),
        ordinal: 0,
        text: mentions
            .iter()
            .map(|(_, v)| *v)
            .collect::<Vec<_>>()
            .join(" "),
        token_count: mentions.len() as i64,
        start_byte: 0,
        end_byte: 64,
        kind: ChunkKind::Prose,
    };

    let occurrences: Vec<EntityOccurrence> = mentions
        .iter()
        .enumerate()
        .map(|(i, (entity_type, value))| EntityOccurrence {
            id: format!("{}-e{:03}", cid, i),
            file_id: file_id.to_string(),
            chunk_id: cid.clone(),
            entity_type: *entity_type,
            value: value.to_string(),
            normalized: normalize(value),
            confidence: 0.9,
        })
        .collect();

    catalog
        .replace_chunks(file_id, &[chunk], &occurrences)
        .await
        .unwrap();
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

const DAY: i64 = 86_400;

#[tokio::test]
async fn test_workflow_series_surfaces_discovery() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    for month in 1..=4 {
        seed_file(
            &catalog,
            &format!("f{}", month),
            &format!("/docs/2024-{:02}-05-report.md", month),
            now(),
            &[],
        )
        .await;
    }

    let result = engine(&catalog, &tracker).run().await.unwrap();
    assert!(result.patterns_detected >= 1);
    assert_eq!(result.discoveries_created, 1);

    let patterns = catalog.list_patterns(0.0).await.unwrap();
    let workflow = patterns
        .iter()
        .find(|p| p.pattern_type == PatternType::Workflow)
        .expect("workflow pattern");
    assert_eq!(workflow.source_files.len(), 4);
    for id in ["f1", "f2", "f3", "f4"] {
        assert!(workflow.source_files.contains(&id.to_string()));
    }
    assert!(!workflow.source_files.is_empty());

    let discoveries = catalog.list_discoveries(false).await.unwrap();
    assert_eq!(discoveries.len(), 1);
    assert!(discoveries[0].confidence >= 0.7);
    assert_eq!(discoveries[0].status, DiscoveryStatus::New);
    assert_eq!(discoveries[0].source_files.len(), 4);
}

#[tokio::test]
async fn test_relationship_discovery_from_cooccurrence() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    // Alice and Acme Corp together in five files spread over 400 days.
    for i in 0..5i64 {
        seed_file(
            &catalog,
            &format!("r{}", i),
            &format!("/notes/meeting-{}.md", i),
            now() - (400 - i * 100) * DAY,
            &[
                (EntityType::Person, "Alice"),
                (EntityType::Org, "Acme Corp"),
            ],
        )
        .await;
    }

    let result = engine(&catalog, &tracker).run().await.unwrap();
    assert!(result.entities_consolidated >= 2);
    assert!(result.co_occurrence_pairs >= 1);

    let patterns = catalog.list_patterns(0.0).await.unwrap();
    let relationship = patterns
        .iter()
        .find(|p| p.pattern_type == PatternType::Relationship)
        .expect("relationship pattern");
    assert!(relationship.title.contains("Alice"));
    assert!(relationship.title.contains("Acme Corp"));
    assert_eq!(relationship.source_files.len(), 5);

    let discoveries = catalog.list_discoveries(false).await.unwrap();
    assert!(
        discoveries
            .iter()
            .any(|d| d.discovery_type == PatternType::Relationship),
        "relationship should clear the promotion thresholds"
    );
}

#[tokio::test]
async fn test_every_discovery_satisfies_thresholds() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    for i in 0..5i64 {
        seed_file(
            &catalog,
            &format!("r{}", i),
            &format!("/notes/sync-{}.md", i),
            now() - (400 - i * 100) * DAY,
            &[
                (EntityType::Person, "Alice"),
                (EntityType::Org, "Acme Corp"),
                (EntityType::Tech, "Docker"),
            ],
        )
        .await;
    }
    for month in 1..=3 {
        seed_file(
            &catalog,
            &format!("w{}", month),
            &format!("/docs/2024-{:02}-01-journal.md", month),
            now(),
            &[],
        )
        .await;
    }

    engine(&catalog, &tracker).run().await.unwrap();

    let config = CorrelationConfig::default();
    for discovery in catalog.list_discoveries(true).await.unwrap() {
        assert!(
            discovery.confidence >= config.min_confidence,
            "{} below confidence threshold: {}",
            discovery.id,
            discovery.confidence
        );
        assert!(
            discovery.source_files.len() >= config.min_sources,
            "{} has too few sources",
            discovery.id
        );
    }
}

#[tokio::test]
async fn test_consolidation_idempotent_across_runs() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    seed_file(
        &catalog,
        "f1",
        "/a.md",
        now(),
        &[
            (EntityType::Person, "Mike"),
            (EntityType::Tech, "Rust"),
        ],
    )
    .await;
    seed_file(
        &catalog,
        "f2",
        "/b.md",
        now(),
        &[
            (EntityType::Person, "Michael"),
            (EntityType::Tech, "rust"),
        ],
    )
    .await;

    let engine = engine(&catalog, &tracker);
    engine.run().await.unwrap();
    let first = catalog.list_consolidated(None, 100).await.unwrap();

    engine.run().await.unwrap();
    let second = catalog.list_consolidated(None, 100).await.unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.occurrence_count, b.occurrence_count);
        assert_eq!(a.file_ids, b.file_ids);
    }

    // Mike + Michael merged into one PERSON.
    let persons: Vec<_> = first
        .iter()
        .filter(|e| e.entity_type == EntityType::Person)
        .collect();
    assert_eq!(persons.len(), 1);
    assert_eq!(persons[0].occurrence_count, 2);
}

#[tokio::test]
async fn test_confirmed_discovery_locked_against_supersession() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    // Two independent series; one will be confirmed, one left alone.
    for month in 1..=4 {
        seed_file(
            &catalog,
            &format!("a{}", month),
            &format!("/docs/2024-{:02}-05-report.md", month),
            now(),
            &[],
        )
        .await;
        seed_file(
            &catalog,
            &format!("b{}", month),
            &format!("/docs/2024-{:02}-01-journal.md", month),
            now(),
            &[],
        )
        .await;
    }

    let engine = engine(&catalog, &tracker);
    engine.run().await.unwrap();

    let discoveries = catalog.list_discoveries(false).await.unwrap();
    assert_eq!(discoveries.len(), 2);

    let confirmed_id = discoveries
        .iter()
        .find(|d| d.title.contains("report"))
        .unwrap()
        .id
        .clone();
    let other_id = discoveries
        .iter()
        .find(|d| d.title.contains("journal"))
        .unwrap()
        .id
        .clone();

    assert!(apply_feedback(&catalog, &confirmed_id, "confirm", Some("accurate"))
        .await
        .unwrap());

    // Remove the evidence: all series files leave the indexed set.
    for month in 1..=4 {
        for prefix in ["a", "b"] {
            catalog
                .update_file_status(&format!("{}{}", prefix, month), FileStatus::Skipped, None)
                .await
                .unwrap();
        }
    }

    engine.run().await.unwrap();

    let confirmed = catalog.get_discovery(&confirmed_id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, DiscoveryStatus::Confirmed);
    assert_eq!(confirmed.user_notes.as_deref(), Some("accurate"));

    let superseded = catalog.get_discovery(&other_id).await.unwrap().unwrap();
    assert_eq!(superseded.status, DiscoveryStatus::Superseded);
}

#[tokio::test]
async fn test_discovery_confidence_never_weakens_in_place() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    // Five-file series scores higher than the later four-file rerun.
    for month in 1..=5 {
        seed_file(
            &catalog,
            &format!("s{}", month),
            &format!("/docs/2024-{:02}-05-report.md", month),
            now(),
            &[],
        )
        .await;
    }

    let engine = engine(&catalog, &tracker);
    engine.run().await.unwrap();
    let before = &catalog.list_discoveries(false).await.unwrap()[0];
    let (id, confidence_before) = (before.id.clone(), before.confidence);

    // One file drops out; the series still qualifies but scores lower.
    catalog
        .update_file_status("s5", FileStatus::Skipped, None)
        .await
        .unwrap();
    engine.run().await.unwrap();

    let after = catalog.get_discovery(&id).await.unwrap().unwrap();
    assert!(
        after.confidence >= confidence_before,
        "confidence weakened in place: {} -> {}",
        confidence_before,
        after.confidence
    );
    assert_ne!(after.status, DiscoveryStatus::Superseded);
}

#[tokio::test]
async fn test_cooccurrence_bounds_respected_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    // 12 files × 8 shared entities: far more candidate pairs than the caps.
    let names: Vec<String> = (0..8).map(|i| format!("SystemAlpha{}", i)).collect();
    for f in 0..12 {
        let mentions: Vec<(EntityType, &str)> = names
            .iter()
            .map(|n| (EntityType::Tech, n.as_str()))
            .collect();
        seed_file(
            &catalog,
            &format!("x{:02}", f),
            &format!("/src/module-{:02}.rs", f),
            now(),
            &mentions,
        )
        .await;
    }

    let config = CorrelationConfig {
        max_entities: 6,
        max_pairs_per_file: 5,
        max_total_pairs: 10,
        ..CorrelationConfig::default()
    };
    let engine = CorrelationEngine::new(catalog.clone(), tracker.clone(), config);

    let result = engine.run().await.unwrap();
    assert_eq!(result.entities_consolidated, 8);
    assert!(
        result.co_occurrence_pairs <= 10,
        "pair cap violated: {}",
        result.co_occurrence_pairs
    );
    assert!(result.dropped_pairs > 0, "excess pairs must be observable");
}

#[tokio::test]
async fn test_patterns_replaced_wholesale_per_run() {
    let tmp = TempDir::new().unwrap();
    let (catalog, tracker) = setup(&tmp).await;

    for month in 1..=4 {
        seed_file(
            &catalog,
            &format!("f{}", month),
            &format!("/docs/2024-{:02}-05-report.md", month),
            now(),
            &[],
        )
        .await;
    }

    let engine = engine(&catalog, &tracker);
    engine.run().await.unwrap();
    assert!(!catalog.list_patterns(0.0).await.unwrap().is_empty());

    for month in 1..=4 {
        catalog
            .update_file_status(&format!("f{}", month), FileStatus::Skipped, None)
            .await
            .unwrap();
    }
    engine.run().await.unwrap();

    assert!(
        catalog.list_patterns(0.0).await.unwrap().is_empty(),
        "stale patterns must not survive a rerun"
    );
}
