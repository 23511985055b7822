//! Discovery surfacing: promoting patterns past thresholds into durable,
//! user-facing discoveries.
//!
//! Promotion requires `confidence >= min_confidence` AND
//! `|source_files| >= min_sources`. Discoveries outlive the patterns that
//! back them:
//!
//! - a discovery's confidence never decreases in place; a lower-scoring
//!   re-detection keeps the old confidence,
//! - a discovery whose backing pattern no longer qualifies is marked
//!   `superseded`, never deleted,
//! - user feedback (`confirmed` / `dismissed`) locks a discovery against
//!   supersession,
//! - a superseded discovery that qualifies again is revived to `new`.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::models::{Discovery, DiscoveryStatus, Pattern};

/// Stable discovery identity: derived from the pattern's type and title so
/// re-detections of the same observation update rather than duplicate.
pub fn discovery_id(pattern: &Pattern) -> String {
    let digest = Sha256::digest(
        format!("{}:{}", pattern.pattern_type.as_str(), pattern.title).as_bytes(),
    );
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("disc-{}", hex)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceReport {
    pub created: usize,
    pub updated: usize,
    pub superseded: usize,
}

/// Reconcile the discovery set against a fresh pattern run.
pub async fn surface(
    catalog: &Catalog,
    patterns: &[Pattern],
    min_confidence: f64,
    min_sources: usize,
) -> Result<SurfaceReport> {
    let now = Utc::now().timestamp();
    let mut report = SurfaceReport::default();

    let qualifying: Vec<&Pattern> = patterns
        .iter()
        .filter(|p| p.confidence >= min_confidence && p.source_files.len() >= min_sources)
        .collect();

    let existing = catalog.list_discoveries(true).await?;

    for pattern in &qualifying {
        let id = discovery_id(pattern);

        match existing.iter().find(|d| d.id == id) {
            None => {
                let discovery = Discovery {
                    id,
                    pattern_id: pattern.id.clone(),
                    discovery_type: pattern.pattern_type,
                    title: pattern.title.clone(),
                    description: pattern.description.clone(),
                    confidence: pattern.confidence,
                    status: DiscoveryStatus::New,
                    source_files: pattern.source_files.clone(),
                    user_notes: None,
                    created_at: now,
                    updated_at: now,
                };
                catalog.upsert_discovery(&discovery).await?;
                report.created += 1;
            }
            Some(previous) => {
                // Never weaken in place; feedback status is preserved, and
                // a superseded discovery that qualifies again is revived.
                let status = match previous.status {
                    DiscoveryStatus::Superseded => DiscoveryStatus::New,
                    other => other,
                };
                let updated = Discovery {
                    id: previous.id.clone(),
                    pattern_id: pattern.id.clone(),
                    discovery_type: previous.discovery_type,
                    title: previous.title.clone(),
                    description: pattern.description.clone(),
                    confidence: previous.confidence.max(pattern.confidence),
                    status,
                    source_files: pattern.source_files.clone(),
                    user_notes: previous.user_notes.clone(),
                    created_at: previous.created_at,
                    updated_at: now,
                };
                catalog.upsert_discovery(&updated).await?;
                report.updated += 1;
            }
        }
    }

    // Demotions: an existing discovery with no qualifying backing pattern
    // is superseded, unless the user has locked it with feedback.
    for discovery in &existing {
        let still_backed = qualifying.iter().any(|p| discovery_id(p) == discovery.id);
        if still_backed {
            continue;
        }
        match discovery.status {
            DiscoveryStatus::Confirmed | DiscoveryStatus::Dismissed => {
                debug!(id = %discovery.id, "discovery locked by feedback, not superseded");
            }
            DiscoveryStatus::Superseded => {}
            DiscoveryStatus::New => {
                catalog
                    .set_discovery_feedback(
                        &discovery.id,
                        DiscoveryStatus::Superseded,
                        discovery.user_notes.as_deref(),
                    )
                    .await?;
                report.superseded += 1;
            }
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        superseded = report.superseded,
        "discoveries surfaced"
    );

    Ok(report)
}

/// Apply user feedback. `confirm` and `dismiss` both lock the discovery
/// against later supersession.
pub async fn apply_feedback(
    catalog: &Catalog,
    id: &str,
    action: &str,
    notes: Option<&str>,
) -> Result<bool> {
    let status = match action {
        "confirm" => DiscoveryStatus::Confirmed,
        "dismiss" => DiscoveryStatus::Dismissed,
        other => anyhow::bail!("action must be 'confirm' or 'dismiss', got '{}'", other),
    };
    catalog.set_discovery_feedback(id, status, notes).await
}
