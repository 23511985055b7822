//! Pattern detectors over the consolidated entities, the co-occurrence
//! matrix, and raw file metadata.
//!
//! Four independent detectors:
//!
//! - **expertise** — fixed multi-domain vocabulary; a domain whose terms
//!   recur across enough distinct files becomes a pattern.
//! - **relationship** — PERSON–ORG and PERSON–PROJECT pairs that co-occur
//!   in at least two files.
//! - **workflow** — filename regularities: date-prefixed series, version
//!   suffixes. Every workflow pattern carries the detected group as its
//!   `source_files`; an empty set here once silently suppressed all
//!   workflow discoveries downstream and is asserted against in tests.
//! - **tech-stack** — dense co-occurrence clusters of TECH entities.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::consolidate::CoOccurrenceMatrix;
use crate::entities::DOMAIN_VOCABULARY;
use crate::models::{ConsolidatedEntity, EntityType, FileRecord, Pattern, PatternType};

/// Inputs to the shared confidence formula.
#[derive(Debug, Clone, Copy)]
pub struct Evidence {
    pub count: i64,
    pub distinct_sources: usize,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
}

/// The shared scoring formula:
///
/// ```text
/// evidence   = min(1, log10(count + 1) / 2)
/// diversity  = min(1, distinct_sources / 5)
/// time_span  = min(1, span_days / 365)
/// recency    = max(0, 1 - days_since_last / 180)
/// confidence = 0.35·evidence + 0.25·diversity + 0.20·time_span + 0.20·recency
/// ```
pub fn score_confidence(evidence: Evidence, now: i64) -> f64 {
    let count_score = (((evidence.count + 1) as f64).log10() / 2.0).min(1.0);
    let diversity = (evidence.distinct_sources as f64 / 5.0).min(1.0);

    let time_span = match (evidence.first_seen, evidence.last_seen) {
        (Some(first), Some(last)) if last > first => {
            (((last - first) as f64 / 86_400.0) / 365.0).min(1.0)
        }
        _ => 0.0,
    };

    let recency = match evidence.last_seen {
        Some(last) => {
            let days_since = ((now - last).max(0)) as f64 / 86_400.0;
            (1.0 - days_since / 180.0).max(0.0)
        }
        None => 0.0,
    };

    0.35 * count_score + 0.25 * diversity + 0.20 * time_span + 0.20 * recency
}

/// Run all detectors. `now` is passed in so scoring is reproducible.
pub fn detect_all(
    files: &[FileRecord],
    matrix: &CoOccurrenceMatrix,
    now: i64,
) -> Vec<Pattern> {
    let mut patterns = Vec::new();
    patterns.extend(detect_expertise(&matrix.entities, now));
    patterns.extend(detect_relationships(matrix, now));
    patterns.extend(detect_workflows(files, now));
    patterns.extend(detect_tech_stacks(matrix, now));
    patterns
}

fn pattern_id(pattern_type: PatternType, title: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", pattern_type.as_str(), title).as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("pat-{}", hex)
}

// ============ Expertise ============

fn detect_expertise(entities: &[ConsolidatedEntity], now: i64) -> Vec<Pattern> {
    let mut patterns = Vec::new();

    for (domain, terms) in DOMAIN_VOCABULARY {
        let matching: Vec<&ConsolidatedEntity> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Tech || e.entity_type == EntityType::Other)
            .filter(|e| {
                let canon = e.canonical.to_lowercase();
                terms.iter().any(|t| *t == canon)
            })
            .collect();

        if matching.len() < 2 {
            continue;
        }

        let mut file_ids: BTreeSet<String> = BTreeSet::new();
        let mut count = 0i64;
        let mut first_seen: Option<i64> = None;
        let mut last_seen: Option<i64> = None;

        for entity in &matching {
            count += entity.occurrence_count;
            file_ids.extend(entity.file_ids.iter().cloned());
            first_seen = merge_min(first_seen, entity.first_seen);
            last_seen = merge_max(last_seen, entity.last_seen);
        }

        if file_ids.len() < 2 {
            continue;
        }

        let confidence = score_confidence(
            Evidence {
                count,
                distinct_sources: file_ids.len(),
                first_seen,
                last_seen,
            },
            now,
        );

        let term_list: Vec<String> = matching.iter().map(|e| e.canonical.clone()).collect();
        let title = format!("Expertise: {}", title_case(domain));

        patterns.push(Pattern {
            id: pattern_id(PatternType::Expertise, &title),
            pattern_type: PatternType::Expertise,
            title,
            description: format!(
                "Recurring {} vocabulary across {} files",
                domain.replace('_', " "),
                file_ids.len()
            ),
            confidence,
            evidence: json!({
                "term_count": count,
                "file_count": file_ids.len(),
                "terms": term_list,
            }),
            source_files: file_ids.into_iter().collect(),
            source_entities: matching.iter().map(|e| e.id.clone()).collect(),
            first_seen,
            last_seen,
        });
    }

    patterns
}

// ============ Relationships ============

fn detect_relationships(matrix: &CoOccurrenceMatrix, now: i64) -> Vec<Pattern> {
    let mut patterns = Vec::new();

    for (&(i, j), cell) in &matrix.pairs {
        if cell.count < 2 {
            continue;
        }

        let a = &matrix.entities[i];
        let b = &matrix.entities[j];

        let (person, other) = match (a.entity_type, b.entity_type) {
            (EntityType::Person, EntityType::Org) | (EntityType::Person, EntityType::Project) => {
                (a, b)
            }
            (EntityType::Org, EntityType::Person) | (EntityType::Project, EntityType::Person) => {
                (b, a)
            }
            _ => continue,
        };

        let verb = if other.entity_type == EntityType::Org {
            "works with"
        } else {
            "works on"
        };

        let confidence = score_confidence(
            Evidence {
                count: cell.count,
                distinct_sources: cell.file_ids.len(),
                first_seen: merge_min(person.first_seen, other.first_seen),
                last_seen: merge_max(person.last_seen, other.last_seen),
            },
            now,
        );

        let title = format!("{} {} {}", person.canonical, verb, other.canonical);

        patterns.push(Pattern {
            id: pattern_id(PatternType::Relationship, &title),
            pattern_type: PatternType::Relationship,
            title,
            description: format!(
                "{} and {} appear together in {} files",
                person.canonical,
                other.canonical,
                cell.file_ids.len()
            ),
            confidence,
            evidence: json!({
                "co_occurrence_count": cell.count,
                "shared_files": cell.file_ids.len(),
            }),
            source_files: cell.file_ids.iter().cloned().collect(),
            source_entities: vec![person.id.clone(), other.id.clone()],
            first_seen: merge_min(person.first_seen, other.first_seen),
            last_seen: merge_max(person.last_seen, other.last_seen),
        });
    }

    patterns.sort_by(|a, b| a.id.cmp(&b.id));
    patterns
}

// ============ Workflows ============

static DATE_SERIES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-_](\d{2})[-_](\d{2})[-_](.+)$").unwrap());
static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[-_]v(\d+)([-_.]|$)").unwrap());

fn detect_workflows(files: &[FileRecord], now: i64) -> Vec<Pattern> {
    struct Series {
        file_ids: Vec<String>,
        dates: Vec<i64>,
    }

    let mut date_series: BTreeMap<String, Series> = BTreeMap::new();
    let mut versioned: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for file in files {
        let Some(name) = std::path::Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
        else {
            continue;
        };

        if let Some(caps) = DATE_SERIES_RE.captures(&name) {
            let stem = caps.get(4).unwrap().as_str().to_string();
            let date = parse_date(
                caps.get(1).unwrap().as_str(),
                caps.get(2).unwrap().as_str(),
                caps.get(3).unwrap().as_str(),
            );
            let series = date_series.entry(stem).or_insert_with(|| Series {
                file_ids: Vec::new(),
                dates: Vec::new(),
            });
            series.file_ids.push(file.id.clone());
            if let Some(d) = date {
                series.dates.push(d);
            }
        }

        if VERSION_RE.is_match(&name) {
            let base = VERSION_RE.replace(&name, "_").to_string();
            versioned.entry(base).or_default().push(file.id.clone());
        }
    }

    let mut patterns = Vec::new();

    for (stem, series) in date_series {
        if series.file_ids.len() < 3 {
            continue;
        }

        let first_seen = series.dates.iter().min().copied();
        let last_seen = series.dates.iter().max().copied();

        // A clean chronological series is strong evidence of a recurring
        // workflow even when the generic formula undervalues a short,
        // recently indexed group; take whichever scores higher.
        let formula = score_confidence(
            Evidence {
                count: series.file_ids.len() as i64,
                distinct_sources: series.file_ids.len(),
                first_seen,
                last_seen,
            },
            now,
        );
        let regularity = (0.5 + 0.1 * series.file_ids.len() as f64).min(0.95);
        let confidence = formula.max(regularity);

        let title = format!("Recurring series: {}", stem);

        patterns.push(Pattern {
            id: pattern_id(PatternType::Workflow, &title),
            pattern_type: PatternType::Workflow,
            title,
            description: format!(
                "{} date-prefixed files form a chronological series",
                series.file_ids.len()
            ),
            confidence,
            evidence: json!({
                "file_count": series.file_ids.len(),
                "kind": "date_series",
            }),
            source_files: series.file_ids,
            source_entities: vec![],
            first_seen,
            last_seen,
        });
    }

    for (base, file_ids) in versioned {
        if file_ids.len() < 3 {
            continue;
        }

        let regularity = (0.5 + 0.1 * file_ids.len() as f64).min(0.95);
        let title = format!("Versioned document: {}", base.trim_end_matches('_'));

        patterns.push(Pattern {
            id: pattern_id(PatternType::Workflow, &title),
            pattern_type: PatternType::Workflow,
            title,
            description: format!("{} versioned revisions of the same document", file_ids.len()),
            confidence: regularity,
            evidence: json!({
                "file_count": file_ids.len(),
                "kind": "versioned",
            }),
            source_files: file_ids,
            source_entities: vec![],
            first_seen: None,
            last_seen: None,
        });
    }

    // Workflow patterns must always carry their detected group.
    debug_assert!(patterns.iter().all(|p| !p.source_files.is_empty()));

    patterns
}

fn parse_date(year: &str, month: &str, day: &str) -> Option<i64> {
    use chrono::NaiveDate;
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

// ============ Tech stacks ============

fn detect_tech_stacks(matrix: &CoOccurrenceMatrix, now: i64) -> Vec<Pattern> {
    // Adjacency restricted to TECH–TECH edges with enough weight.
    let n = matrix.entities.len();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (&(i, j), cell) in &matrix.pairs {
        if cell.count < 2 {
            continue;
        }
        if matrix.entities[i].entity_type == EntityType::Tech
            && matrix.entities[j].entity_type == EntityType::Tech
        {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
    }

    // Connected components of size >= 3 are stack candidates.
    let mut visited = vec![false; n];
    let mut patterns = Vec::new();

    for start in 0..n {
        if visited[start]
            || adjacency[start].is_empty()
            || matrix.entities[start].entity_type != EntityType::Tech
        {
            continue;
        }

        let mut component = Vec::new();
        let mut stack = vec![start];
        visited[start] = true;
        while let Some(node) = stack.pop() {
            component.push(node);
            for &next in &adjacency[node] {
                if !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }

        if component.len() < 3 {
            continue;
        }

        component.sort_by(|&a, &b| {
            matrix.entities[b]
                .occurrence_count
                .cmp(&matrix.entities[a].occurrence_count)
        });

        let members: Vec<&ConsolidatedEntity> =
            component.iter().map(|&i| &matrix.entities[i]).collect();

        let mut file_ids: BTreeSet<String> = BTreeSet::new();
        let mut count = 0i64;
        let mut first_seen = None;
        let mut last_seen = None;
        for member in &members {
            count += member.occurrence_count;
            file_ids.extend(member.file_ids.iter().cloned());
            first_seen = merge_min(first_seen, member.first_seen);
            last_seen = merge_max(last_seen, member.last_seen);
        }

        let confidence = score_confidence(
            Evidence {
                count,
                distinct_sources: file_ids.len(),
                first_seen,
                last_seen,
            },
            now,
        );

        let top: Vec<String> = members
            .iter()
            .take(5)
            .map(|e| e.canonical.clone())
            .collect();
        let title = format!("Tech stack: {}", top.join(", "));

        patterns.push(Pattern {
            id: pattern_id(PatternType::TechStack, &title),
            pattern_type: PatternType::TechStack,
            title,
            description: format!(
                "{} technologies recur together across {} files",
                members.len(),
                file_ids.len()
            ),
            confidence,
            evidence: json!({
                "members": members.iter().map(|e| e.canonical.clone()).collect::<Vec<_>>(),
                "occurrences": count,
            }),
            source_files: file_ids.into_iter().collect(),
            source_entities: members.iter().map(|e| e.id.clone()).collect(),
            first_seen,
            last_seen,
        });
    }

    patterns.sort_by(|a, b| a.id.cmp(&b.id));
    patterns
}

fn merge_min(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn merge_max(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn title_case(s: &str) -> String {
    s.split('_')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::{build_cooccurrence, CoOccurrenceBounds};
    use crate::models::FileStatus;

    const DAY: i64 = 86_400;

    fn entity(
        id: &str,
        entity_type: EntityType,
        canonical: &str,
        files: &[&str],
        count: i64,
        first: i64,
        last: i64,
    ) -> ConsolidatedEntity {
        ConsolidatedEntity {
            id: id.to_string(),
            entity_type,
            canonical: canonical.to_string(),
            aliases: vec![],
            occurrence_count: count,
            file_ids: files.iter().map(|f| f.to_string()).collect(),
            first_seen: Some(first),
            last_seen: Some(last),
        }
    }

    fn file(id: &str, path: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            path: path.to_string(),
            extension: "md".to_string(),
            size_bytes: 1,
            modified_at: 0,
            status: FileStatus::Indexed,
            last_error: None,
            discovered_at: 0,
            indexed_at: Some(0),
            content_hash: None,
            word_count: None,
        }
    }

    fn bounds() -> CoOccurrenceBounds {
        CoOccurrenceBounds {
            max_entities: 1000,
            max_pairs_per_file: 1000,
            max_total_pairs: 100_000,
        }
    }

    #[test]
    fn test_confidence_formula_components() {
        let now = 1000 * DAY;
        // count 99 → evidence 1.0; 5 sources → diversity 1.0; a year span
        // → time_span 1.0; last seen today → recency 1.0.
        let confidence = score_confidence(
            Evidence {
                count: 99,
                distinct_sources: 5,
                first_seen: Some(now - 365 * DAY),
                last_seen: Some(now),
            },
            now,
        );
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_decays_with_staleness() {
        let now = 1000 * DAY;
        let fresh = score_confidence(
            Evidence {
                count: 10,
                distinct_sources: 3,
                first_seen: Some(now - 100 * DAY),
                last_seen: Some(now),
            },
            now,
        );
        let stale = score_confidence(
            Evidence {
                count: 10,
                distinct_sources: 3,
                first_seen: Some(now - 300 * DAY),
                last_seen: Some(now - 200 * DAY),
            },
            now,
        );
        assert!(fresh > stale);
    }

    #[test]
    fn test_relationship_requires_two_files() {
        let now = 100 * DAY;
        let entities = vec![
            entity("p", EntityType::Person, "Alice", &["f1", "f2"], 4, 0, now),
            entity("o", EntityType::Org, "Acme Corp", &["f1", "f2"], 4, 0, now),
        ];
        let matrix = build_cooccurrence(entities, bounds());
        let patterns = detect_relationships(&matrix, now);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::Relationship);
        assert!(patterns[0].title.contains("Alice"));
        assert_eq!(patterns[0].source_files.len(), 2);
    }

    #[test]
    fn test_relationship_skips_single_file_pairs() {
        let now = 100 * DAY;
        let entities = vec![
            entity("p", EntityType::Person, "Alice", &["f1"], 1, 0, now),
            entity("o", EntityType::Org, "Acme Corp", &["f1"], 1, 0, now),
        ];
        let matrix = build_cooccurrence(entities, bounds());
        assert!(detect_relationships(&matrix, now).is_empty());
    }

    #[test]
    fn test_workflow_date_series_carries_source_files() {
        let files: Vec<FileRecord> = (1..=4)
            .map(|month| {
                file(
                    &format!("f{}", month),
                    &format!("/docs/2024-{:02}-05-report.md", month),
                )
            })
            .collect();

        let patterns = detect_workflows(&files, 100 * DAY);
        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert_eq!(pattern.pattern_type, PatternType::Workflow);
        assert_eq!(pattern.source_files.len(), 4);
        for id in ["f1", "f2", "f3", "f4"] {
            assert!(pattern.source_files.contains(&id.to_string()));
        }
        assert!(pattern.confidence >= 0.7, "got {}", pattern.confidence);
    }

    #[test]
    fn test_workflow_below_three_files_no_pattern() {
        let files = vec![
            file("f1", "/docs/2024-01-05-report.md"),
            file("f2", "/docs/2024-02-05-report.md"),
        ];
        assert!(detect_workflows(&files, 100 * DAY).is_empty());
    }

    #[test]
    fn test_workflow_versioned_documents() {
        let files = vec![
            file("f1", "/docs/design_v1.md"),
            file("f2", "/docs/design_v2.md"),
            file("f3", "/docs/design_v3.md"),
        ];
        let patterns = detect_workflows(&files, 100 * DAY);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].source_files.len(), 3);
        assert!(!patterns[0].source_files.is_empty());
    }

    #[test]
    fn test_expertise_needs_multiple_terms_and_files() {
        let now = 100 * DAY;
        let entities = vec![
            entity("e1", EntityType::Tech, "docker", &["f1", "f2", "f3"], 20, 0, now),
            entity("e2", EntityType::Tech, "kubernetes", &["f2", "f3", "f4"], 15, 0, now),
            entity("e3", EntityType::Tech, "terraform", &["f1", "f4"], 8, 0, now),
        ];
        let patterns = detect_expertise(&entities, now);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].title.contains("Devops"));
        assert_eq!(patterns[0].source_files.len(), 4);
    }

    #[test]
    fn test_expertise_single_term_insufficient() {
        let now = 100 * DAY;
        let entities = vec![entity(
            "e1",
            EntityType::Tech,
            "docker",
            &["f1", "f2"],
            20,
            0,
            now,
        )];
        assert!(detect_expertise(&entities, now).is_empty());
    }

    #[test]
    fn test_tech_stack_cluster() {
        let now = 100 * DAY;
        let shared = &["f1", "f2", "f3"];
        let entities = vec![
            entity("r", EntityType::Tech, "rust", shared, 30, 0, now),
            entity("t", EntityType::Tech, "tokio", shared, 20, 0, now),
            entity("x", EntityType::Tech, "axum", shared, 10, 0, now),
            entity("lone", EntityType::Tech, "cobol", &["f9"], 1, 0, now),
        ];
        let matrix = build_cooccurrence(entities, bounds());
        let patterns = detect_tech_stacks(&matrix, now);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].title.starts_with("Tech stack:"));
        assert!(patterns[0].title.contains("rust"));
        assert!(!patterns[0].title.contains("cobol"));
    }
}
