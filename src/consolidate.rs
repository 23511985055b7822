//! Entity consolidation and the bounded co-occurrence matrix.
//!
//! Consolidation merges variant surface forms of the same named thing:
//! "Mike", "mike", and "Michael" become one PERSON. Grouping is by
//! (type, normalized form) where normalization case-folds, strips
//! diacritics, trims punctuation, and — for PERSON only — resolves
//! first-name aliases. The canonical surface is the most frequent original
//! form, ties broken by earliest sighting, so the result is deterministic
//! and idempotent on unchanged input.
//!
//! The co-occurrence build is the part that must stay bounded: without the
//! caps it is quadratic over millions of entities. Three limits apply, all
//! configurable: `max_entities` participants (top-K by occurrence),
//! `max_pairs_per_file` (deterministic uniform sample, seeded from the
//! file id), and `max_total_pairs` (hard cap with a dropped-pair counter).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::catalog::EntityScanRow;
use crate::models::{ConsolidatedEntity, EntityType};

/// PERSON-only first-name aliases (nickname → canonical). Applied to the
/// first token of a normalized person name.
const NAME_ALIASES: &[(&str, &str)] = &[
    ("gabe", "gabriel"),
    ("gabi", "gabriel"),
    ("dan", "daniel"),
    ("danny", "daniel"),
    ("mike", "michael"),
    ("mick", "michael"),
    ("rob", "robert"),
    ("bob", "robert"),
    ("bobby", "robert"),
    ("will", "william"),
    ("bill", "william"),
    ("billy", "william"),
    ("rick", "richard"),
    ("dick", "richard"),
    ("chris", "christopher"),
    ("matt", "matthew"),
    ("tony", "anthony"),
    ("joe", "joseph"),
    ("joey", "joseph"),
    ("ben", "benjamin"),
    ("alex", "alexander"),
    ("nick", "nicholas"),
    ("jon", "jonathan"),
    ("steve", "stephen"),
    ("liz", "elizabeth"),
    ("beth", "elizabeth"),
    ("lizzy", "elizabeth"),
    ("jen", "jennifer"),
    ("jenny", "jennifer"),
    ("kate", "katherine"),
    ("kathy", "katherine"),
    ("katie", "katherine"),
    ("maggie", "margaret"),
    ("meg", "margaret"),
    ("pat", "patricia"),
    ("patty", "patricia"),
];

/// Normalization used for grouping: case-fold, diacritic strip,
/// punctuation trim; PERSON names additionally resolve first-name aliases.
pub fn consolidation_key(value: &str, entity_type: EntityType) -> String {
    let folded: String = value
        .to_lowercase()
        .chars()
        .map(strip_diacritic)
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    let mut words: Vec<&str> = folded.split_whitespace().collect();

    if entity_type == EntityType::Person {
        if let Some(first) = words.first() {
            if let Some(&(_, canonical)) = NAME_ALIASES.iter().find(|(alias, _)| alias == first) {
                words[0] = canonical;
            }
        }
    }

    words.join(" ")
}

fn strip_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Merge the full occurrence stream into consolidated entities. Pure and
/// deterministic: the same rows always produce the same set, in the same
/// order.
pub fn consolidate(rows: &[EntityScanRow]) -> Vec<ConsolidatedEntity> {
    struct Group {
        entity_type: EntityType,
        // surface form → (count, first position in stream)
        surfaces: BTreeMap<String, (i64, usize)>,
        occurrence_count: i64,
        file_ids: BTreeSet<String>,
        first_seen: Option<i64>,
        last_seen: Option<i64>,
    }

    let mut groups: BTreeMap<(String, String), Group> = BTreeMap::new();

    for (position, row) in rows.iter().enumerate() {
        let key_norm = consolidation_key(&row.value, row.entity_type);
        if key_norm.is_empty() {
            continue;
        }
        let key = (row.entity_type.as_str().to_string(), key_norm);

        let group = groups.entry(key).or_insert_with(|| Group {
            entity_type: row.entity_type,
            surfaces: BTreeMap::new(),
            occurrence_count: 0,
            file_ids: BTreeSet::new(),
            first_seen: None,
            last_seen: None,
        });

        let surface = group
            .surfaces
            .entry(row.value.clone())
            .or_insert((0, position));
        surface.0 += 1;

        group.occurrence_count += 1;
        group.file_ids.insert(row.file_id.clone());

        if let Some(ts) = row.indexed_at {
            group.first_seen = Some(group.first_seen.map_or(ts, |f| f.min(ts)));
            group.last_seen = Some(group.last_seen.map_or(ts, |l| l.max(ts)));
        }
    }

    let mut out = Vec::with_capacity(groups.len());

    for ((type_str, normalized), group) in groups {
        // Most frequent surface; ties go to the earliest-seen form.
        let canonical = group
            .surfaces
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
            .map(|(surface, _)| surface.clone())
            .unwrap_or_else(|| normalized.clone());

        let aliases: Vec<String> = group
            .surfaces
            .keys()
            .filter(|s| **s != canonical)
            .cloned()
            .collect();

        out.push(ConsolidatedEntity {
            id: consolidated_id(&type_str, &normalized),
            entity_type: group.entity_type,
            canonical,
            aliases,
            occurrence_count: group.occurrence_count,
            file_ids: group.file_ids.into_iter().collect(),
            first_seen: group.first_seen,
            last_seen: group.last_seen,
        });
    }

    debug!(
        occurrences = rows.len(),
        consolidated = out.len(),
        "entity consolidation complete"
    );

    out
}

fn consolidated_id(type_str: &str, normalized: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", type_str, normalized).as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("cent-{}", hex)
}

/// Bounds for the co-occurrence build. Mirrors `CorrelationConfig`.
#[derive(Debug, Clone, Copy)]
pub struct CoOccurrenceBounds {
    pub max_entities: usize,
    pub max_pairs_per_file: usize,
    pub max_total_pairs: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PairCell {
    pub count: i64,
    pub file_ids: BTreeSet<String>,
}

/// Sparse symmetric matrix of file-level entity pair counts. Pairs are
/// keyed by `(i, j)` indices (i < j) into `entities`.
#[derive(Debug, Default)]
pub struct CoOccurrenceMatrix {
    pub entities: Vec<ConsolidatedEntity>,
    pub pairs: HashMap<(usize, usize), PairCell>,
    pub dropped_pairs: u64,
    pub files_processed: usize,
}

/// Build the matrix under the configured bounds. Deterministic: entity
/// ranking and per-file sampling both derive from stable inputs.
pub fn build_cooccurrence(
    mut entities: Vec<ConsolidatedEntity>,
    bounds: CoOccurrenceBounds,
) -> CoOccurrenceMatrix {
    // Participation cap: top-K by occurrence count, ties by recency.
    if entities.len() > bounds.max_entities {
        warn!(
            total = entities.len(),
            cap = bounds.max_entities,
            "limiting co-occurrence participants to the most frequent entities"
        );
        entities.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then(b.last_seen.unwrap_or(0).cmp(&a.last_seen.unwrap_or(0)))
                .then(a.id.cmp(&b.id))
        });
        entities.truncate(bounds.max_entities);
    }

    // file id → indices of entities mentioned in it.
    let mut file_entities: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, entity) in entities.iter().enumerate() {
        for file_id in &entity.file_ids {
            file_entities.entry(file_id.as_str()).or_default().push(idx);
        }
    }

    let mut matrix = CoOccurrenceMatrix {
        entities: Vec::new(),
        pairs: HashMap::new(),
        dropped_pairs: 0,
        files_processed: 0,
    };

    let total_files = file_entities.len();

    for (file_id, members) in &file_entities {
        matrix.files_processed += 1;
        if matrix.files_processed % 10_000 == 0 {
            info!(
                files = matrix.files_processed,
                total = total_files,
                pairs = matrix.pairs.len(),
                "co-occurrence progress"
            );
        }

        let n = members.len();
        if n < 2 {
            continue;
        }

        let total_pairs = n * (n - 1) / 2;
        let take = total_pairs.min(bounds.max_pairs_per_file);

        let record = |matrix: &mut CoOccurrenceMatrix, i: usize, j: usize| {
            let key = if members[i] < members[j] {
                (members[i], members[j])
            } else {
                (members[j], members[i])
            };
            if !matrix.pairs.contains_key(&key) && matrix.pairs.len() >= bounds.max_total_pairs {
                matrix.dropped_pairs += 1;
                return;
            }
            let cell = matrix.pairs.entry(key).or_default();
            cell.count += 1;
            cell.file_ids.insert((*file_id).to_string());
        };

        if take == total_pairs {
            for i in 0..n {
                for j in (i + 1)..n {
                    record(&mut matrix, i, j);
                }
            }
        } else {
            // Uniform sample of pair ranks, seeded from the file id so the
            // same catalog always samples the same pairs.
            let mut rng = StdRng::seed_from_u64(seed_for(file_id));
            let mut chosen: HashSet<usize> = HashSet::with_capacity(take);
            while chosen.len() < take {
                chosen.insert(rng.gen_range(0..total_pairs));
            }
            let mut ranks: Vec<usize> = chosen.into_iter().collect();
            ranks.sort_unstable();
            for rank in ranks {
                let (i, j) = unrank_pair(rank, n);
                record(&mut matrix, i, j);
            }
        }
    }

    info!(
        participants = entities.len(),
        pairs = matrix.pairs.len(),
        dropped = matrix.dropped_pairs,
        files = matrix.files_processed,
        "co-occurrence matrix built"
    );

    matrix.entities = entities;
    matrix
}

fn seed_for(file_id: &str) -> u64 {
    let digest = Sha256::digest(file_id.as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

/// Map a rank in `[0, n*(n-1)/2)` to the rank-th unordered pair `(i, j)`,
/// i < j, enumerated row by row.
fn unrank_pair(rank: usize, n: usize) -> (usize, usize) {
    let mut remaining = rank;
    for i in 0..n - 1 {
        let row = n - 1 - i;
        if remaining < row {
            return (i, i + 1 + remaining);
        }
        remaining -= row;
    }
    (n - 2, n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        entity_type: EntityType,
        value: &str,
        file_id: &str,
        indexed_at: i64,
    ) -> EntityScanRow {
        EntityScanRow {
            entity_type,
            value: value.to_string(),
            normalized: value.to_lowercase(),
            file_id: file_id.to_string(),
            indexed_at: Some(indexed_at),
        }
    }

    #[test]
    fn test_case_variants_merge() {
        let rows = vec![
            row(EntityType::Org, "Anthropic", "f1", 100),
            row(EntityType::Org, "anthropic", "f2", 200),
            row(EntityType::Org, "ANTHROPIC", "f3", 300),
        ];
        let consolidated = consolidate(&rows);
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].occurrence_count, 3);
        assert_eq!(consolidated[0].file_ids.len(), 3);
        assert_eq!(consolidated[0].first_seen, Some(100));
        assert_eq!(consolidated[0].last_seen, Some(300));
    }

    #[test]
    fn test_person_alias_resolution() {
        let rows = vec![
            row(EntityType::Person, "Mike", "f1", 100),
            row(EntityType::Person, "Michael", "f2", 200),
            row(EntityType::Person, "Michael", "f3", 300),
        ];
        let consolidated = consolidate(&rows);
        assert_eq!(consolidated.len(), 1);
        // Most frequent surface wins.
        assert_eq!(consolidated[0].canonical, "Michael");
        assert_eq!(consolidated[0].aliases, vec!["Mike".to_string()]);
    }

    #[test]
    fn test_alias_applies_to_person_only() {
        let rows = vec![
            row(EntityType::Org, "Bob", "f1", 100),
            row(EntityType::Org, "Robert", "f2", 200),
        ];
        let consolidated = consolidate(&rows);
        assert_eq!(consolidated.len(), 2, "alias table must not merge non-person types");
    }

    #[test]
    fn test_canonical_tie_breaks_to_earliest() {
        let rows = vec![
            row(EntityType::Person, "Danny", "f1", 100),
            row(EntityType::Person, "Dan", "f2", 200),
        ];
        let consolidated = consolidate(&rows);
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].canonical, "Danny");
    }

    #[test]
    fn test_idempotent() {
        let rows = vec![
            row(EntityType::Person, "Mike", "f1", 100),
            row(EntityType::Tech, "Rust", "f1", 100),
            row(EntityType::Tech, "rust", "f2", 200),
            row(EntityType::Org, "Acme Corp", "f2", 200),
        ];
        let a = consolidate(&rows);
        let b = consolidate(&rows);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.canonical, y.canonical);
            assert_eq!(x.occurrence_count, y.occurrence_count);
            assert_eq!(x.file_ids, y.file_ids);
        }
    }

    #[test]
    fn test_diacritics_fold() {
        let rows = vec![
            row(EntityType::Person, "José", "f1", 100),
            row(EntityType::Person, "Jose", "f2", 200),
        ];
        assert_eq!(consolidate(&rows).len(), 1);
    }

    fn entity(id: &str, files: &[&str], count: i64) -> ConsolidatedEntity {
        ConsolidatedEntity {
            id: id.to_string(),
            entity_type: EntityType::Tech,
            canonical: id.to_string(),
            aliases: vec![],
            occurrence_count: count,
            file_ids: files.iter().map(|f| f.to_string()).collect(),
            first_seen: Some(0),
            last_seen: Some(count),
        }
    }

    #[test]
    fn test_cooccurrence_counts_shared_files() {
        let entities = vec![
            entity("a", &["f1", "f2"], 5),
            entity("b", &["f1", "f2"], 5),
            entity("c", &["f2"], 1),
        ];
        let matrix = build_cooccurrence(
            entities,
            CoOccurrenceBounds {
                max_entities: 100,
                max_pairs_per_file: 100,
                max_total_pairs: 100,
            },
        );

        let ab = matrix.pairs.get(&(0, 1)).expect("a-b pair");
        assert_eq!(ab.count, 2);
        assert_eq!(ab.file_ids.len(), 2);
        let bc = matrix.pairs.get(&(1, 2)).expect("b-c pair");
        assert_eq!(bc.count, 1);
    }

    #[test]
    fn test_max_entities_keeps_most_frequent() {
        let entities = vec![
            entity("rare", &["f1"], 1),
            entity("common", &["f1"], 50),
            entity("medium", &["f1"], 10),
        ];
        let matrix = build_cooccurrence(
            entities,
            CoOccurrenceBounds {
                max_entities: 2,
                max_pairs_per_file: 100,
                max_total_pairs: 100,
            },
        );
        let ids: Vec<&str> = matrix.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["common", "medium"]);
    }

    #[test]
    fn test_max_pairs_per_file_sampled_deterministically() {
        // 50 entities in one file → 1225 possible pairs, capped at 40.
        let entities: Vec<ConsolidatedEntity> = (0..50)
            .map(|i| entity(&format!("e{:02}", i), &["f1"], 1))
            .collect();
        let bounds = CoOccurrenceBounds {
            max_entities: 100,
            max_pairs_per_file: 40,
            max_total_pairs: 10_000,
        };

        let a = build_cooccurrence(entities.clone(), bounds);
        assert_eq!(a.pairs.len(), 40);

        let b = build_cooccurrence(entities, bounds);
        let mut a_keys: Vec<_> = a.pairs.keys().copied().collect();
        let mut b_keys: Vec<_> = b.pairs.keys().copied().collect();
        a_keys.sort_unstable();
        b_keys.sort_unstable();
        assert_eq!(a_keys, b_keys, "sampling must be stable across runs");
    }

    #[test]
    fn test_max_total_pairs_hard_cap() {
        let entities: Vec<ConsolidatedEntity> = (0..30)
            .map(|i| entity(&format!("e{:02}", i), &["f1"], 1))
            .collect();
        let matrix = build_cooccurrence(
            entities,
            CoOccurrenceBounds {
                max_entities: 100,
                max_pairs_per_file: 1000,
                max_total_pairs: 50,
            },
        );
        assert_eq!(matrix.pairs.len(), 50);
        // 30 choose 2 = 435 candidate pairs; the excess is observable.
        assert_eq!(matrix.dropped_pairs, 435 - 50);
    }

    #[test]
    fn test_unrank_pair_covers_all() {
        let n = 7;
        let mut seen = HashSet::new();
        for rank in 0..(n * (n - 1) / 2) {
            let (i, j) = unrank_pair(rank, n);
            assert!(i < j && j < n);
            assert!(seen.insert((i, j)));
        }
        assert_eq!(seen.len(), 21);
    }
}
