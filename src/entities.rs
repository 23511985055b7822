//! Named-entity extraction over chunk text.
//!
//! Pure-regex recognizer: a technology-term detector over a fixed
//! vocabulary, person/organization/project heuristics over capitalization
//! shapes, and date patterns. This is deliberately a narrow capability —
//! a model-backed recognizer can replace it behind the same function
//! signature without touching the pipeline.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::EntityType;

/// An entity mention located in a text, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub text: String,
    pub entity_type: EntityType,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Domain vocabularies, 6 domains of specialist terms. Matches are tagged
/// as OTHER-type occurrences so the expertise detector can measure how
/// densely a domain's vocabulary recurs across files.
pub const DOMAIN_VOCABULARY: &[(&str, &[&str])] = &[
    (
        "machine_learning",
        &[
            "neural network", "deep learning", "transformer", "embedding", "gradient",
            "backpropagation", "loss function", "inference", "overfitting",
            "regularization", "pytorch", "tensorflow",
        ],
    ),
    (
        "devops",
        &[
            "docker", "kubernetes", "terraform", "helm", "pipeline", "deployment",
            "container", "orchestration", "aws", "gcp", "azure", "infrastructure",
            "monitoring",
        ],
    ),
    (
        "medical",
        &[
            "fda", "clinical", "diagnosis", "patient", "trial", "regulatory", "diagnostic",
            "hipaa", "pathology", "dosage", "oncology", "biomarker",
        ],
    ),
    (
        "legal",
        &[
            "contract", "liability", "clause", "statute", "litigation", "compliance",
            "jurisdiction", "plaintiff", "defendant", "indemnity", "arbitration", "tort",
        ],
    ),
    (
        "finance",
        &[
            "portfolio", "equity", "derivative", "hedge", "liquidity", "valuation",
            "arbitrage", "dividend", "amortization", "balance sheet", "cash flow", "audit",
        ],
    ),
    (
        "embedded",
        &[
            "firmware", "microcontroller", "rtos", "interrupt", "gpio", "uart", "i2c",
            "spi", "bootloader", "watchdog", "dma", "oscilloscope",
        ],
    ),
];

/// Technology vocabulary for the TECH detector. Word-boundary matched,
/// case-insensitive.
pub const TECH_TERMS: &[&str] = &[
    "Python", "JavaScript", "TypeScript", "Rust", "Go", "Java", "Kotlin", "Swift",
    "React", "Vue", "Angular", "FastAPI", "Django", "Flask", "Axum", "Tokio",
    "PostgreSQL", "SQLite", "MongoDB", "Redis", "Kafka", "Spark", "Airflow",
    "Docker", "Kubernetes", "Terraform", "Helm", "AWS", "GCP", "Azure",
    "Linux", "Windows", "macOS", "Git", "GitHub", "GitLab", "GraphQL", "OAuth",
    "TensorFlow", "PyTorch", "LLM", "GPT", "Claude", "Anthropic", "OpenAI", "Gemini",
];

/// Common given names recognized as single-word PERSON mentions. Two-word
/// capitalized pairs are recognized independently of this list.
const GIVEN_NAMES: &[&str] = &[
    "alice", "bob", "carol", "dave", "eve", "frank", "grace", "heidi", "mallory",
    "gabriel", "gabe", "daniel", "dan", "danny", "michael", "mike", "robert", "rob",
    "bobby", "william", "will", "bill", "richard", "rick", "christopher", "chris",
    "matthew", "matt", "anthony", "tony", "joseph", "joe", "joey", "benjamin", "ben",
    "alexander", "alex", "nicholas", "nick", "jonathan", "jon", "stephen", "steve",
    "elizabeth", "liz", "beth", "jennifer", "jen", "jenny", "katherine", "kate",
    "katie", "margaret", "maggie", "patricia", "pat", "sarah", "emma", "olivia",
    "james", "john", "mary", "linda", "susan", "karen", "nancy", "laura", "amy",
];

const LOCATIONS: &[&str] = &[
    "London", "Paris", "Berlin", "Tokyo", "Singapore", "Amsterdam", "Zurich",
    "New York", "San Francisco", "Seattle", "Austin", "Boston", "Chicago", "Toronto",
    "Tel Aviv", "Bangalore", "Sydney", "Germany", "France", "Japan", "Canada",
    "Israel", "India", "Australia", "United States", "United Kingdom",
];

static TECH_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = TECH_TERMS
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({})\b", alternation)).unwrap()
});

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = DOMAIN_VOCABULARY
        .iter()
        .flat_map(|(_, terms)| terms.iter())
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b({})\b", alternation)).unwrap()
});

static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = LOCATIONS
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\b({})\b", alternation)).unwrap()
});

// "Jane Doe", optionally with an honorific.
static PERSON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:Dr|Mr|Mrs|Ms|Prof)\.\s+)?([A-Z][a-z]+)\s+([A-Z][a-z]+)\b").unwrap()
});

static SINGLE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][a-z]{2,}\b").unwrap());

// "Acme Corp", "Initech LLC", "Parallax Labs"
static ORG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z0-9]*(?:\s+[A-Z][A-Za-z0-9]*)*)\s+(Inc|Corp|Corporation|LLC|Ltd|Labs|GmbH|Co)\b\.?")
        .unwrap()
});

// "Project Chimera" / "Chimera Project"
static PROJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bProject\s+[A-Z][A-Za-z0-9]+\b|\b[A-Z][A-Za-z0-9]+\s+Project\b").unwrap()
});

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}/\d{4}\b|\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}\b",
    )
    .unwrap()
});

/// Extract entity mentions from a text. Deterministic; results are ordered
/// by start offset and deduplicated per (surface, type, offset).
pub fn extract_entities(text: &str) -> Vec<ExtractedEntity> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut entities = Vec::new();

    for m in TECH_RE.find_iter(text) {
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Tech,
            start: m.start(),
            end: m.end(),
            confidence: 0.9,
        });
    }

    for caps in ORG_RE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        entities.push(ExtractedEntity {
            text: m.as_str().trim_end_matches('.').to_string(),
            entity_type: EntityType::Org,
            start: m.start(),
            end: m.end(),
            confidence: 0.9,
        });
    }

    for m in PROJECT_RE.find_iter(text) {
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Project,
            start: m.start(),
            end: m.end(),
            confidence: 0.85,
        });
    }

    for caps in PERSON_RE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let first = caps.get(1).unwrap().as_str();
        let last = caps.get(2).unwrap().as_str();
        // Capitalized pairs that are actually tech or org fragments are
        // handled by the span-overlap pass below; skip obvious non-names.
        if is_tech_term(first) || is_tech_term(last) {
            continue;
        }
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Person,
            start: m.start(),
            end: m.end(),
            confidence: 0.85,
        });
    }

    for m in SINGLE_NAME_RE.find_iter(text) {
        if GIVEN_NAMES.contains(&m.as_str().to_lowercase().as_str()) {
            entities.push(ExtractedEntity {
                text: m.as_str().to_string(),
                entity_type: EntityType::Person,
                start: m.start(),
                end: m.end(),
                confidence: 0.7,
            });
        }
    }

    for m in LOCATION_RE.find_iter(text) {
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Location,
            start: m.start(),
            end: m.end(),
            confidence: 0.8,
        });
    }

    for m in DATE_RE.find_iter(text) {
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Date,
            start: m.start(),
            end: m.end(),
            confidence: 0.95,
        });
    }

    for m in DOMAIN_RE.find_iter(text) {
        entities.push(ExtractedEntity {
            text: m.as_str().to_string(),
            entity_type: EntityType::Other,
            start: m.start(),
            end: m.end(),
            confidence: 0.7,
        });
    }

    resolve_overlaps(entities)
}

fn is_tech_term(word: &str) -> bool {
    TECH_TERMS.iter().any(|t| t.eq_ignore_ascii_case(word))
}

/// Deduplicate and resolve overlapping spans: an exact duplicate keeps the
/// higher confidence; a PERSON fully contained in an ORG span is dropped
/// (the "Acme" in "Acme Corp" is not a person); an OTHER-type vocabulary
/// hit yields to any specifically-typed match on the same span.
fn resolve_overlaps(mut entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
    entities.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let org_spans: Vec<(usize, usize)> = entities
        .iter()
        .filter(|e| e.entity_type == EntityType::Org)
        .map(|e| (e.start, e.end))
        .collect();

    let typed_spans: Vec<(usize, usize)> = entities
        .iter()
        .filter(|e| e.entity_type != EntityType::Other)
        .map(|e| (e.start, e.end))
        .collect();

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for entity in entities {
        if entity.entity_type == EntityType::Person
            && org_spans
                .iter()
                .any(|&(s, e)| entity.start >= s && entity.end <= e)
        {
            continue;
        }
        if entity.entity_type == EntityType::Other
            && typed_spans
                .iter()
                .any(|&(s, e)| entity.start == s && entity.end == e)
        {
            continue;
        }

        let key = (
            entity.text.to_lowercase(),
            entity.entity_type,
            entity.start,
        );
        if seen.insert(key) {
            out.push(entity);
        }
    }

    out
}

/// Normalize a surface form for comparison: case-fold, strip leading
/// articles, drop punctuation, collapse whitespace.
pub fn normalize(value: &str) -> String {
    let mut normalized = value.to_lowercase();
    normalized = normalized.trim().to_string();

    for prefix in ["the ", "a ", "an "] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            normalized = rest.to_string();
            break;
        }
    }

    let cleaned: String = normalized
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tech_terms_word_boundary() {
        let entities = extract_entities("We deploy with Docker and Kubernetes on AWS.");
        let techs: Vec<&str> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Tech)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(techs, vec!["Docker", "Kubernetes", "AWS"]);
    }

    #[test]
    fn test_tech_no_substring_match() {
        let entities = extract_entities("The pythonic approach is not a language name.");
        assert!(entities
            .iter()
            .all(|e| e.entity_type != EntityType::Tech || e.text.to_lowercase() != "python"));
    }

    #[test]
    fn test_person_full_name() {
        let entities = extract_entities("Meeting notes from Jane Doe about the rollout.");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Person && e.text == "Jane Doe"));
    }

    #[test]
    fn test_single_given_name() {
        let entities = extract_entities("Alice reviewed the plan. Alice approved. Thanks Alice!");
        let count = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Person && e.text == "Alice")
            .count();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_org_with_suffix() {
        let entities = extract_entities("The contract with Acme Corp was renewed.");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Org && e.text == "Acme Corp"));
        // "Acme" must not also surface as a person inside the org span.
        assert!(entities
            .iter()
            .all(|e| !(e.entity_type == EntityType::Person && e.start >= 18 && e.end <= 27)));
    }

    #[test]
    fn test_date_formats() {
        let entities = extract_entities("Due 2024-01-05, slipped to March 2, 2024 and 3/15/2024.");
        let dates = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Date)
            .count();
        assert_eq!(dates, 3);
    }

    #[test]
    fn test_project_pattern() {
        let entities = extract_entities("Kickoff for Project Borealis is Monday.");
        assert!(entities
            .iter()
            .any(|e| e.entity_type == EntityType::Project && e.text == "Project Borealis"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("The Acme Corp."), "acme corp");
        assert_eq!(normalize("  ALICE  "), "alice");
        assert_eq!(normalize("foo-bar_baz"), "foo bar baz");
    }

    #[test]
    fn test_empty_text() {
        assert!(extract_entities("").is_empty());
        assert!(extract_entities("   ").is_empty());
    }
}
