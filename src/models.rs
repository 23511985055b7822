//! Core data models used throughout strata.
//!
//! These types represent the records that flow through the extraction and
//! correlation pipeline. The data lifecycle is:
//!
//! ```text
//! Watcher → Job → extract() → FileRecord → chunk() → ChunkRecord
//!                                               ↓
//!                                    ner() → EntityOccurrence
//!                                               ↓
//!                     correlate() → ConsolidatedEntity → Pattern → Discovery
//! ```
//!
//! All timestamps are Unix epoch seconds (`i64`) for cheap comparison and
//! indexing; API responses convert to ISO 8601 at the edge.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a file in the catalog.
///
/// Transitions move forward only, except re-extraction which returns an
/// `Indexed` file to `Queued`. Deletion is a soft transition to `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Queued,
    Extracting,
    Indexed,
    Failed,
    Skipped,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Queued => "queued",
            FileStatus::Extracting => "extracting",
            FileStatus::Indexed => "indexed",
            FileStatus::Failed => "failed",
            FileStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(FileStatus::Discovered),
            "queued" => Some(FileStatus::Queued),
            "extracting" => Some(FileStatus::Extracting),
            "indexed" => Some(FileStatus::Indexed),
            "failed" => Some(FileStatus::Failed),
            "skipped" => Some(FileStatus::Skipped),
            _ => None,
        }
    }
}

/// A file known to the catalog.
///
/// The identity is content-derived: `id` is the first 16 hex chars of
/// SHA-256 over `canonical_path | size | mtime`, so a changed file gets a
/// fresh id and the stale record stays behind as history.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    /// Absolute path at discovery time.
    pub path: String,
    /// Extension without the dot, lowercased.
    pub extension: String,
    pub size_bytes: i64,
    /// Source mtime (epoch seconds).
    pub modified_at: i64,
    pub status: FileStatus,
    pub last_error: Option<String>,
    pub discovered_at: i64,
    pub indexed_at: Option<i64>,
    /// SHA-256 of the full content, set during extraction.
    pub content_hash: Option<String>,
    pub word_count: Option<i64>,
}

/// Classification of a chunk's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Prose,
    Code,
    Table,
    Ocr,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Prose => "prose",
            ChunkKind::Code => "code",
            ChunkKind::Table => "table",
            ChunkKind::Ocr => "ocr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prose" => Some(ChunkKind::Prose),
            "code" => Some(ChunkKind::Code),
            "table" => Some(ChunkKind::Table),
            "ocr" => Some(ChunkKind::Ocr),
            _ => None,
        }
    }
}

/// A contiguous region of a file's extractable content; the unit of
/// embedding and retrieval.
///
/// Chunk ids are deterministic (`{file_id}-{ordinal:04}`) so re-extracting
/// a file replaces its chunks instead of accumulating duplicates. Chunks of
/// one file cover disjoint byte spans of the extracted text.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub id: String,
    pub file_id: String,
    pub ordinal: i64,
    pub text: String,
    pub token_count: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub kind: ChunkKind,
}

pub fn chunk_id(file_id: &str, ordinal: i64) -> String {
    format!("{}-{:04}", file_id, ordinal)
}

/// Named-entity categories recognized by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "PERSON")]
    Person,
    #[serde(rename = "ORG")]
    Org,
    #[serde(rename = "PROJECT")]
    Project,
    #[serde(rename = "TECH")]
    Tech,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "LOCATION")]
    Location,
    #[serde(rename = "OTHER")]
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Org => "ORG",
            EntityType::Project => "PROJECT",
            EntityType::Tech => "TECH",
            EntityType::Date => "DATE",
            EntityType::Location => "LOCATION",
            EntityType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PERSON" => EntityType::Person,
            "ORG" => EntityType::Org,
            "PROJECT" => EntityType::Project,
            "TECH" => EntityType::Tech,
            "DATE" => EntityType::Date,
            "LOCATION" => EntityType::Location,
            _ => EntityType::Other,
        }
    }
}

/// A mention of a named entity inside a chunk. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct EntityOccurrence {
    pub id: String,
    pub file_id: String,
    pub chunk_id: String,
    pub entity_type: EntityType,
    /// Surface form as it appeared in the text.
    pub value: String,
    /// Case-folded, punctuation-trimmed comparison form.
    pub normalized: String,
    pub confidence: f64,
}

/// The merged identity for a canonical surface form, produced by
/// consolidation. Every occurrence maps to exactly one of these.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedEntity {
    pub id: String,
    pub entity_type: EntityType,
    /// Most frequent original surface form, ties broken by earliest sighting.
    pub canonical: String,
    pub aliases: Vec<String>,
    pub occurrence_count: i64,
    pub file_ids: Vec<String>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Expertise,
    Relationship,
    Workflow,
    TechStack,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Expertise => "expertise",
            PatternType::Relationship => "relationship",
            PatternType::Workflow => "workflow",
            PatternType::TechStack => "tech_stack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "expertise" => Some(PatternType::Expertise),
            "relationship" => Some(PatternType::Relationship),
            "workflow" => Some(PatternType::Workflow),
            "tech_stack" => Some(PatternType::TechStack),
            _ => None,
        }
    }
}

/// A structural observation produced by a detector. Patterns are disposable:
/// each correlation run replaces the previous set.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: PatternType,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    /// Evidence metrics, detector-specific.
    pub evidence: serde_json::Value,
    pub source_files: Vec<String>,
    pub source_entities: Vec<String>,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    New,
    Confirmed,
    Dismissed,
    Superseded,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::New => "new",
            DiscoveryStatus::Confirmed => "confirmed",
            DiscoveryStatus::Dismissed => "dismissed",
            DiscoveryStatus::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(DiscoveryStatus::New),
            "confirmed" => Some(DiscoveryStatus::Confirmed),
            "dismissed" => Some(DiscoveryStatus::Dismissed),
            "superseded" => Some(DiscoveryStatus::Superseded),
            _ => None,
        }
    }
}

/// A pattern promoted past the confidence and source-diversity thresholds
/// and surfaced to the user.
///
/// Discoveries outlive correlation runs. A run never weakens a discovery's
/// confidence in place; a demotion marks it `superseded` instead, and
/// user feedback (`confirmed`/`dismissed`) locks it against supersession.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub id: String,
    pub pattern_id: String,
    pub discovery_type: PatternType,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub status: DiscoveryStatus,
    pub source_files: Vec<String>,
    pub user_notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============ Multimedia side-metadata ============
//
// Typed record structs per kind. The pipeline constructs these by field
// name; a signature mismatch against the store is a compile error here
// rather than a silently reordered positional bind.

/// Image metadata extracted from container headers and EXIF.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageMetadata {
    pub file_id: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub format: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub iso: Option<i64>,
    pub date_taken: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub ocr_text: Option<String>,
}

/// Audio metadata from container headers and tags.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioMetadata {
    pub file_id: String,
    pub duration_seconds: Option<f64>,
    pub sample_rate: Option<i64>,
    pub channels: Option<i64>,
    pub codec: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub transcription_status: String,
    pub transcription_text: Option<String>,
}

/// A per-file GPS fix kept in its own table for cross-file correlation.
#[derive(Debug, Clone, Serialize)]
pub struct GpsLocation {
    pub id: String,
    pub file_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: Option<String>,
    pub captured_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            FileStatus::Discovered,
            FileStatus::Queued,
            FileStatus::Extracting,
            FileStatus::Indexed,
            FileStatus::Failed,
            FileStatus::Skipped,
        ] {
            assert_eq!(FileStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::parse("bogus"), None);
    }

    #[test]
    fn test_entity_type_parse_unknown_maps_to_other() {
        assert_eq!(EntityType::parse("GADGET"), EntityType::Other);
        assert_eq!(EntityType::parse("PERSON"), EntityType::Person);
    }

    #[test]
    fn test_chunk_id_deterministic() {
        assert_eq!(chunk_id("abcd1234", 0), "abcd1234-0000");
        assert_eq!(chunk_id("abcd1234", 42), "abcd1234-0042");
    }
}
