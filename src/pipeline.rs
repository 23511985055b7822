//! Extraction pipeline: one file in, persisted chunks + entities +
//! embeddings + side-metadata out, as a single logical operation.
//!
//! Step order per file:
//!
//! 1. Derive the content-based file id and upsert the file record.
//! 2. Read bytes; resolve an extractor (extension → sniff → plaintext).
//! 3. Extract text and structural hints (plus image/audio header facts).
//! 4. Chunk (prose or code strategy, deterministic).
//! 5. Entity extraction per chunk, plus the technology-term detector.
//! 6. Embed each chunk at fixed dimensionality.
//! 7. Persist: chunks + entities in one catalog transaction, vectors into
//!    the vector store, side-metadata through typed records, then flip the
//!    file to `indexed`.
//!
//! Any failure marks the file `failed` with the error string and propagates
//! so the job records the same error. Side-metadata write failures are
//! programmer errors (record/store drift) and are logged at error level and
//! re-raised, never swallowed.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::chunk::{chunk_code, chunk_prose, ChunkSpan};
use crate::config::Config;
use crate::embedding::embed_texts;
use crate::entities::{extract_entities, normalize};
use crate::extract;
use crate::fae;
use crate::models::{
    chunk_id, AudioMetadata, ChunkKind, ChunkRecord, EntityOccurrence, FileRecord, FileStatus,
    GpsLocation, ImageMetadata,
};
use crate::vector_store::VectorStore;

/// Stable, content-derived file identity: path + size + mtime.
pub fn file_identity(path: &Path, size: u64, modified_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(size.to_le_bytes());
    hasher.update(modified_at.to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub file_id: String,
    pub chunk_count: usize,
    pub entity_count: usize,
    pub embedding_count: usize,
    pub word_count: usize,
    pub skipped: bool,
}

pub struct Pipeline {
    catalog: Catalog,
    vectors: VectorStore,
    config: Config,
}

impl Pipeline {
    pub fn new(catalog: Catalog, vectors: VectorStore, config: Config) -> Self {
        Self {
            catalog,
            vectors,
            config,
        }
    }

    /// Run the full extraction for one file.
    pub async fn process_file(&self, path: &Path) -> Result<PipelineOutcome> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Cannot stat file: {}", path.display()))?;
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let file_id = file_identity(path, metadata.len(), modified_at);
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut record = FileRecord {
            id: file_id.clone(),
            path: path.to_string_lossy().to_string(),
            extension: extension.clone(),
            size_bytes: metadata.len() as i64,
            modified_at,
            status: FileStatus::Extracting,
            last_error: None,
            discovered_at: Utc::now().timestamp(),
            indexed_at: None,
            content_hash: None,
            word_count: None,
        };

        if metadata.len() > self.config.exclude.max_file_size_bytes {
            record.status = FileStatus::Skipped;
            self.catalog.upsert_file(&record).await?;
            debug!(path = %path.display(), "file exceeds size cap, skipped");
            return Ok(PipelineOutcome {
                file_id,
                skipped: true,
                ..Default::default()
            });
        }

        self.catalog.upsert_file(&record).await?;

        match self.extract_and_persist(path, &mut record).await {
            Ok(outcome) => {
                self.catalog
                    .update_file_status(&record.id, FileStatus::Indexed, None)
                    .await?;
                self.catalog
                    .log_audit("file_indexed", "file", &record.id, Some(&record.path))
                    .await?;
                info!(
                    path = %path.display(),
                    chunks = outcome.chunk_count,
                    entities = outcome.entity_count,
                    "indexed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.catalog
                    .update_file_status(&record.id, FileStatus::Failed, Some(&message))
                    .await?;
                self.catalog
                    .log_audit("file_failed", "file", &record.id, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    async fn extract_and_persist(
        &self,
        path: &Path,
        record: &mut FileRecord,
    ) -> Result<PipelineOutcome> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read file: {}", path.display()))?;

        record.content_hash = Some(hex_prefix(&Sha256::digest(&bytes), 64));

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Conversational exports route through the FAE parser first; a JSON
        // file that merely looks like one falls back to the JSON extractor.
        let extraction = if fae::looks_like_export(&file_name) {
            match serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|data| fae::parse_export(&data).ok())
            {
                Some((conversations, summary)) => {
                    self.catalog
                        .log_audit(
                            "fae_imported",
                            "file",
                            &record.id,
                            Some(&serde_json::to_string(&summary)?),
                        )
                        .await?;
                    extract::Extraction {
                        text: fae::render_text(&conversations),
                        kind: ChunkKind::Prose,
                        image: None,
                        audio: None,
                    }
                }
                None => {
                    let kind = extract::resolve(&record.extension, &bytes);
                    extract::extract(kind, path, &bytes)?
                }
            }
        } else {
            let kind = extract::resolve(&record.extension, &bytes);
            extract::extract(kind, path, &bytes)?
        };

        record.word_count = Some(extraction.text.split_whitespace().count() as i64);
        self.catalog.upsert_file(record).await?;

        // Side-metadata through typed records. Failures here mean the
        // pipeline and the store disagree about a record shape: re-raise.
        if let Some(image) = &extraction.image {
            let meta = ImageMetadata {
                file_id: record.id.clone(),
                width: image.width,
                height: image.height,
                format: image.format.clone(),
                ..Default::default()
            };
            if let Err(e) = self.catalog.upsert_image_metadata(&meta).await {
                error!(file_id = %record.id, error = %e, "image metadata write failed");
                return Err(e);
            }
            if let (Some(lat), Some(lon)) = (meta.latitude, meta.longitude) {
                let gps = GpsLocation {
                    id: format!("{}-gps", record.id),
                    file_id: record.id.clone(),
                    latitude: lat,
                    longitude: lon,
                    location_name: None,
                    captured_at: meta.date_taken,
                };
                if let Err(e) = self.catalog.upsert_gps_location(&gps).await {
                    error!(file_id = %record.id, error = %e, "gps location write failed");
                    return Err(e);
                }
            }
        }
        if let Some(audio) = &extraction.audio {
            let meta = AudioMetadata {
                file_id: record.id.clone(),
                duration_seconds: audio.duration_seconds,
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                codec: audio.codec.clone(),
                transcription_status: "pending".to_string(),
                ..Default::default()
            };
            if let Err(e) = self.catalog.upsert_audio_metadata(&meta).await {
                error!(file_id = %record.id, error = %e, "audio metadata write failed");
                return Err(e);
            }
        }

        let spans = self.chunk(&extraction);
        let (chunks, entities) = self.materialize(&record.id, &spans);

        let mut vectors = Vec::new();
        if self.config.embedding.is_enabled() && !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            for batch in texts.chunks(self.config.embedding.batch_size.max(1)) {
                vectors.extend(embed_texts(&self.config.embedding, batch).await?);
            }
        }

        self.catalog
            .replace_chunks(&record.id, &chunks, &entities)
            .await?;

        let mut embedding_count = 0usize;
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            self.vectors.upsert(&chunk.id, &record.id, vector).await?;
            embedding_count += 1;
        }

        Ok(PipelineOutcome {
            file_id: record.id.clone(),
            chunk_count: chunks.len(),
            entity_count: entities.len(),
            embedding_count,
            word_count: record.word_count.unwrap_or(0) as usize,
            skipped: false,
        })
    }

    fn chunk(&self, extraction: &extract::Extraction) -> Vec<ChunkSpan> {
        match extraction.kind {
            ChunkKind::Code => chunk_code(&extraction.text, self.config.chunking.code_max_lines),
            _ => chunk_prose(
                &extraction.text,
                self.config.chunking.target_tokens,
                self.config.chunking.max_tokens,
            ),
        }
    }

    fn materialize(
        &self,
        file_id: &str,
        spans: &[ChunkSpan],
    ) -> (Vec<ChunkRecord>, Vec<EntityOccurrence>) {
        let mut chunks = Vec::with_capacity(spans.len());
        let mut entities = Vec::new();

        for (i, span) in spans.iter().enumerate() {
            let id = chunk_id(file_id, i as i64);

            for (j, entity) in extract_entities(&span.text).iter().enumerate() {
                entities.push(EntityOccurrence {
                    id: format!("{}-e{:03}", id, j),
                    file_id: file_id.to_string(),
                    chunk_id: id.clone(),
                    entity_type: entity.entity_type,
                    value: entity.text.clone(),
                    normalized: normalize(&entity.text),
                    confidence: entity.confidence,
                });
            }

            chunks.push(ChunkRecord {
                id,
                file_id: file_id.to_string(),
                ordinal: i as i64,
                text: span.text.clone(),
                token_count: span.token_count as i64,
                start_byte: span.start_byte as i64,
                end_byte: span.end_byte as i64,
                kind: span.kind,
            });
        }

        (chunks, entities)
    }
}

/// Walk the configured sources and return every extractable path, honoring
/// exclusion globs, the extension blacklist, per-source type filters, and
/// the size cap. Drives `BATCH_EXTRACTION`.
pub fn discover_files(config: &Config) -> Result<Vec<PathBuf>> {
    let exclude_set = build_globset(&config.exclude.globs)?;
    let mut paths = Vec::new();

    for source in config.sources.iter().filter(|s| s.enabled) {
        if !source.path.exists() {
            tracing::warn!(path = %source.path.display(), "source root does not exist, skipping");
            continue;
        }

        let max_depth = if source.recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&source.path)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let path_str = path.to_string_lossy();

            if exclude_set.is_match(path_str.as_ref()) {
                continue;
            }
            if path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
            {
                continue;
            }

            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if config.exclude.extensions.iter().any(|b| b == &ext) {
                continue;
            }
            if !source.file_types.is_empty()
                && !source.file_types.iter().any(|t| t.to_lowercase() == ext)
            {
                continue;
            }

            if let Ok(meta) = entry.metadata() {
                if meta.len() > config.exclude.max_file_size_bytes {
                    continue;
                }
            }

            paths.push(path.to_path_buf());
        }
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_identity_stable_and_sensitive() {
        let path = Path::new("/tmp/example.md");
        let a = file_identity(path, 100, 1700000000);
        let b = file_identity(path, 100, 1700000000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        // Any component change re-derives the id.
        assert_ne!(a, file_identity(path, 101, 1700000000));
        assert_ne!(a, file_identity(path, 100, 1700000001));
        assert_ne!(a, file_identity(Path::new("/tmp/other.md"), 100, 1700000000));
    }
}
