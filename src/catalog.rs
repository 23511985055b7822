//! Relational catalog: the source of truth for all persisted records.
//!
//! Single SQLite database (WAL journaling, foreign keys on) with typed
//! operations per record family. Referential integrity is enforced at write
//! time: a chunk without a file row, or an entity without its chunk, is
//! rejected by the foreign-key constraints rather than silently stored.
//!
//! Scans used by the correlation engine (`iter_entities`, `iter_files`,
//! `iter_chunks`) materialize their result sets; at single-host scale the
//! co-occurrence bounds in §correlation keep these well under memory limits.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::models::{
    AudioMetadata, ChunkKind, ChunkRecord, ConsolidatedEntity, Discovery, DiscoveryStatus,
    EntityOccurrence, EntityType, FileRecord, FileStatus, GpsLocation, ImageMetadata, Pattern,
    PatternType,
};

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

/// One entity occurrence joined with its file's indexing timestamp, as
/// consumed by the consolidation scan.
#[derive(Debug, Clone)]
pub struct EntityScanRow {
    pub entity_type: EntityType,
    pub value: String,
    pub normalized: String,
    pub file_id: String,
    pub indexed_at: Option<i64>,
}

/// Catalog rollup returned by `get_stats` and the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogStats {
    pub total_files: i64,
    pub files_by_status: BTreeMap<String, i64>,
    pub total_chunks: i64,
    pub total_entities: i64,
    pub entities_by_type: BTreeMap<String, i64>,
    pub consolidated_entities: i64,
    pub patterns_detected: i64,
    pub discoveries_by_status: BTreeMap<String, i64>,
    pub discoveries_by_type: BTreeMap<String, i64>,
}

impl Catalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Files ============

    pub async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, path, extension, size_bytes, modified_at, status,
                               last_error, discovered_at, indexed_at, content_hash, word_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                indexed_at = excluded.indexed_at,
                content_hash = excluded.content_hash,
                word_count = excluded.word_count
            "#,
        )
        .bind(&file.id)
        .bind(&file.path)
        .bind(&file.extension)
        .bind(file.size_bytes)
        .bind(file.modified_at)
        .bind(file.status.as_str())
        .bind(&file.last_error)
        .bind(file.discovered_at)
        .bind(file.indexed_at)
        .bind(&file.content_hash)
        .bind(file.word_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_file))
    }

    /// Newest record at a path; older records for the same path are stale
    /// history from before the file changed.
    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let row =
            sqlx::query("SELECT * FROM files WHERE path = ? ORDER BY discovered_at DESC, rowid DESC LIMIT 1")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(row_to_file))
    }

    pub async fn update_file_status(
        &self,
        file_id: &str,
        status: FileStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if status == FileStatus::Indexed {
            sqlx::query("UPDATE files SET status = ?, indexed_at = ?, last_error = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(Utc::now().timestamp())
                .bind(error)
                .bind(file_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE files SET status = ?, last_error = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(file_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Soft delete: mark every record at `path` skipped. Chunks and vectors
    /// are retained (see DESIGN.md on stale-chunk policy).
    pub async fn mark_path_skipped(&self, path: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE files SET status = 'skipped' WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn iter_files(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM files WHERE status = ? ORDER BY discovered_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_file).collect())
    }

    // ============ Chunks ============

    /// Replace a file's chunks and entity occurrences in one transaction.
    /// Old rows go first so re-extraction never accumulates duplicates.
    pub async fn replace_chunks(
        &self,
        file_id: &str,
        chunks: &[ChunkRecord],
        entities: &[EntityOccurrence],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM entities WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, file_id, ordinal, text, token_count, start_byte, end_byte, kind)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.start_byte)
            .bind(chunk.end_byte)
            .bind(chunk.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO entities (id, file_id, chunk_id, entity_type, value, normalized, confidence)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entity.id)
            .bind(&entity.file_id)
            .bind(&entity.chunk_id)
            .bind(entity.entity_type.as_str())
            .bind(&entity.value)
            .bind(&entity.normalized)
            .bind(entity.confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn iter_chunks(&self, file_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE file_id = ? ORDER BY ordinal")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_chunk))
    }

    /// Chunk ids of all indexed files, with their text. Drives the startup
    /// reconciliation pass against the vector store.
    pub async fn indexed_chunks(&self) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.file_id, c.text
            FROM chunks c
            JOIN files f ON c.file_id = f.id
            WHERE f.status = 'indexed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("file_id"), r.get("text")))
            .collect())
    }

    // ============ Entity occurrences ============

    /// Full occurrence stream for consolidation, joined with file timestamps,
    /// ordered by indexing time so first-seen ties resolve deterministically.
    pub async fn iter_entities(&self) -> Result<Vec<EntityScanRow>> {
        let rows = sqlx::query(
            r#"
            SELECT e.entity_type, e.value, e.normalized, e.file_id, f.indexed_at
            FROM entities e
            JOIN files f ON e.file_id = f.id
            WHERE f.status = 'indexed'
            ORDER BY f.indexed_at, e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| EntityScanRow {
                entity_type: EntityType::parse(&r.get::<String, _>("entity_type")),
                value: r.get("value"),
                normalized: r.get("normalized"),
                file_id: r.get("file_id"),
                indexed_at: r.get("indexed_at"),
            })
            .collect())
    }

    pub async fn entities_for_file(&self, file_id: &str) -> Result<Vec<EntityOccurrence>> {
        let rows = sqlx::query("SELECT * FROM entities WHERE file_id = ?")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| EntityOccurrence {
                id: r.get("id"),
                file_id: r.get("file_id"),
                chunk_id: r.get("chunk_id"),
                entity_type: EntityType::parse(&r.get::<String, _>("entity_type")),
                value: r.get("value"),
                normalized: r.get("normalized"),
                confidence: r.get("confidence"),
            })
            .collect())
    }

    // ============ Consolidated entities ============

    /// Replace the consolidated set wholesale. Consolidation is idempotent,
    /// so a rewrite of the same input produces the same rows.
    pub async fn replace_consolidated(&self, entities: &[ConsolidatedEntity]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM consolidated_entities")
            .execute(&mut *tx)
            .await?;

        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO consolidated_entities
                    (id, entity_type, canonical, aliases, occurrence_count, file_ids, first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entity.id)
            .bind(entity.entity_type.as_str())
            .bind(&entity.canonical)
            .bind(serde_json::to_string(&entity.aliases)?)
            .bind(entity.occurrence_count)
            .bind(serde_json::to_string(&entity.file_ids)?)
            .bind(entity.first_seen)
            .bind(entity.last_seen)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_consolidated(
        &self,
        entity_type: Option<EntityType>,
        limit: i64,
    ) -> Result<Vec<ConsolidatedEntity>> {
        let rows = match entity_type {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM consolidated_entities WHERE entity_type = ? ORDER BY occurrence_count DESC LIMIT ?",
                )
                .bind(t.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM consolidated_entities ORDER BY occurrence_count DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_consolidated).collect()
    }

    // ============ Patterns ============

    /// Patterns are disposable: each correlation run replaces the set.
    pub async fn replace_patterns(&self, patterns: &[Pattern]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM patterns").execute(&mut *tx).await?;

        for pattern in patterns {
            sqlx::query(
                r#"
                INSERT INTO patterns
                    (id, pattern_type, title, description, confidence, evidence,
                     source_files, source_entities, first_seen, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pattern.id)
            .bind(pattern.pattern_type.as_str())
            .bind(&pattern.title)
            .bind(&pattern.description)
            .bind(pattern.confidence)
            .bind(pattern.evidence.to_string())
            .bind(serde_json::to_string(&pattern.source_files)?)
            .bind(serde_json::to_string(&pattern.source_entities)?)
            .bind(pattern.first_seen)
            .bind(pattern.last_seen)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_patterns(&self, min_confidence: f64) -> Result<Vec<Pattern>> {
        let rows =
            sqlx::query("SELECT * FROM patterns WHERE confidence >= ? ORDER BY confidence DESC")
                .bind(min_confidence)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(row_to_pattern).collect()
    }

    // ============ Discoveries ============

    pub async fn upsert_discovery(&self, discovery: &Discovery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discoveries
                (id, pattern_id, discovery_type, title, description, confidence,
                 status, source_files, user_notes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                pattern_id = excluded.pattern_id,
                description = excluded.description,
                confidence = excluded.confidence,
                status = excluded.status,
                source_files = excluded.source_files,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&discovery.id)
        .bind(&discovery.pattern_id)
        .bind(discovery.discovery_type.as_str())
        .bind(&discovery.title)
        .bind(&discovery.description)
        .bind(discovery.confidence)
        .bind(discovery.status.as_str())
        .bind(serde_json::to_string(&discovery.source_files)?)
        .bind(&discovery.user_notes)
        .bind(discovery.created_at)
        .bind(discovery.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_discovery(&self, id: &str) -> Result<Option<Discovery>> {
        let row = sqlx::query("SELECT * FROM discoveries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_discovery).transpose()
    }

    pub async fn list_discoveries(&self, include_dismissed: bool) -> Result<Vec<Discovery>> {
        let sql = if include_dismissed {
            "SELECT * FROM discoveries ORDER BY confidence DESC"
        } else {
            "SELECT * FROM discoveries WHERE status != 'dismissed' ORDER BY confidence DESC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_discovery).collect()
    }

    pub async fn set_discovery_feedback(
        &self,
        id: &str,
        status: DiscoveryStatus,
        notes: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE discoveries SET status = ?, user_notes = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(notes)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ============ Multimedia side-metadata ============
    //
    // Typed records only. Failures here indicate pipeline/store drift and
    // must propagate (§error-handling): log at error level and return Err.

    pub async fn upsert_image_metadata(&self, record: &ImageMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO image_metadata
                (file_id, width, height, format, camera_make, camera_model,
                 iso, date_taken, latitude, longitude, altitude, ocr_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.file_id)
        .bind(record.width)
        .bind(record.height)
        .bind(&record.format)
        .bind(&record.camera_make)
        .bind(&record.camera_model)
        .bind(record.iso)
        .bind(record.date_taken)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.altitude)
        .bind(&record.ocr_text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_audio_metadata(&self, record: &AudioMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO audio_metadata
                (file_id, duration_seconds, sample_rate, channels, codec,
                 title, artist, album, transcription_status, transcription_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.file_id)
        .bind(record.duration_seconds)
        .bind(record.sample_rate)
        .bind(record.channels)
        .bind(&record.codec)
        .bind(&record.title)
        .bind(&record.artist)
        .bind(&record.album)
        .bind(&record.transcription_status)
        .bind(&record.transcription_text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_gps_location(&self, record: &GpsLocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO gps_locations
                (id, file_id, latitude, longitude, location_name, captured_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_id)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(&record.location_name)
        .bind(record.captured_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============ Audit ============

    pub async fn log_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, action, entity_type, entity_id, details) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().timestamp())
        .bind(action)
        .bind(entity_type)
        .bind(entity_id)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============ Statistics ============

    pub async fn get_stats(&self) -> Result<CatalogStats> {
        let total_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let total_entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let consolidated: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM consolidated_entities")
            .fetch_one(&self.pool)
            .await?;
        let patterns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patterns")
            .fetch_one(&self.pool)
            .await?;

        let files_by_status = count_grouped(&self.pool, "SELECT status, COUNT(*) FROM files GROUP BY status").await?;
        let entities_by_type =
            count_grouped(&self.pool, "SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type").await?;
        let discoveries_by_status =
            count_grouped(&self.pool, "SELECT status, COUNT(*) FROM discoveries GROUP BY status").await?;
        let discoveries_by_type = count_grouped(
            &self.pool,
            "SELECT discovery_type, COUNT(*) FROM discoveries GROUP BY discovery_type",
        )
        .await?;

        Ok(CatalogStats {
            total_files,
            files_by_status,
            total_chunks,
            total_entities,
            entities_by_type,
            consolidated_entities: consolidated,
            patterns_detected: patterns,
            discoveries_by_status,
            discoveries_by_type,
        })
    }
}

async fn count_grouped(pool: &SqlitePool, sql: &str) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|r| (r.get::<String, _>(0), r.get::<i64, _>(1)))
        .collect())
}

fn row_to_file(row: sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        path: row.get("path"),
        extension: row.get("extension"),
        size_bytes: row.get("size_bytes"),
        modified_at: row.get("modified_at"),
        status: FileStatus::parse(&row.get::<String, _>("status")).unwrap_or(FileStatus::Discovered),
        last_error: row.get("last_error"),
        discovered_at: row.get("discovered_at"),
        indexed_at: row.get("indexed_at"),
        content_hash: row.get("content_hash"),
        word_count: row.get("word_count"),
    }
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        file_id: row.get("file_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        start_byte: row.get("start_byte"),
        end_byte: row.get("end_byte"),
        kind: ChunkKind::parse(&row.get::<String, _>("kind")).unwrap_or(ChunkKind::Prose),
    }
}

fn row_to_consolidated(row: sqlx::sqlite::SqliteRow) -> Result<ConsolidatedEntity> {
    Ok(ConsolidatedEntity {
        id: row.get("id"),
        entity_type: EntityType::parse(&row.get::<String, _>("entity_type")),
        canonical: row.get("canonical"),
        aliases: serde_json::from_str(&row.get::<String, _>("aliases"))?,
        occurrence_count: row.get("occurrence_count"),
        file_ids: serde_json::from_str(&row.get::<String, _>("file_ids"))?,
        first_seen: row.get("first_seen"),
        last_seen: row.get("last_seen"),
    })
}

fn row_to_pattern(row: sqlx::sqlite::SqliteRow) -> Result<Pattern> {
    Ok(Pattern {
        id: row.get("id"),
        pattern_type: PatternType::parse(&row.get::<String, _>("pattern_type"))
            .unwrap_or(PatternType::Workflow),
        title: row.get("title"),
        description: row.get("description"),
        confidence: row.get("confidence"),
        evidence: serde_json::from_str(&row.get::<String, _>("evidence"))?,
        source_files: serde_json::from_str(&row.get::<String, _>("source_files"))?,
        source_entities: serde_json::from_str(&row.get::<String, _>("source_entities"))?,
        first_seen: row.get("first_seen"),
        last_seen: row.get("last_seen"),
    })
}

fn row_to_discovery(row: sqlx::sqlite::SqliteRow) -> Result<Discovery> {
    Ok(Discovery {
        id: row.get("id"),
        pattern_id: row.get("pattern_id"),
        discovery_type: PatternType::parse(&row.get::<String, _>("discovery_type"))
            .unwrap_or(PatternType::Workflow),
        title: row.get("title"),
        description: row.get("description"),
        confidence: row.get("confidence"),
        status: DiscoveryStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(DiscoveryStatus::New),
        source_files: serde_json::from_str(&row.get::<String, _>("source_files"))?,
        user_notes: row.get("user_notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
