//! Database schema migrations.
//!
//! Creates all tables for the three databases (catalog, jobs, vector index)
//! and ensures idempotent execution. Run via `strata init` and again by the
//! daemon on every startup.
//!
//! # Catalog schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `files` | File records with content-derived ids and lifecycle status |
//! | `chunks` | Text segments with byte spans, token counts, and kinds |
//! | `entities` | Entity occurrences per chunk (immutable) |
//! | `consolidated_entities` | Post-correlation merged entities |
//! | `patterns` | Detector output, replaced wholesale per correlation run |
//! | `discoveries` | Surfaced discoveries with user feedback status |
//! | `image_metadata` / `audio_metadata` / `gps_locations` | Multimedia side-tables |
//! | `audit_log` | Status transitions and correlation runs |
//!
//! # Jobs schema
//!
//! `jobs` (queue entries) plus `operation_history` (completion durations
//! per operation kind, used for ETA estimation).
//!
//! # Vector schema
//!
//! `chunk_vectors` keyed by chunk id. Lives in its own database file so the
//! index can be deleted and rebuilt from the catalog.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all catalog migrations. Safe to call repeatedly.
pub async fn migrate_catalog(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id              TEXT PRIMARY KEY,
            path            TEXT NOT NULL,
            extension       TEXT NOT NULL DEFAULT '',
            size_bytes      INTEGER NOT NULL DEFAULT 0,
            modified_at     INTEGER NOT NULL DEFAULT 0,
            status          TEXT NOT NULL DEFAULT 'discovered',
            last_error      TEXT,
            discovered_at   INTEGER NOT NULL,
            indexed_at      INTEGER,
            content_hash    TEXT,
            word_count      INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id              TEXT PRIMARY KEY,
            file_id         TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            ordinal         INTEGER NOT NULL,
            text            TEXT NOT NULL,
            token_count     INTEGER NOT NULL DEFAULT 0,
            start_byte      INTEGER NOT NULL DEFAULT 0,
            end_byte        INTEGER NOT NULL DEFAULT 0,
            kind            TEXT NOT NULL DEFAULT 'prose',
            UNIQUE(file_id, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id              TEXT PRIMARY KEY,
            file_id         TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            chunk_id        TEXT NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
            entity_type     TEXT NOT NULL,
            value           TEXT NOT NULL,
            normalized      TEXT NOT NULL,
            confidence      REAL NOT NULL DEFAULT 1.0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consolidated_entities (
            id              TEXT PRIMARY KEY,
            entity_type     TEXT NOT NULL,
            canonical       TEXT NOT NULL,
            aliases         TEXT NOT NULL DEFAULT '[]',
            occurrence_count INTEGER NOT NULL DEFAULT 0,
            file_ids        TEXT NOT NULL DEFAULT '[]',
            first_seen      INTEGER,
            last_seen       INTEGER,
            UNIQUE(entity_type, canonical)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patterns (
            id              TEXT PRIMARY KEY,
            pattern_type    TEXT NOT NULL,
            title           TEXT NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            confidence      REAL NOT NULL,
            evidence        TEXT NOT NULL DEFAULT '{}',
            source_files    TEXT NOT NULL DEFAULT '[]',
            source_entities TEXT NOT NULL DEFAULT '[]',
            first_seen      INTEGER,
            last_seen       INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discoveries (
            id              TEXT PRIMARY KEY,
            pattern_id      TEXT NOT NULL,
            discovery_type  TEXT NOT NULL,
            title           TEXT NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            confidence      REAL NOT NULL,
            status          TEXT NOT NULL DEFAULT 'new',
            source_files    TEXT NOT NULL DEFAULT '[]',
            user_notes      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_metadata (
            file_id         TEXT PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
            width           INTEGER,
            height          INTEGER,
            format          TEXT,
            camera_make     TEXT,
            camera_model    TEXT,
            iso             INTEGER,
            date_taken      INTEGER,
            latitude        REAL,
            longitude       REAL,
            altitude        REAL,
            ocr_text        TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio_metadata (
            file_id             TEXT PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
            duration_seconds    REAL,
            sample_rate         INTEGER,
            channels            INTEGER,
            codec               TEXT,
            title               TEXT,
            artist              TEXT,
            album               TEXT,
            transcription_status TEXT NOT NULL DEFAULT 'pending',
            transcription_text  TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gps_locations (
            id              TEXT PRIMARY KEY,
            file_id         TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            latitude        REAL NOT NULL,
            longitude       REAL NOT NULL,
            location_name   TEXT,
            captured_at     INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       INTEGER NOT NULL,
            action          TEXT NOT NULL,
            entity_type     TEXT NOT NULL,
            entity_id       TEXT NOT NULL,
            details         TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Not unique: a changed file re-derives its id, so two records can
    // share a path (the older one is stale history).
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_path ON files(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_file ON entities(file_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_normalized ON entities(normalized)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_discoveries_confidence ON discoveries(confidence)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Run the jobs-database migrations. Safe to call repeatedly.
pub async fn migrate_jobs(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT PRIMARY KEY,
            job_type        TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            priority        INTEGER NOT NULL DEFAULT 3,
            payload         TEXT NOT NULL DEFAULT '{}',
            created_at      INTEGER NOT NULL,
            started_at      INTEGER,
            finished_at     INTEGER,
            attempts        INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_order ON jobs(priority, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS operation_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            kind            TEXT NOT NULL,
            started_at      INTEGER NOT NULL,
            duration_secs   REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ophistory_kind ON operation_history(kind, id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Run the vector-index migrations. Safe to call repeatedly.
pub async fn migrate_vectors(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id        TEXT PRIMARY KEY,
            file_id         TEXT NOT NULL,
            dims            INTEGER NOT NULL,
            embedding       BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_file ON chunk_vectors(file_id)")
        .execute(pool)
        .await?;

    Ok(())
}
