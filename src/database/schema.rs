/*!
 * Database schema definitions and version bookkeeping.
 *
 * Works own chapter slots and editions; chapters are the text of one slot in
 * one edition. Chapter contexts and entities are derived data, jobs drive the
 * pipeline. Partial unique indexes enforce at most one active job per
 * (chapter, kind, target language).
 */

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    // Foreign keys are a per-connection setting
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Initializing database schema v{}", SCHEMA_VERSION);
        create_all_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version == SCHEMA_VERSION {
        debug!("Database schema is up to date (v{})", current_version);
    } else {
        return Err(anyhow!(
            "Unsupported database schema v{} (this build uses v{})",
            current_version,
            SCHEMA_VERSION
        ));
    }

    Ok(())
}

/// Get the current schema version from the database
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .context("Failed to check schema_version table existence")?;

    if !table_exists {
        return Ok(0);
    }

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version in the database
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version, updated_at) VALUES (1, ?1, datetime('now'))",
        [version],
    )?;
    Ok(())
}

/// Create all database tables
fn create_all_tables(conn: &Connection) -> Result<()> {
    // WAL keeps readers (context building) off the writers' path
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS works (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            source_language TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chapter_slots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id INTEGER NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            number INTEGER NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            UNIQUE(work_id, number)
        );

        CREATE TABLE IF NOT EXISTS editions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id INTEGER NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            language TEXT NOT NULL,
            is_source INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(work_id, language)
        );

        CREATE INDEX IF NOT EXISTS idx_slots_work ON chapter_slots(work_id, number);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            edition_id INTEGER NOT NULL REFERENCES editions(id) ON DELETE CASCADE,
            slot_id INTEGER NOT NULL REFERENCES chapter_slots(id) ON DELETE CASCADE,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            summary TEXT,
            entity_validation_warning TEXT,
            missing_entities TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(edition_id, slot_id)
        );

        CREATE TABLE IF NOT EXISTS chapter_contexts (
            chapter_id INTEGER PRIMARY KEY REFERENCES chapters(id) ON DELETE CASCADE,
            characters TEXT NOT NULL,
            places TEXT NOT NULL,
            terms TEXT NOT NULL,
            summary TEXT NOT NULL,
            source_hash TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chapters_slot ON chapters(slot_id);
        "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id INTEGER NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            source_name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            first_slot_id INTEGER NOT NULL REFERENCES chapter_slots(id),
            last_slot_id INTEGER NOT NULL REFERENCES chapter_slots(id),
            occurrence_count INTEGER NOT NULL CHECK (occurrence_count >= 1),
            priority INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(work_id, source_name)
        );

        CREATE TABLE IF NOT EXISTS entity_translations (
            entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            language TEXT NOT NULL,
            translated_name TEXT NOT NULL,
            is_manual INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(entity_id, language)
        );

        CREATE INDEX IF NOT EXISTS idx_entities_work ON entities(work_id, priority);
        "#,
    )?;

    create_jobs_table(conn)?;
    create_keywords_table(conn)?;

    info!("Database schema created successfully");
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            chapter_id INTEGER NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
            target_language TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            parse_failures INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            claimed_by TEXT,
            claimed_at TEXT,
            next_run_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active
            ON jobs(chapter_id, kind, target_language)
            WHERE status IN ('pending', 'in_progress', 'failed');

        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, next_run_at);
        "#,
    )?;
    Ok(())
}

fn create_keywords_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS work_keywords (
            work_id INTEGER NOT NULL REFERENCES works(id) ON DELETE CASCADE,
            keyword TEXT NOT NULL,
            PRIMARY KEY(work_id, keyword)
        );
        "#,
    )?;
    Ok(())
}
