/*!
 * Repository layer for database operations.
 *
 * This module provides a high-level API for all database operations,
 * abstracting away the SQL details and providing type-safe access.
 *
 * Functions ending in `_sync` take a borrowed connection so services can
 * combine several of them inside one `transaction_async` closure.
 */

use anyhow::{anyhow, Context, Result};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use uuid::Uuid;

use super::connection::DatabaseConnection;
use super::models::{
    now_timestamp, ChapterContextRecord, ChapterRecord, EditionRecord, EnqueueOutcome,
    EntityRecord, EntityTranslationRecord, EntityView, JobKind, JobRecord, JobStats,
    JobStatus, SlotContext, TranslatedChapterInput, WorkRecord,
};
use crate::language_utils;

const CHAPTER_SELECT: &str = r#"
    SELECT c.id, e.work_id, c.edition_id, e.language, e.is_source, c.slot_id, s.number, s.title,
           c.title, c.content, c.content_hash, c.summary, c.entity_validation_warning,
           c.missing_entities, c.updated_at
    FROM chapters c
    JOIN editions e ON e.id = c.edition_id
    JOIN chapter_slots s ON s.id = c.slot_id
"#;

const JOB_SELECT: &str = r#"
    SELECT id, kind, chapter_id, target_language, status, attempts, parse_failures, max_attempts,
           last_error, claimed_by, next_run_at, created_at, updated_at
    FROM jobs
"#;

const ENTITY_VIEW_SELECT: &str = r#"
    SELECT en.id, en.source_name, en.entity_type, f.number, l.number, en.occurrence_count,
           en.priority, t.translated_name, COALESCE(t.is_manual, 0)
    FROM entities en
    JOIN chapter_slots f ON f.id = en.first_slot_id
    JOIN chapter_slots l ON l.id = en.last_slot_id
    LEFT JOIN entity_translations t ON t.entity_id = en.id AND t.language = ?2
"#;

/// Summary sources for one earlier chapter slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSummaries {
    pub number: i64,
    /// Summary stored with the chapter in the requested language
    pub translated: Option<String>,
    /// Summary from the source chapter's extraction
    pub source: Option<String>,
}

/// Repository for database operations
#[derive(Debug, Clone)]
pub struct Repository {
    /// Database connection
    db: DatabaseConnection,
}

impl Repository {
    /// Create a new repository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a repository with the default database location
    pub fn new_default() -> Result<Self> {
        let db = DatabaseConnection::new_default()?;
        Ok(Self::new(db))
    }

    /// Create a repository with an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = DatabaseConnection::new_in_memory()?;
        Ok(Self::new(db))
    }

    /// Underlying connection, for multi-step transactions
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// SHA-256 of a chapter text, hex encoded
    pub fn hash_text(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    // =========================================================================
    // Works and Editions
    // =========================================================================

    /// Create a work together with its source edition
    pub async fn create_work(&self, title: &str, source_language: &str) -> Result<WorkRecord> {
        let title = title.to_string();
        let source_language = language_utils::normalize_to_part1_or_part2t(source_language)?;

        self.db
            .transaction_async(move |tx| {
                let now = now_timestamp();
                tx.execute(
                    "INSERT INTO works (title, source_language, created_at) VALUES (?1, ?2, ?3)",
                    params![title, source_language, now],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO editions (work_id, language, is_source, created_at) VALUES (?1, ?2, 1, ?3)",
                    params![id, source_language, now],
                )?;
                debug!("Created work {} ({})", id, source_language);
                Ok(WorkRecord {
                    id,
                    title,
                    source_language,
                    created_at: now,
                })
            })
            .await
    }

    pub async fn get_work(&self, work_id: i64) -> Result<Option<WorkRecord>> {
        self.db
            .execute_async(move |conn| Self::get_work_sync(conn, work_id))
            .await
    }

    pub fn get_work_sync(conn: &Connection, work_id: i64) -> Result<Option<WorkRecord>> {
        let work = conn
            .query_row(
                "SELECT id, title, source_language, created_at FROM works WHERE id = ?1",
                [work_id],
                |row| {
                    Ok(WorkRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        source_language: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(work)
    }

    pub async fn list_works(&self) -> Result<Vec<WorkRecord>> {
        self.db
            .execute_async(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, title, source_language, created_at FROM works ORDER BY id")?;
                let works = stmt
                    .query_map([], |row| {
                        Ok(WorkRecord {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            source_language: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(works)
            })
            .await
    }

    /// Add a target-language edition (no-op when it already exists)
    pub async fn create_edition(&self, work_id: i64, language: &str) -> Result<EditionRecord> {
        let language = language.to_string();
        self.db
            .execute_async(move |conn| Self::get_or_create_edition_sync(conn, work_id, &language))
            .await
    }

    pub fn get_or_create_edition_sync(
        conn: &Connection,
        work_id: i64,
        language: &str,
    ) -> Result<EditionRecord> {
        let language = language_utils::normalize_to_part1_or_part2t(language)?;
        conn.execute(
            "INSERT OR IGNORE INTO editions (work_id, language, is_source, created_at) VALUES (?1, ?2, 0, ?3)",
            params![work_id, language, now_timestamp()],
        )?;
        let edition = conn.query_row(
            "SELECT id, work_id, language, is_source FROM editions WHERE work_id = ?1 AND language = ?2",
            params![work_id, language],
            |row| {
                Ok(EditionRecord {
                    id: row.get(0)?,
                    work_id: row.get(1)?,
                    language: row.get(2)?,
                    is_source: row.get(3)?,
                })
            },
        )?;
        Ok(edition)
    }

    pub async fn list_editions(&self, work_id: i64) -> Result<Vec<EditionRecord>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, work_id, language, is_source FROM editions WHERE work_id = ?1 ORDER BY id",
                )?;
                let editions = stmt
                    .query_map([work_id], |row| {
                        Ok(EditionRecord {
                            id: row.get(0)?,
                            work_id: row.get(1)?,
                            language: row.get(2)?,
                            is_source: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(editions)
            })
            .await
    }

    // =========================================================================
    // Chapters
    // =========================================================================

    /// Insert or replace the source text of chapter `number`
    pub async fn add_source_chapter(
        &self,
        work_id: i64,
        number: i64,
        title: &str,
        content: &str,
    ) -> Result<ChapterRecord> {
        let title = title.to_string();
        let content = content.to_string();

        self.db
            .transaction_async(move |tx| {
                let edition_id: i64 = tx
                    .query_row(
                        "SELECT id FROM editions WHERE work_id = ?1 AND is_source = 1",
                        [work_id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| anyhow!("Work {} has no source edition", work_id))?;

                tx.execute(
                    r#"
                    INSERT INTO chapter_slots (work_id, number, title) VALUES (?1, ?2, ?3)
                    ON CONFLICT(work_id, number) DO UPDATE SET title = excluded.title
                    "#,
                    params![work_id, number, title],
                )?;
                let slot_id: i64 = tx.query_row(
                    "SELECT id FROM chapter_slots WHERE work_id = ?1 AND number = ?2",
                    params![work_id, number],
                    |row| row.get(0),
                )?;

                let now = now_timestamp();
                tx.execute(
                    r#"
                    INSERT INTO chapters (edition_id, slot_id, title, content, content_hash, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    ON CONFLICT(edition_id, slot_id) DO UPDATE SET
                        title = excluded.title,
                        content = excluded.content,
                        content_hash = excluded.content_hash,
                        updated_at = excluded.updated_at
                    "#,
                    params![edition_id, slot_id, title, content, Self::hash_text(&content), now],
                )?;

                Self::get_chapter_by_slot_sync(tx, slot_id, edition_id)?
                    .ok_or_else(|| anyhow!("Chapter {} of work {} vanished after insert", number, work_id))
            })
            .await
    }

    pub async fn get_chapter(&self, chapter_id: i64) -> Result<Option<ChapterRecord>> {
        self.db
            .execute_async(move |conn| Self::get_chapter_sync(conn, chapter_id))
            .await
    }

    pub fn get_chapter_sync(conn: &Connection, chapter_id: i64) -> Result<Option<ChapterRecord>> {
        let sql = format!("{} WHERE c.id = ?1", CHAPTER_SELECT);
        Ok(conn.query_row(&sql, [chapter_id], parse_chapter_row).optional()?)
    }

    fn get_chapter_by_slot_sync(
        conn: &Connection,
        slot_id: i64,
        edition_id: i64,
    ) -> Result<Option<ChapterRecord>> {
        let sql = format!("{} WHERE c.slot_id = ?1 AND c.edition_id = ?2", CHAPTER_SELECT);
        Ok(conn
            .query_row(&sql, params![slot_id, edition_id], parse_chapter_row)
            .optional()?)
    }

    /// Chapter of `slot_id` in the edition for `language`, if translated
    pub async fn get_chapter_in_language(
        &self,
        slot_id: i64,
        language: &str,
    ) -> Result<Option<ChapterRecord>> {
        let language = language_utils::normalize_to_part1_or_part2t(language)?;
        self.db
            .execute_async(move |conn| {
                let sql = format!("{} WHERE c.slot_id = ?1 AND e.language = ?2", CHAPTER_SELECT);
                Ok(conn
                    .query_row(&sql, params![slot_id, language], parse_chapter_row)
                    .optional()?)
            })
            .await
    }

    /// Source chapters of a work in slot order
    pub async fn list_source_chapters(&self, work_id: i64) -> Result<Vec<ChapterRecord>> {
        self.db
            .execute_async(move |conn| {
                let sql = format!(
                    "{} WHERE e.work_id = ?1 AND e.is_source = 1 ORDER BY s.number",
                    CHAPTER_SELECT
                );
                let mut stmt = conn.prepare(&sql)?;
                let chapters = stmt
                    .query_map([work_id], parse_chapter_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(chapters)
            })
            .await
    }

    /// Source chapters whose extraction is missing or predates the current text
    pub async fn chapters_needing_extraction(&self, work_id: i64) -> Result<Vec<i64>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT c.id
                    FROM chapters c
                    JOIN editions e ON e.id = c.edition_id
                    JOIN chapter_slots s ON s.id = c.slot_id
                    LEFT JOIN chapter_contexts cc ON cc.chapter_id = c.id
                    WHERE e.work_id = ?1 AND e.is_source = 1
                      AND (cc.chapter_id IS NULL OR cc.source_hash != c.content_hash)
                    ORDER BY s.number
                    "#,
                )?;
                let ids = stmt
                    .query_map([work_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(ids)
            })
            .await
    }

    /// Insert or replace a translated chapter, creating its edition when needed
    ///
    /// Returns the chapter id.
    pub fn upsert_translated_chapter_sync(
        conn: &Connection,
        input: &TranslatedChapterInput,
    ) -> Result<i64> {
        let edition = Self::get_or_create_edition_sync(conn, input.work_id, &input.language)?;
        if edition.is_source {
            return Err(anyhow!(
                "Refusing to overwrite the source edition ({}) of work {}",
                edition.language,
                input.work_id
            ));
        }

        let missing = serde_json::to_string(&input.missing_entities)?;
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO chapters (
                edition_id, slot_id, title, content, content_hash, summary,
                entity_validation_warning, missing_entities, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(edition_id, slot_id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                content_hash = excluded.content_hash,
                summary = excluded.summary,
                entity_validation_warning = excluded.entity_validation_warning,
                missing_entities = excluded.missing_entities,
                updated_at = excluded.updated_at
            "#,
            params![
                edition.id,
                input.slot_id,
                input.title,
                input.content,
                Self::hash_text(&input.content),
                input.summary,
                input.entity_validation_warning,
                missing,
                now,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM chapters WHERE edition_id = ?1 AND slot_id = ?2",
            params![edition.id, input.slot_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    // =========================================================================
    // Chapter Contexts
    // =========================================================================

    /// Store the extraction result of a chapter, replacing any earlier one
    pub async fn save_chapter_context(&self, record: &ChapterContextRecord) -> Result<()> {
        let record = record.clone();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO chapter_contexts
                        (chapter_id, characters, places, terms, summary, source_hash, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        record.chapter_id,
                        serde_json::to_string(&record.characters)?,
                        serde_json::to_string(&record.places)?,
                        serde_json::to_string(&record.terms)?,
                        record.summary,
                        record.source_hash,
                        record.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_chapter_context(&self, chapter_id: i64) -> Result<Option<ChapterContextRecord>> {
        self.db
            .execute_async(move |conn| {
                Ok(conn
                    .query_row(
                        r#"
                        SELECT chapter_id, characters, places, terms, summary, source_hash, updated_at
                        FROM chapter_contexts WHERE chapter_id = ?1
                        "#,
                        [chapter_id],
                        parse_context_row,
                    )
                    .optional()?)
            })
            .await
    }

    /// Source-edition contexts of a work, ordered by chapter number
    pub fn contexts_for_work_sync(conn: &Connection, work_id: i64) -> Result<Vec<SlotContext>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT cc.chapter_id, cc.characters, cc.places, cc.terms, cc.summary, cc.source_hash,
                   cc.updated_at, s.id, s.number
            FROM chapter_contexts cc
            JOIN chapters c ON c.id = cc.chapter_id
            JOIN editions e ON e.id = c.edition_id
            JOIN chapter_slots s ON s.id = c.slot_id
            WHERE e.work_id = ?1 AND e.is_source = 1
            ORDER BY s.number
            "#,
        )?;
        let contexts = stmt
            .query_map([work_id], |row| {
                Ok(SlotContext {
                    context: parse_context_row(row)?,
                    slot_id: row.get(7)?,
                    number: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contexts)
    }

    /// Summary candidates for up to `window` slots before `before_number`, newest first
    pub async fn prior_summaries(
        &self,
        work_id: i64,
        before_number: i64,
        language: &str,
        window: usize,
    ) -> Result<Vec<SlotSummaries>> {
        let language = language_utils::normalize_to_part1_or_part2t(language)?;

        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT s.number,
                        (SELECT c.summary FROM chapters c
                           JOIN editions e ON e.id = c.edition_id
                          WHERE c.slot_id = s.id AND e.language = ?3
                            AND c.summary IS NOT NULL AND c.summary != ''),
                        (SELECT cc.summary FROM chapter_contexts cc
                           JOIN chapters c ON c.id = cc.chapter_id
                           JOIN editions e ON e.id = c.edition_id
                          WHERE c.slot_id = s.id AND e.is_source = 1 AND cc.summary != '')
                    FROM chapter_slots s
                    WHERE s.work_id = ?1 AND s.number < ?2
                    ORDER BY s.number DESC
                    LIMIT ?4
                    "#,
                )?;
                let rows = stmt
                    .query_map(params![work_id, before_number, language, window as i64], |row| {
                        Ok(SlotSummaries {
                            number: row.get(0)?,
                            translated: row.get(1)?,
                            source: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    // =========================================================================
    // Entities
    // =========================================================================

    pub fn entities_for_work_sync(conn: &Connection, work_id: i64) -> Result<Vec<EntityRecord>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, work_id, source_name, entity_type, first_slot_id, last_slot_id,
                   occurrence_count, priority
            FROM entities WHERE work_id = ?1 ORDER BY priority, id
            "#,
        )?;
        let entities = stmt
            .query_map([work_id], |row| {
                Ok(EntityRecord {
                    id: row.get(0)?,
                    work_id: row.get(1)?,
                    source_name: row.get(2)?,
                    entity_type: parse_column(row, 3)?,
                    first_slot_id: row.get(4)?,
                    last_slot_id: row.get(5)?,
                    occurrence_count: row.get(6)?,
                    priority: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    pub async fn list_entities(&self, work_id: i64) -> Result<Vec<EntityRecord>> {
        self.db
            .execute_async(move |conn| Self::entities_for_work_sync(conn, work_id))
            .await
    }

    /// Entities joined with slot numbers and their `language` translation
    ///
    /// With `up_to_number`, only entities first seen at or before that chapter.
    pub async fn entity_views(
        &self,
        work_id: i64,
        language: &str,
        up_to_number: Option<i64>,
    ) -> Result<Vec<EntityView>> {
        let language = language_utils::normalize_to_part1_or_part2t(language)?;

        self.db
            .execute_async(move |conn| {
                let sql = format!(
                    "{} WHERE en.work_id = ?1 AND (?3 IS NULL OR f.number <= ?3) ORDER BY en.priority, en.id",
                    ENTITY_VIEW_SELECT
                );
                let mut stmt = conn.prepare(&sql)?;
                let views = stmt
                    .query_map(params![work_id, language, up_to_number], |row| {
                        Ok(EntityView {
                            id: row.get(0)?,
                            source_name: row.get(1)?,
                            entity_type: parse_column(row, 2)?,
                            first_number: row.get(3)?,
                            last_number: row.get(4)?,
                            occurrence_count: row.get(5)?,
                            priority: row.get(6)?,
                            translated_name: row.get(7)?,
                            is_manual: row.get(8)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(views)
            })
            .await
    }

    /// Insert a new entity row; `entity.id` is ignored
    pub fn insert_entity_sync(conn: &Connection, entity: &EntityRecord) -> Result<i64> {
        conn.execute(
            r#"
            INSERT INTO entities (work_id, source_name, entity_type, first_slot_id, last_slot_id,
                                  occurrence_count, priority, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                entity.work_id,
                entity.source_name,
                entity.entity_type.to_string(),
                entity.first_slot_id,
                entity.last_slot_id,
                entity.occurrence_count,
                entity.priority,
                now_timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrite the derived fields of an entity; translations are untouched
    pub fn update_entity_sync(conn: &Connection, entity: &EntityRecord) -> Result<()> {
        conn.execute(
            r#"
            UPDATE entities
            SET entity_type = ?2, first_slot_id = ?3, last_slot_id = ?4,
                occurrence_count = ?5, priority = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
            params![
                entity.id,
                entity.entity_type.to_string(),
                entity.first_slot_id,
                entity.last_slot_id,
                entity.occurrence_count,
                entity.priority,
                now_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_entity_sync(conn: &Connection, entity_id: i64) -> Result<()> {
        conn.execute("DELETE FROM entities WHERE id = ?1", [entity_id])?;
        Ok(())
    }

    pub fn find_entity_id_sync(conn: &Connection, work_id: i64, source_name: &str) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT id FROM entities WHERE work_id = ?1 AND source_name = ?2",
                params![work_id, source_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_entity_translation_sync(
        conn: &Connection,
        entity_id: i64,
        language: &str,
    ) -> Result<Option<EntityTranslationRecord>> {
        Ok(conn
            .query_row(
                r#"
                SELECT entity_id, language, translated_name, is_manual
                FROM entity_translations WHERE entity_id = ?1 AND language = ?2
                "#,
                params![entity_id, language],
                parse_translation_row,
            )
            .optional()?)
    }

    pub fn upsert_entity_translation_sync(
        conn: &Connection,
        entity_id: i64,
        language: &str,
        translated_name: &str,
        is_manual: bool,
    ) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO entity_translations (entity_id, language, translated_name, is_manual, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id, language) DO UPDATE SET
                translated_name = excluded.translated_name,
                is_manual = excluded.is_manual,
                updated_at = excluded.updated_at
            "#,
            params![entity_id, language, translated_name, is_manual, now_timestamp()],
        )?;
        Ok(())
    }

    /// Set a translation by hand; manual rows are never replaced by merges
    pub async fn set_entity_translation(
        &self,
        work_id: i64,
        source_name: &str,
        language: &str,
        translated_name: &str,
        manual: bool,
    ) -> Result<()> {
        let source_name = source_name.to_string();
        let translated_name = translated_name.trim().to_string();
        let language = language_utils::normalize_to_part1_or_part2t(language)?;
        if translated_name.is_empty() {
            return Err(anyhow!("Translation for '{}' must not be empty", source_name));
        }

        self.db
            .execute_async(move |conn| {
                let entity_id = Self::find_entity_id_sync(conn, work_id, &source_name)?
                    .ok_or_else(|| anyhow!("Work {} has no entity named '{}'", work_id, source_name))?;
                Self::upsert_entity_translation_sync(conn, entity_id, &language, &translated_name, manual)
            })
            .await
    }

    pub async fn list_entity_translations(&self, entity_id: i64) -> Result<Vec<EntityTranslationRecord>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT entity_id, language, translated_name, is_manual
                    FROM entity_translations WHERE entity_id = ?1 ORDER BY language
                    "#,
                )?;
                let rows = stmt
                    .query_map([entity_id], parse_translation_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Every translated name of a work's entities, across languages
    pub fn translated_names_for_work_sync(conn: &Connection, work_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT t.translated_name
            FROM entity_translations t
            JOIN entities en ON en.id = t.entity_id
            WHERE en.work_id = ?1
            "#,
        )?;
        let names = stmt
            .query_map([work_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    // =========================================================================
    // Keywords
    // =========================================================================

    pub fn replace_work_keywords_sync(conn: &Connection, work_id: i64, keywords: &[String]) -> Result<usize> {
        conn.execute("DELETE FROM work_keywords WHERE work_id = ?1", [work_id])?;
        let mut stmt =
            conn.prepare("INSERT OR IGNORE INTO work_keywords (work_id, keyword) VALUES (?1, ?2)")?;
        let mut inserted = 0;
        for keyword in keywords {
            inserted += stmt.execute(params![work_id, keyword])?;
        }
        Ok(inserted)
    }

    pub async fn list_work_keywords(&self, work_id: i64) -> Result<Vec<String>> {
        self.db
            .execute_async(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT keyword FROM work_keywords WHERE work_id = ?1 ORDER BY keyword")?;
                let keywords = stmt
                    .query_map([work_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(keywords)
            })
            .await
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Create a pending job unless an active one already covers the same target
    pub async fn enqueue_job(
        &self,
        kind: JobKind,
        chapter_id: i64,
        target_language: Option<&str>,
        max_attempts: u32,
    ) -> Result<EnqueueOutcome> {
        let target_language = match target_language {
            Some(lang) => language_utils::normalize_to_part1_or_part2t(lang)?,
            None => String::new(),
        };
        if kind == JobKind::Translation && target_language.is_empty() {
            return Err(anyhow!("Translation jobs need a target language"));
        }

        self.db
            .transaction_async(move |tx| {
                let job_id = Uuid::new_v4().to_string();
                let now = now_timestamp();
                let inserted = tx.execute(
                    r#"
                    INSERT OR IGNORE INTO jobs (id, kind, chapter_id, target_language, status,
                                                max_attempts, next_run_at, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6, ?6)
                    "#,
                    params![job_id, kind.to_string(), chapter_id, target_language, max_attempts, now],
                )?;

                if inserted == 1 {
                    debug!("Enqueued {} job {} for chapter {}", kind, job_id, chapter_id);
                    return Ok(EnqueueOutcome { job_id, created: true });
                }

                let existing: String = tx
                    .query_row(
                        r#"
                        SELECT id FROM jobs
                        WHERE chapter_id = ?1 AND kind = ?2 AND target_language = ?3
                          AND status IN ('pending', 'in_progress', 'failed')
                        "#,
                        params![chapter_id, kind.to_string(), target_language],
                        |row| row.get(0),
                    )
                    .context("Enqueue was ignored but no active job exists")?;
                Ok(EnqueueOutcome {
                    job_id: existing,
                    created: false,
                })
            })
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let job_id = job_id.to_string();
        self.db
            .execute_async(move |conn| {
                let sql = format!("{} WHERE id = ?1", JOB_SELECT);
                Ok(conn.query_row(&sql, [job_id], parse_job_row).optional()?)
            })
            .await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.db
            .execute_async(move |conn| {
                let sql = format!(
                    "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id",
                    JOB_SELECT
                );
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map([status.map(|s| s.to_string())], parse_job_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(jobs)
            })
            .await
    }

    /// Claimable jobs, extraction first, oldest due first
    pub async fn due_jobs(&self, now: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let now = now.to_string();
        self.db
            .execute_async(move |conn| {
                let sql = format!(
                    r#"{}
                    WHERE status IN ('pending', 'failed') AND next_run_at <= ?1
                    ORDER BY CASE kind WHEN 'extraction' THEN 0 ELSE 1 END, next_run_at, created_at
                    LIMIT ?2"#,
                    JOB_SELECT
                );
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map(params![now, limit as i64], parse_job_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(jobs)
            })
            .await
    }

    /// Compare-and-set claim
    ///
    /// Succeeds only if the job is still claimable and no other job for the
    /// same chapter is running. Counts the attempt.
    pub async fn claim_job(&self, job_id: &str, runner_id: &str, now: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        let runner_id = runner_id.to_string();
        let now = now.to_string();

        self.db
            .execute_async(move |conn| {
                let rows = conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = 'in_progress', attempts = attempts + 1,
                        claimed_by = ?2, claimed_at = ?3, updated_at = ?3
                    WHERE id = ?1
                      AND status IN ('pending', 'failed')
                      AND next_run_at <= ?3
                      AND NOT EXISTS (
                          SELECT 1 FROM jobs other
                          WHERE other.chapter_id = jobs.chapter_id
                            AND other.status = 'in_progress'
                            AND other.id != jobs.id
                      )
                    "#,
                    params![job_id, runner_id, now],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    pub async fn complete_job(&self, job_id: &str, runner_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        let runner_id = runner_id.to_string();

        self.db
            .execute_async(move |conn| {
                let rows = conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = 'done', last_error = NULL, claimed_by = NULL, claimed_at = NULL,
                        updated_at = ?3
                    WHERE id = ?1 AND claimed_by = ?2 AND status = 'in_progress'
                    "#,
                    params![job_id, runner_id, now_timestamp()],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    /// Release a claimed job for another attempt at `next_run_at`
    pub async fn fail_job(
        &self,
        job_id: &str,
        runner_id: &str,
        error_json: &str,
        next_run_at: &str,
        parse_failure: bool,
    ) -> Result<bool> {
        let job_id = job_id.to_string();
        let runner_id = runner_id.to_string();
        let error_json = error_json.to_string();
        let next_run_at = next_run_at.to_string();

        self.db
            .execute_async(move |conn| {
                let rows = conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = 'failed', last_error = ?3, next_run_at = ?4,
                        parse_failures = parse_failures + ?5,
                        claimed_by = NULL, claimed_at = NULL, updated_at = ?6
                    WHERE id = ?1 AND claimed_by = ?2 AND status = 'in_progress'
                    "#,
                    params![
                        job_id,
                        runner_id,
                        error_json,
                        next_run_at,
                        i64::from(parse_failure),
                        now_timestamp()
                    ],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    /// Mark a claimed job dead; it will not run again
    pub async fn bury_job(&self, job_id: &str, runner_id: &str, error_json: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        let runner_id = runner_id.to_string();
        let error_json = error_json.to_string();

        self.db
            .execute_async(move |conn| {
                let rows = conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = 'dead', last_error = ?3, claimed_by = NULL, claimed_at = NULL,
                        updated_at = ?4
                    WHERE id = ?1 AND claimed_by = ?2 AND status = 'in_progress'
                    "#,
                    params![job_id, runner_id, error_json, now_timestamp()],
                )?;
                Ok(rows == 1)
            })
            .await
    }

    /// Release jobs whose claim is older than `cutoff`
    ///
    /// Jobs with attempts left become failed and due now; the rest are dead.
    pub async fn recover_stale_jobs(&self, cutoff: &str) -> Result<usize> {
        let cutoff = cutoff.to_string();

        self.db
            .execute_async(move |conn| {
                let now = now_timestamp();
                let rows = conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = CASE WHEN attempts >= max_attempts THEN 'dead' ELSE 'failed' END,
                        last_error = COALESCE(last_error, ?2),
                        claimed_by = NULL, claimed_at = NULL, next_run_at = ?3, updated_at = ?3
                    WHERE status = 'in_progress' AND claimed_at < ?1
                    "#,
                    params![cutoff, r#"{"kind":"stale_claim","message":"Claim expired"}"#, now],
                )?;
                Ok(rows)
            })
            .await
    }

    pub async fn job_stats(&self) -> Result<JobStats> {
        self.db
            .execute_async(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut stats = JobStats::default();
                while let Some(row) = rows.next()? {
                    let count: i64 = row.get(1)?;
                    match parse_column::<JobStatus>(row, 0)? {
                        JobStatus::Pending => stats.pending = count,
                        JobStatus::InProgress => stats.in_progress = count,
                        JobStatus::Done => stats.done = count,
                        JobStatus::Failed => stats.failed = count,
                        JobStatus::Dead => stats.dead = count,
                    }
                }
                Ok(stats)
            })
            .await
    }
}

/// Parse a text column through `FromStr`, reporting bad values as conversion errors
fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let value: String = row.get(idx)?;
    value
        .parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_json_list(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_chapter_row(row: &Row) -> rusqlite::Result<ChapterRecord> {
    Ok(ChapterRecord {
        id: row.get(0)?,
        work_id: row.get(1)?,
        edition_id: row.get(2)?,
        language: row.get(3)?,
        is_source: row.get(4)?,
        slot_id: row.get(5)?,
        number: row.get(6)?,
        slot_title: row.get(7)?,
        title: row.get(8)?,
        content: row.get(9)?,
        content_hash: row.get(10)?,
        summary: row.get(11)?,
        entity_validation_warning: row.get(12)?,
        missing_entities: parse_json_list(row, 13)?,
        updated_at: row.get(14)?,
    })
}

fn parse_context_row(row: &Row) -> rusqlite::Result<ChapterContextRecord> {
    Ok(ChapterContextRecord {
        chapter_id: row.get(0)?,
        characters: parse_json_list(row, 1)?,
        places: parse_json_list(row, 2)?,
        terms: parse_json_list(row, 3)?,
        summary: row.get(4)?,
        source_hash: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn parse_translation_row(row: &Row) -> rusqlite::Result<EntityTranslationRecord> {
    Ok(EntityTranslationRecord {
        entity_id: row.get(0)?,
        language: row.get(1)?,
        translated_name: row.get(2)?,
        is_manual: row.get(3)?,
    })
}

fn parse_job_row(row: &Row) -> rusqlite::Result<JobRecord> {
    let target_language: String = row.get(3)?;
    Ok(JobRecord {
        id: row.get(0)?,
        kind: parse_column(row, 1)?,
        chapter_id: row.get(2)?,
        target_language: (!target_language.is_empty()).then_some(target_language),
        status: parse_column(row, 4)?,
        attempts: row.get(5)?,
        parse_failures: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        claimed_by: row.get(9)?,
        next_run_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
