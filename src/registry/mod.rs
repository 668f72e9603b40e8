/*!
 * Book-level entity registry.
 *
 * Entities are derived data: `rebuild` folds every chapter context of a work
 * in chapter order and reconciles the result against the stored rows inside
 * one transaction. Existing rows are updated in place so their translations
 * survive; rows no longer referenced by any chapter are deleted.
 *
 * Translations flow the other way: each translated chapter merges its
 * name mappings into the registry, first writer wins.
 */

pub mod keywords;

pub use keywords::{KeywordIndex, SqliteKeywordIndex};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::database::models::{EntityRecord, EntityType, SlotContext};
use crate::database::Repository;
use crate::language_utils;

/// One entity as derived from the chapter contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedEntity {
    pub source_name: String,
    pub entity_type: EntityType,
    pub first_slot_id: i64,
    pub last_slot_id: i64,
    /// Number of chapters mentioning the name
    pub occurrence_count: i64,
    /// Rank of first appearance, from 0
    pub priority: i64,
}

/// Fold chapter contexts, ordered by chapter number, into entities
///
/// The result is ordered by priority.
pub fn fold_contexts(contexts: &[SlotContext]) -> Vec<FoldedEntity> {
    let mut entities: Vec<FoldedEntity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for slot in contexts {
        let mut seen_in_chapter: HashSet<&str> = HashSet::new();
        let typed = slot
            .context
            .characters
            .iter()
            .map(|n| (n, EntityType::Character))
            .chain(slot.context.places.iter().map(|n| (n, EntityType::Place)))
            .chain(slot.context.terms.iter().map(|n| (n, EntityType::Term)));

        for (name, entity_type) in typed {
            let name = name.trim();
            if name.is_empty() || !seen_in_chapter.insert(name) {
                continue;
            }
            match index.get(name) {
                Some(&i) => {
                    let entity = &mut entities[i];
                    entity.last_slot_id = slot.slot_id;
                    entity.occurrence_count += 1;
                }
                None => {
                    index.insert(name.to_string(), entities.len());
                    entities.push(FoldedEntity {
                        source_name: name.to_string(),
                        entity_type,
                        first_slot_id: slot.slot_id,
                        last_slot_id: slot.slot_id,
                        occurrence_count: 1,
                        priority: entities.len() as i64,
                    });
                }
            }
        }
    }

    entities
}

/// Row changes made by one rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Keywords stored, when the keyword index ran
    pub keywords: Option<usize>,
}

impl RebuildStats {
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl fmt::Display for RebuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created: {}, updated: {}, deleted: {}",
            self.created, self.updated, self.deleted
        )?;
        if let Some(keywords) = self.keywords {
            write!(f, ", keywords: {}", keywords)?;
        }
        Ok(())
    }
}

/// A proposed translation that lost to an established one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityConflict {
    pub source_name: String,
    pub established: String,
    pub proposed: String,
}

/// Outcome of merging name mappings into the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub overwritten: usize,
    /// Existing translations left in place
    pub kept: usize,
    /// Names with no registry entity
    pub unknown: usize,
    pub conflicts: Vec<EntityConflict>,
}

/// Apply derived entities to the stored rows of a work
fn reconcile_sync(conn: &Connection, work_id: i64, folded: &[FoldedEntity]) -> Result<RebuildStats> {
    let mut existing: HashMap<String, EntityRecord> = Repository::entities_for_work_sync(conn, work_id)?
        .into_iter()
        .map(|e| (e.source_name.clone(), e))
        .collect();
    let mut stats = RebuildStats::default();
    let mut to_insert = Vec::new();

    for entity in folded {
        match existing.remove(&entity.source_name) {
            Some(current) => {
                let desired = EntityRecord {
                    entity_type: entity.entity_type,
                    first_slot_id: entity.first_slot_id,
                    last_slot_id: entity.last_slot_id,
                    occurrence_count: entity.occurrence_count,
                    priority: entity.priority,
                    ..current.clone()
                };
                if desired != current {
                    Repository::update_entity_sync(conn, &desired)?;
                    stats.updated += 1;
                }
            }
            None => to_insert.push(entity),
        }
    }

    for entity in to_insert {
        Repository::insert_entity_sync(
            conn,
            &EntityRecord {
                id: 0,
                work_id,
                source_name: entity.source_name.clone(),
                entity_type: entity.entity_type,
                first_slot_id: entity.first_slot_id,
                last_slot_id: entity.last_slot_id,
                occurrence_count: entity.occurrence_count,
                priority: entity.priority,
            },
        )?;
        stats.created += 1;
    }

    for orphan in existing.values() {
        Repository::delete_entity_sync(conn, orphan.id)?;
        stats.deleted += 1;
    }

    Ok(stats)
}

/// Merge `mappings` (source name → translated name) for one language
///
/// Existing translations win unless `override_existing` is set; manual
/// translations always win. Runs on the caller's connection so it can share
/// a transaction with the chapter write.
pub fn merge_translations_in(
    conn: &Connection,
    work_id: i64,
    language: &str,
    mappings: &BTreeMap<String, String>,
    override_existing: bool,
) -> Result<MergeStats> {
    let language = language_utils::normalize_to_part1_or_part2t(language)?;
    let mut stats = MergeStats::default();

    for (source_name, proposed) in mappings {
        let (source_name, proposed) = (source_name.trim(), proposed.trim());
        if source_name.is_empty() || proposed.is_empty() {
            continue;
        }
        let Some(entity_id) = Repository::find_entity_id_sync(conn, work_id, source_name)? else {
            stats.unknown += 1;
            continue;
        };

        match Repository::get_entity_translation_sync(conn, entity_id, &language)? {
            None => {
                Repository::upsert_entity_translation_sync(conn, entity_id, &language, proposed, false)?;
                stats.inserted += 1;
            }
            Some(current) if current.translated_name == proposed => stats.kept += 1,
            Some(current) if override_existing && !current.is_manual => {
                Repository::upsert_entity_translation_sync(conn, entity_id, &language, proposed, false)?;
                stats.overwritten += 1;
            }
            Some(current) => {
                stats.kept += 1;
                stats.conflicts.push(EntityConflict {
                    source_name: source_name.to_string(),
                    established: current.translated_name,
                    proposed: proposed.to_string(),
                });
            }
        }
    }

    Ok(stats)
}

/// Registry service with per-work serialization
#[derive(Debug)]
pub struct EntityRegistry {
    repo: Repository,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    keyword_index: Option<Arc<dyn KeywordIndex>>,
}

impl EntityRegistry {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
            keyword_index: None,
        }
    }

    pub fn with_keyword_index(mut self, index: Arc<dyn KeywordIndex>) -> Self {
        self.keyword_index = Some(index);
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Hold the work's registry lock until the guard drops
    pub async fn lock_work(&self, work_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(work_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Recompute every entity of a work from its chapter contexts
    pub async fn rebuild(&self, work_id: i64) -> Result<RebuildStats> {
        self.rebuild_with_keywords(work_id, false).await
    }

    /// `rebuild`, then refresh the keyword index when asked and one is attached
    pub async fn rebuild_with_keywords(&self, work_id: i64, rebuild_keywords: bool) -> Result<RebuildStats> {
        let _guard = self.lock_work(work_id).await;

        let mut stats = self
            .repo
            .db()
            .transaction_async(move |tx| {
                if Repository::get_work_sync(tx, work_id)?.is_none() {
                    return Err(anyhow!("Work {} not found", work_id));
                }
                let contexts = Repository::contexts_for_work_sync(tx, work_id)?;
                let folded = fold_contexts(&contexts);
                reconcile_sync(tx, work_id, &folded)
            })
            .await?;

        if stats.writes() > 0 {
            info!("Rebuilt registry for work {}: {}", work_id, stats);
        } else {
            debug!("Registry for work {} already up to date", work_id);
        }

        if rebuild_keywords {
            match &self.keyword_index {
                Some(index) => {
                    let entities = self.repo.list_entities(work_id).await?;
                    match index.rebuild_keywords(work_id, &entities).await {
                        Ok(count) => stats.keywords = Some(count),
                        Err(e) => warn!("Keyword rebuild for work {} failed: {}", work_id, e),
                    }
                }
                None => warn!("Keyword rebuild requested but no keyword index is attached"),
            }
        }

        Ok(stats)
    }

    /// Rebuild the work that owns `chapter_id`
    pub async fn rebuild_for_chapter(&self, chapter_id: i64) -> Result<RebuildStats> {
        let chapter = self
            .repo
            .get_chapter(chapter_id)
            .await?
            .ok_or_else(|| anyhow!("Chapter {} not found", chapter_id))?;
        self.rebuild(chapter.work_id).await
    }

    /// Rebuild every work, one at a time
    pub async fn rebuild_all(&self, rebuild_keywords: bool) -> Result<Vec<(i64, RebuildStats)>> {
        let works = self.repo.list_works().await?;
        let mut results = Vec::with_capacity(works.len());
        for work in works {
            let stats = self.rebuild_with_keywords(work.id, rebuild_keywords).await?;
            results.push((work.id, stats));
        }
        Ok(results)
    }

    /// Merge name mappings for one language under the work lock
    pub async fn merge_translations(
        &self,
        work_id: i64,
        language: &str,
        mappings: &BTreeMap<String, String>,
        override_existing: bool,
    ) -> Result<MergeStats> {
        let _guard = self.lock_work(work_id).await;
        let language = language.to_string();
        let mappings = mappings.clone();

        self.repo
            .db()
            .transaction_async(move |tx| {
                merge_translations_in(tx, work_id, &language, &mappings, override_existing)
            })
            .await
    }
}
