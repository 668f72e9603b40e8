/*!
 * Keyword index collaborator.
 *
 * After a rebuild the registry can hand the reconciled entity list to a
 * keyword index, which keeps the per-work keyword set used by search.
 */

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::collections::BTreeSet;
use std::fmt::Debug;

use crate::database::models::EntityRecord;
use crate::database::Repository;

/// Receives the entity list of a work after each keyword-enabled rebuild
#[async_trait]
pub trait KeywordIndex: Send + Sync + Debug {
    /// Replace the keywords of `work_id`; returns how many are stored
    async fn rebuild_keywords(&self, work_id: i64, entities: &[EntityRecord]) -> Result<usize>;
}

/// Stores source names and every known translation in `work_keywords`
#[derive(Debug, Clone)]
pub struct SqliteKeywordIndex {
    repo: Repository,
}

impl SqliteKeywordIndex {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl KeywordIndex for SqliteKeywordIndex {
    async fn rebuild_keywords(&self, work_id: i64, entities: &[EntityRecord]) -> Result<usize> {
        let source_names: Vec<String> = entities.iter().map(|e| e.source_name.clone()).collect();

        let count = self
            .repo
            .db()
            .transaction_async(move |tx| {
                let mut keywords: BTreeSet<String> = source_names.into_iter().collect();
                keywords.extend(
                    Repository::translated_names_for_work_sync(tx, work_id)?
                        .into_iter()
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty()),
                );
                let keywords: Vec<String> = keywords.into_iter().collect();
                Repository::replace_work_keywords_sync(tx, work_id, &keywords)
            })
            .await?;

        debug!("Stored {} keywords for work {}", count, work_id);
        Ok(count)
    }
}
