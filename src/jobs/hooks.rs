/*!
 * Post-commit hooks.
 *
 * The runner calls every registered hook after a translated chapter has been
 * committed. Hooks see committed data only; a failing hook is logged and
 * does not affect the job.
 */

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::fmt::Debug;

/// A translated chapter that was just stored
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterTranslated {
    pub work_id: i64,
    pub source_chapter_id: i64,
    pub target_chapter_id: i64,
    pub chapter_number: i64,
    pub language: String,
    pub missing_entities: Vec<String>,
}

#[async_trait]
pub trait ChapterHook: Send + Sync + Debug {
    async fn chapter_translated(&self, event: &ChapterTranslated) -> Result<()>;
}

/// Logs each stored translation
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl ChapterHook for LoggingHook {
    async fn chapter_translated(&self, event: &ChapterTranslated) -> Result<()> {
        if event.missing_entities.is_empty() {
            info!(
                "Work {} chapter {} available in {}",
                event.work_id, event.chapter_number, event.language
            );
        } else {
            info!(
                "Work {} chapter {} available in {} ({} names unmapped)",
                event.work_id,
                event.chapter_number,
                event.language,
                event.missing_entities.len()
            );
        }
        Ok(())
    }
}
