/*!
 * Translation context assembly.
 *
 * For one chapter and target language, gathers the vocabulary the chapter
 * may use, the summaries of the chapters just before it and the configured
 * style hints. Only reads from the database.
 */

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::app_config::Config;
use crate::database::models::EntityType;
use crate::database::Repository;
use crate::language_utils;

/// A known name and its established translation, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VocabularyEntry {
    pub source_name: String,
    pub entity_type: EntityType,
    pub translated_name: Option<String>,
}

/// Summary of an earlier chapter, labelled with its language
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorSummary {
    pub number: i64,
    pub language: String,
    pub summary: String,
}

/// Everything a translation prompt needs besides the chapter itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranslationContext {
    pub chapter_number: i64,
    /// Entities first seen at or before this chapter, by priority
    pub vocabulary: Vec<VocabularyEntry>,
    /// Oldest first
    pub prior_summaries: Vec<PriorSummary>,
    pub style_hints: Vec<String>,
}

impl TranslationContext {
    /// Established translation of `source_name`
    pub fn translation_of(&self, source_name: &str) -> Option<&str> {
        self.vocabulary
            .iter()
            .find(|entry| entry.source_name == source_name)
            .and_then(|entry| entry.translated_name.as_deref())
    }
}

/// Builds `TranslationContext` values from the repository
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    repo: Repository,
    summary_window: usize,
    style_hints: Vec<String>,
}

impl ContextBuilder {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            summary_window: 3,
            style_hints: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, repo: Repository) -> Self {
        Self::new(repo)
            .with_summary_window(config.pipeline.summary_window)
            .with_style_hints(config.pipeline.style_hints.clone())
    }

    pub fn with_summary_window(mut self, window: usize) -> Self {
        self.summary_window = window;
        self
    }

    pub fn with_style_hints(mut self, hints: Vec<String>) -> Self {
        self.style_hints = hints;
        self
    }

    /// Context for chapter `chapter_number` of `work_id` in `target_language`
    pub async fn build(
        &self,
        work_id: i64,
        chapter_number: i64,
        target_language: &str,
    ) -> Result<TranslationContext> {
        let target_language = language_utils::normalize_to_part1_or_part2t(target_language)?;
        let work = self
            .repo
            .get_work(work_id)
            .await?
            .ok_or_else(|| anyhow!("Work {} not found", work_id))?;

        let vocabulary = self
            .repo
            .entity_views(work_id, &target_language, Some(chapter_number))
            .await?
            .into_iter()
            .map(|view| VocabularyEntry {
                source_name: view.source_name,
                entity_type: view.entity_type,
                translated_name: view.translated_name,
            })
            .collect();

        let mut prior_summaries = Vec::new();
        if self.summary_window > 0 {
            let candidates = self
                .repo
                .prior_summaries(work_id, chapter_number, &target_language, self.summary_window)
                .await?;
            for slot in candidates.into_iter().rev() {
                let labelled = match (slot.translated, slot.source) {
                    (Some(summary), _) => Some((target_language.clone(), summary)),
                    (None, Some(summary)) => Some((work.source_language.clone(), summary)),
                    (None, None) => None,
                };
                if let Some((language, summary)) = labelled {
                    prior_summaries.push(PriorSummary {
                        number: slot.number,
                        language,
                        summary,
                    });
                }
            }
        }

        Ok(TranslationContext {
            chapter_number,
            vocabulary,
            prior_summaries,
            style_hints: self.style_hints.clone(),
        })
    }
}
