/*!
 * Prompt templates for chapter translation.
 *
 * The system prompt carries the rules; the user prompt is a JSON request
 * holding the vocabulary, the summaries of earlier chapters and the chapter
 * itself, so the model sees structure rather than free text.
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::translation::context::{PriorSummary, TranslationContext, VocabularyEntry};

/// System prompt template with language placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    /// The template string with placeholders
    template: String,
}

impl PromptTemplate {
    /// The default system prompt for chapter translation.
    pub const CHAPTER_TRANSLATOR: &'static str = r#"You are an expert literary translator specializing in {source_language} to {target_language} translation of serialized fiction.

## Your Role
- Translate the chapter completely, preserving meaning, tone and paragraph breaks
- Keep every name consistent with the established vocabulary
- Write natural, idiomatic {target_language} prose

## Vocabulary Rules
- Entries shown as "source → translation" are established: use that translation exactly
- Entries without a translation are known names: choose a rendering and reuse it everywhere
- Report every named character, place and term you translated in "entity_mappings"

## Context Understanding
- Summaries of previous chapters are provided for continuity only; do not translate them

## Output Requirements
- Return ONLY valid JSON with these keys:
  {"title": string, "content": string, "entity_mappings": {source name: translated name}, "summary": string}
- "summary" is a two or three sentence summary of this chapter in {target_language}
- Do not include any text outside the JSON structure"#;

    /// Create a new prompt template.
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }

    /// Create the default chapter translator template.
    pub fn chapter_translator() -> Self {
        Self::new(Self::CHAPTER_TRANSLATOR)
    }

    /// Render the template with the given variables.
    pub fn render(&self, source_language: &str, target_language: &str) -> String {
        self.template
            .replace("{source_language}", source_language)
            .replace("{target_language}", target_language)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::chapter_translator()
    }
}

/// Builder for constructing chapter translation prompts.
#[derive(Debug, Clone)]
pub struct TranslationPromptBuilder {
    source_language: String,
    target_language: String,
    vocabulary: Vec<VocabularyEntry>,
    prior_summaries: Vec<PriorSummary>,
    style_hints: Vec<String>,
    title: String,
    content: String,
}

impl TranslationPromptBuilder {
    /// Create a new prompt builder; languages are display names.
    pub fn new(source_language: &str, target_language: &str) -> Self {
        Self {
            source_language: source_language.to_string(),
            target_language: target_language.to_string(),
            vocabulary: Vec::new(),
            prior_summaries: Vec::new(),
            style_hints: Vec::new(),
            title: String::new(),
            content: String::new(),
        }
    }

    /// Take vocabulary, summaries and hints from a built context.
    pub fn with_context(mut self, context: &TranslationContext) -> Self {
        self.vocabulary = context.vocabulary.clone();
        self.prior_summaries = context.prior_summaries.clone();
        self.style_hints = context.style_hints.clone();
        self
    }

    /// Set the chapter to translate.
    pub fn with_chapter(mut self, title: &str, content: &str) -> Self {
        self.title = title.to_string();
        self.content = content.to_string();
        self
    }

    /// Build the system prompt.
    pub fn build_system_prompt(&self) -> String {
        PromptTemplate::chapter_translator().render(&self.source_language, &self.target_language)
    }

    /// Build the user prompt as a JSON request.
    pub fn build_user_prompt(&self) -> Result<String> {
        let request = ChapterTranslationRequest {
            task: "translate_chapter".to_string(),
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
            context: ContextData {
                vocabulary: if self.vocabulary.is_empty() {
                    None
                } else {
                    Some(self.vocabulary.iter().map(vocabulary_line).collect())
                },
                previous_chapters: if self.prior_summaries.is_empty() {
                    None
                } else {
                    Some(
                        self.prior_summaries
                            .iter()
                            .map(|s| PreviousChapter {
                                chapter: s.number,
                                language: s.language.clone(),
                                summary: s.summary.clone(),
                            })
                            .collect(),
                    )
                },
            },
            chapter: ChapterToTranslate {
                title: self.title.clone(),
                content: self.content.clone(),
            },
            instructions: TranslationInstructions {
                style_hints: self.style_hints.clone(),
            },
        };

        serde_json::to_string_pretty(&request).context("Failed to encode translation request")
    }

    /// Build both system and user prompts.
    pub fn build(&self) -> Result<(String, String)> {
        Ok((self.build_system_prompt(), self.build_user_prompt()?))
    }
}

/// One vocabulary line as shown to the model
fn vocabulary_line(entry: &VocabularyEntry) -> String {
    match &entry.translated_name {
        Some(translated) => format!("{} → {} ({})", entry.source_name, translated, entry.entity_type),
        None => format!("{} ({}, no translation yet)", entry.source_name, entry.entity_type),
    }
}

/// Translation request structure for JSON communication with LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterTranslationRequest {
    /// Task identifier
    pub task: String,

    /// Source language
    pub source_language: String,

    /// Target language
    pub target_language: String,

    /// Context information
    pub context: ContextData,

    /// Chapter to translate
    pub chapter: ChapterToTranslate,

    /// Translation instructions
    pub instructions: TranslationInstructions,
}

/// Context data for translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextData {
    /// Known names, established translations first by priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocabulary: Option<Vec<String>>,

    /// Summaries of the chapters just before this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_chapters: Option<Vec<PreviousChapter>>,
}

/// Summary of an earlier chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousChapter {
    pub chapter: i64,
    pub language: String,
    pub summary: String,
}

/// The chapter to translate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterToTranslate {
    pub title: String,
    pub content: String,
}

/// Translation instructions for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationInstructions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub style_hints: Vec<String>,
}
