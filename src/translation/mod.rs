/*!
 * Chapter translation.
 *
 * This module is split into several submodules:
 *
 * - `context`: Vocabulary, prior summaries and style hints for a chapter
 * - `prompts`: Prompt templates and the JSON request builder
 * - `json`: Recovery of the JSON object from model output
 * - `service`: The translate-validate-store flow for one chapter
 */

// Re-export main types for easier usage
pub use self::context::{ContextBuilder, TranslationContext, VocabularyEntry};
pub use self::prompts::{PromptTemplate, TranslationPromptBuilder};
pub use self::service::{ChapterTranslator, TranslationOutcome};

// Submodules
pub mod context;
pub mod json;
pub mod prompts;
pub mod service;
