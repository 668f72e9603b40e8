/*!
 * Prompt engineering for chapter translation.
 *
 * This module provides:
 * - The system prompt template shared by translation and extraction
 * - The JSON request builder for chapter translation
 */

pub mod templates;

// Re-export main types
pub use templates::{PromptTemplate, TranslationPromptBuilder};
