/*!
 * Prompt for entity extraction.
 *
 * The system prompt fixes the output schema; the user message carries the
 * chapter as a JSON request so the text never mixes with instructions.
 */

use anyhow::{Context, Result};
use serde::Serialize;

use crate::language_utils;
use crate::translation::prompts::PromptTemplate;

/// System prompt for named-entity extraction.
pub const ENTITY_EXTRACTOR: &str = r#"You are a careful literary analyst reading a chapter of serialized fiction written in {source_language}.

## Your Task
- List the named, story-specific entities that appear in the chapter
- Write a short plot summary of the chapter in {source_language}

## What Counts as an Entity
- characters: personal names, titles used as names, named creatures
- places: named locations, realms, sects, organizations, buildings
- terms: invented terminology such as techniques, artifacts, ranks, substances
- Copy every name exactly as it is written in the chapter, in {source_language}

## What to Exclude
- Generic nouns and roles ("the manager", "elevator", "the old man", "sword")
- Pronouns and forms of address
- Numbers, dates and quantities
- Anything that does not appear in this chapter

## Output Requirements
- Return ONLY a JSON object with exactly these keys:
  {"characters": [string], "places": [string], "terms": [string], "summary": string}
- Use empty arrays when a category has no entries
- Do not include any text outside the JSON structure"#;

/// JSON request sent as the user message
#[derive(Debug, Clone, Serialize)]
struct ExtractionRequest<'a> {
    task: &'static str,
    source_language: &'a str,
    chapter_text: &'a str,
}

/// System prompt for a source language code
pub fn system_prompt(source_language: &str) -> String {
    let name = language_utils::prompt_language_name(source_language);
    PromptTemplate::new(ENTITY_EXTRACTOR).render(&name, &name)
}

/// User message embedding the chapter text
pub fn user_prompt(text: &str, source_language: &str) -> Result<String> {
    let request = ExtractionRequest {
        task: "extract_entities",
        source_language,
        chapter_text: text,
    };
    serde_json::to_string_pretty(&request).context("Failed to encode extraction request")
}
