/*!
 * Entity extraction.
 *
 * One model call per chapter returns the characters, places and invented
 * terms the chapter mentions plus a short summary. The lists feed the
 * registry rebuild; the summary feeds later translation prompts.
 */

pub mod prompt;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::app_config::Config;
use crate::errors::{Diagnostics, PipelineError, DEFAULT_DIAGNOSTIC_CHARS};
use crate::providers::{CompletionRequest, ProviderRegistry, RequestBudget};
use crate::translation::json::{self, ResponseFault};

/// Strings made only of digits, numerals and separators
static NUMERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\p{N}\s.,:%+\-零〇一二三四五六七八九十百千万亿两]+$").expect("Invalid NUMERIC regex")
});

/// Phrases a model uses when it declines the task
const REFUSAL_PHRASES: &[&str] = &["i'm sorry", "i cannot", "i am unable", "as an ai", "my apologies"];

/// Entities and summary of one chapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub characters: Vec<String>,
    pub places: Vec<String>,
    pub terms: Vec<String>,
    pub summary: String,
}

impl ExtractionResult {
    /// Trim names and drop empties, numerals and repeats
    ///
    /// A name listed under several categories stays only in the first of
    /// characters, places, terms.
    pub fn normalized(self) -> Self {
        let mut seen = HashSet::new();
        let mut clean = |names: Vec<String>| -> Vec<String> {
            names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty() && !NUMERIC.is_match(name))
                .filter(|name| seen.insert(name.clone()))
                .collect()
        };
        let characters = clean(self.characters);
        let places = clean(self.places);
        let terms = clean(self.terms);
        Self {
            characters,
            places,
            terms,
            summary: self.summary.trim().to_string(),
        }
    }

    /// Every name, characters first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.characters
            .iter()
            .chain(&self.places)
            .chain(&self.terms)
            .map(String::as_str)
    }

    pub fn entity_count(&self) -> usize {
        self.characters.len() + self.places.len() + self.terms.len()
    }
}

/// Decode a raw model response
fn parse_response(raw: &str) -> Result<ExtractionResult, ResponseFault> {
    let map = json::parse_object(raw).map_err(|message| {
        let lowered = raw.to_lowercase();
        if REFUSAL_PHRASES.iter().any(|p| lowered.contains(p)) {
            ResponseFault::Unparseable(format!("Model declined the request: {}", message))
        } else {
            ResponseFault::Unparseable(message)
        }
    })?;

    let result = ExtractionResult {
        characters: json::string_list(&map, "characters").map_err(ResponseFault::Invalid)?,
        places: json::string_list(&map, "places").map_err(ResponseFault::Invalid)?,
        terms: json::string_list(&map, "terms").map_err(ResponseFault::Invalid)?,
        summary: json::required_string(&map, "summary").map_err(ResponseFault::Invalid)?,
    };
    Ok(result.normalized())
}

/// Calls a provider to extract entities from chapter text
#[derive(Debug, Clone)]
pub struct EntityExtractor {
    providers: Arc<ProviderRegistry>,
    budget: Arc<RequestBudget>,
    /// Provider to use; the registry default when `None`
    provider_name: Option<String>,
    temperature: f32,
    max_tokens: u32,
    error_detail_max_chars: usize,
}

impl EntityExtractor {
    pub fn new(providers: Arc<ProviderRegistry>, budget: Arc<RequestBudget>) -> Self {
        Self {
            providers,
            budget,
            provider_name: None,
            temperature: 0.0,
            max_tokens: 4096,
            error_detail_max_chars: DEFAULT_DIAGNOSTIC_CHARS,
        }
    }

    pub fn from_config(config: &Config, providers: Arc<ProviderRegistry>, budget: Arc<RequestBudget>) -> Self {
        Self {
            temperature: config.translation.common.extraction_temperature,
            max_tokens: config.translation.common.max_tokens,
            error_detail_max_chars: config.pipeline.error_detail_max_chars,
            ..Self::new(providers, budget)
        }
    }

    /// Use a specific registered provider instead of the default
    pub fn with_provider(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self
    }

    /// Build the deterministic request for one chapter
    pub fn build_request(&self, text: &str, source_language: &str) -> anyhow::Result<CompletionRequest> {
        Ok(CompletionRequest::new()
            .system(prompt::system_prompt(source_language))
            .user(prompt::user_prompt(text, source_language)?)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens))
    }

    /// Extract entities and a summary from `text`
    pub async fn extract(&self, text: &str, source_language: &str) -> Result<ExtractionResult, PipelineError> {
        let request = self
            .build_request(text, source_language)
            .map_err(|e| PipelineError::InvalidRequest(format!("{:#}", e)))?;
        let rendered = request.render();
        let max_chars = self.error_detail_max_chars;

        let provider = match &self.provider_name {
            Some(name) => self.providers.get(name),
            None => self.providers.default_provider(),
        }
        .map_err(|source| PipelineError::Provider {
            source,
            diagnostics: Diagnostics::new(&rendered, None, max_chars),
        })?;

        debug!("Extracting entities with {} ({} chars)", provider.name(), text.chars().count());
        let response = self
            .budget
            .call(provider.as_ref(), request)
            .await
            .map_err(|source| PipelineError::Provider {
                source,
                diagnostics: Diagnostics::new(&rendered, None, max_chars),
            })?;

        match parse_response(&response.content) {
            Ok(result) => {
                debug!(
                    "Extracted {} characters, {} places, {} terms",
                    result.characters.len(),
                    result.places.len(),
                    result.terms.len()
                );
                Ok(result)
            }
            Err(fault) => {
                warn!("Extraction response rejected: {:?}", fault);
                Err(fault.into_error(Diagnostics::new(&rendered, Some(&response.content), max_chars)))
            }
        }
    }
}
