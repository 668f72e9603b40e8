/*!
 * # namesake - entity-consistent translation of serialized fiction
 *
 * A Rust library for translating web novels and other serialized fiction
 * chapter by chapter with LLMs while keeping character, place and term
 * names consistent across the whole work.
 *
 * ## Features
 *
 * - Extract named entities and a summary from each chapter
 * - Maintain a per-work entity registry, rebuilt incrementally from chapter contexts
 * - Translate chapters using various AI providers:
 *   - Ollama (local LLM)
 *   - OpenAI API (and LM Studio)
 *   - Anthropic API
 * - Feed established name translations and earlier summaries into every prompt
 * - Background jobs with bounded concurrency, retries and atomic claims
 * - ISO 639-1 and ISO 639-2 language code support
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `database`: SQLite storage for works, chapters, entities and jobs
 * - `extraction`: Entity extraction from chapter text
 * - `registry`: Book-level entity registry and translation merging
 * - `translation`: Context building, prompts and the chapter translation service
 * - `jobs`: Job runner, retry policy and post-commit hooks
 * - `app_controller`: Main application controller
 * - `language_utils`: ISO language code utilities
 * - `providers`: Client implementations for various LLM providers:
 *   - `providers::ollama`: Ollama API client
 *   - `providers::openai`: OpenAI API client
 *   - `providers::anthropic`: Anthropic API client
 * - `errors`: Custom error types for the application
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod database;
pub mod errors;
pub mod extraction;
pub mod jobs;
pub mod language_utils;
pub mod providers;
pub mod registry;
pub mod translation;

// Re-export main types for easier usage
pub use app_config::Config;
pub use errors::{AppError, PipelineError, ProviderError};
pub use jobs::{BatchReport, JobRunner};
pub use language_utils::{get_language_name, language_codes_match, normalize_to_part2t};
pub use registry::EntityRegistry;
pub use translation::ChapterTranslator;
