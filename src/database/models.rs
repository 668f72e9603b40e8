/*!
 * Database entity models and DTOs.
 *
 * These structures map directly to database tables and provide
 * type-safe access to persisted data.
 */

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp format used in every table: RFC 3339, UTC, millisecond precision
///
/// Fixed width, so string comparison in SQL matches chronological order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Kind of named entity tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Character,
    Place,
    Term,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Character => write!(f, "character"),
            EntityType::Place => write!(f, "place"),
            EntityType::Term => write!(f, "term"),
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "character" => Ok(EntityType::Character),
            "place" => Ok(EntityType::Place),
            "term" => Ok(EntityType::Term),
            _ => Err(anyhow::anyhow!("Invalid entity type: {}", s)),
        }
    }
}

/// Job kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Extract entities and a summary from a source chapter
    Extraction,
    /// Translate a source chapter into one target language
    Translation,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Extraction => write!(f, "extraction"),
            JobKind::Translation => write!(f, "translation"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extraction" => Ok(JobKind::Extraction),
            "translation" => Ok(JobKind::Translation),
            _ => Err(anyhow::anyhow!("Invalid job kind: {}", s)),
        }
    }
}

/// Job status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by a runner
    InProgress,
    /// Finished successfully
    Done,
    /// Last attempt failed; eligible again at `next_run_at`
    Failed,
    /// Out of attempts or permanently failed
    Dead,
}

impl JobStatus {
    /// Statuses covered by the one-active-job-per-target rule
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Work record (one source story)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: i64,
    pub title: String,
    pub source_language: String,
    pub created_at: String,
}

/// Edition record (one language instance of a work)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditionRecord {
    pub id: i64,
    pub work_id: i64,
    pub language: String,
    pub is_source: bool,
}

/// Chapter row joined with its slot, edition and work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: i64,
    pub work_id: i64,
    pub edition_id: i64,
    pub language: String,
    pub is_source: bool,
    pub slot_id: i64,
    pub number: i64,
    pub slot_title: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub summary: Option<String>,
    pub entity_validation_warning: Option<String>,
    pub missing_entities: Vec<String>,
    pub updated_at: String,
}

/// Values written when a translated chapter is stored
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedChapterInput {
    pub work_id: i64,
    pub slot_id: i64,
    pub language: String,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub entity_validation_warning: Option<String>,
    pub missing_entities: Vec<String>,
}

/// Extraction output persisted for one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterContextRecord {
    pub chapter_id: i64,
    pub characters: Vec<String>,
    pub places: Vec<String>,
    pub terms: Vec<String>,
    pub summary: String,
    /// Content hash of the chapter text the extraction ran against
    pub source_hash: String,
    pub updated_at: String,
}

/// Chapter context together with the position of its slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotContext {
    pub slot_id: i64,
    pub number: i64,
    pub context: ChapterContextRecord,
}

/// Entity record as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i64,
    pub work_id: i64,
    pub source_name: String,
    pub entity_type: EntityType,
    pub first_slot_id: i64,
    pub last_slot_id: i64,
    pub occurrence_count: i64,
    pub priority: i64,
}

/// Entity joined with slot numbers and one language's translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub id: i64,
    pub source_name: String,
    pub entity_type: EntityType,
    pub first_number: i64,
    pub last_number: i64,
    pub occurrence_count: i64,
    pub priority: i64,
    pub translated_name: Option<String>,
    pub is_manual: bool,
}

/// One stored translation of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTranslationRecord {
    pub entity_id: i64,
    pub language: String,
    pub translated_name: String,
    pub is_manual: bool,
}

/// Job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub chapter_id: i64,
    /// Target language for translation jobs; `None` for extraction
    pub target_language: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub parse_failures: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub next_run_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub job_id: String,
    /// False when an active job for the same target already existed
    pub created: bool,
}

/// Job counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: i64,
    pub in_progress: i64,
    pub done: i64,
    pub failed: i64,
    pub dead: i64,
}

impl fmt::Display for JobStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending: {}, in progress: {}, done: {}, failed: {}, dead: {}",
            self.pending, self.in_progress, self.done, self.failed, self.dead
        )
    }
}
