/*!
 * Background job processing.
 *
 * - `runner`: claims and executes extraction and translation jobs
 * - `retry`: backoff and dead-lettering decisions
 * - `hooks`: callbacks run after a translation is committed
 */

pub mod hooks;
pub mod retry;
pub mod runner;

pub use hooks::{ChapterHook, ChapterTranslated, LoggingHook};
pub use retry::{Disposition, RetryPolicy};
pub use runner::{BatchReport, JobRunner};
