/*!
 * Database module for persistent pipeline state.
 *
 * This module provides SQLite-based persistence for:
 * - Works, editions and chapter text
 * - Extraction results and the derived entity registry
 * - The job table driving extraction and translation
 */

pub mod schema;
pub mod connection;
pub mod repository;
pub mod models;

// Re-export main types
pub use connection::DatabaseConnection;
pub use repository::Repository;
