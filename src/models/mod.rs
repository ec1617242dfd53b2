//! Core records for the template lifecycle orchestrator.
//!
//! These entities mirror the catalog and association tables. They map to
//! database rows via `sqlx::FromRow` and serialize as JSON via `serde` for
//! the diagnostic routes.

pub mod association;
pub mod data_object;
pub mod store;
pub mod template;
pub mod zone;
