//! The template-to-zone availability join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Records that a template is available to a zone.
///
/// Re-associating an existing pair only refreshes `last_updated`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct TemplateZone {
    pub id: i64,
    pub zone_id: i64,
    pub template_id: i64,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}
