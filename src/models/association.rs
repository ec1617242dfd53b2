//! Represents the presence of a template on one store.

use crate::models::store::StoreRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle state of a template on a store, driven by the state machine.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
pub enum ObjectState {
    Allocated,
    Creating,
    Ready,
    Destroying,
    Failed,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Download bookkeeping as reported by the reconciliation sweep.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    NotDownloaded,
    Downloaded,
    DownloadError,
    DownloadInProgress,
}

/// One association row: a template on a concrete store.
///
/// At most one row exists per `(store_id, template_id)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct TemplateDataStore {
    pub id: i64,
    pub store_id: i64,
    pub template_id: i64,
    pub state: ObjectState,

    /// 0-100.
    pub download_pct: i64,
    pub download_state: DownloadStatus,

    /// Path of the payload relative to the store root.
    pub install_path: Option<String>,
    pub size: i64,
    pub physical_size: i64,
    pub error_str: Option<String>,

    /// Source URL captured when the row was written.
    pub url: Option<String>,
    pub store_role: StoreRole,
    pub last_updated: DateTime<Utc>,
}

/// Where a template landed on a store and how large it is there.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct InstallInfo {
    pub install_path: String,
    pub size: i64,
    pub physical_size: i64,
}

/// Initial contents for an association row created outside the state
/// machine (sweep discovery, pre-seeding).
#[derive(Clone, Debug)]
pub struct NewAssociation {
    pub store_id: i64,
    pub template_id: i64,
    pub state: ObjectState,
    pub download_pct: i64,
    pub download_state: DownloadStatus,
    pub install: Option<InstallInfo>,
    pub error_str: Option<String>,
    pub url: Option<String>,
    pub store_role: StoreRole,
}
