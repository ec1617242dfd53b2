//! HTTP handlers and the state they share.

use crate::services::template_service::TemplateService;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

pub mod health_handlers;
pub mod template_handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: TemplateService,
    /// Pool behind the catalog, used directly by readiness checks.
    pub db: Arc<SqlitePool>,
    pub storage_dir: PathBuf,
}
