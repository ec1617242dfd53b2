//! Defines the orchestrator's HTTP surface.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **Store-level endpoints**
//!   - `GET    /stores/{store_id}/templates` lists association rows
//!   - `POST   /stores/{store_id}/sync` runs a reconciliation sweep
//!
//! - **Template-on-store endpoints**
//!   - `POST   /stores/{store_id}/templates/{template_id}` starts a download
//!   - `DELETE /stores/{store_id}/templates/{template_id}` deletes and waits

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    template_handlers::{
        create_store_template, delete_store_template, list_store_templates, sync_store,
    },
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. Handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stores/{store_id}/templates", get(list_store_templates))
        .route("/stores/{store_id}/sync", post(sync_store))
        .route(
            "/stores/{store_id}/templates/{template_id}",
            post(create_store_template).delete(delete_store_template),
        )
}
