//! HTTP handlers for template placement on stores. Thin wrappers that
//! delegate to `TemplateService`.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::association::TemplateDataStore,
    services::{template_service::TemplateApiResult, template_sync::SyncReport},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

/// GET `/stores/{store_id}/templates`: association rows on a store.
pub async fn list_store_templates(
    State(state): State<AppState>,
    Path(store_id): Path<i64>,
) -> Result<Json<Vec<TemplateDataStore>>, AppError> {
    Ok(Json(state.service.list_associations(store_id).await?))
}

/// POST `/stores/{store_id}/sync`: run one reconciliation sweep now.
pub async fn sync_store(
    State(state): State<AppState>,
    Path(store_id): Path<i64>,
) -> Result<Json<SyncReport>, AppError> {
    let store = state.service.find_store(store_id).await?;
    Ok(Json(state.service.handle_template_sync(&store).await?))
}

/// POST `/stores/{store_id}/templates/{template_id}`: start a download.
///
/// Answers 202 with the row as it stands after the request; the download
/// itself completes in the background.
pub async fn create_store_template(
    State(state): State<AppState>,
    Path((store_id, template_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let object = state.service.template_on_store(template_id, store_id).await?;
    state.service.create_template_async(object, None).await;

    let rows = state.service.list_associations(store_id).await?;
    let row = rows.into_iter().find(|r| r.template_id == template_id);
    Ok((StatusCode::ACCEPTED, Json(row)))
}

/// DELETE `/stores/{store_id}/templates/{template_id}`: delete and wait.
pub async fn delete_store_template(
    State(state): State<AppState>,
    Path((store_id, template_id)): Path<(i64, i64)>,
) -> Result<Json<TemplateApiResult>, AppError> {
    let object = state.service.template_on_store(template_id, store_id).await?;
    let result = state.service.delete_template_async(object).await.await?;
    delete_response(result)
}

/// Map a delete outcome to a response: 502 when the endpoint refused and the
/// row was failed, 409 when the delete was not legal for the row at all.
fn delete_response(result: TemplateApiResult) -> Result<Json<TemplateApiResult>, AppError> {
    match (&result.error, &result.association) {
        (None, _) => Ok(Json(result)),
        (Some(msg), Some(_)) => Err(AppError::new(StatusCode::BAD_GATEWAY, msg.clone())),
        (Some(msg), None) => Err(AppError::new(StatusCode::CONFLICT, msg.clone())),
    }
}
