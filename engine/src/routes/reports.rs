use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Multipart, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    AppState,
    pipeline::types::{NormalizedTradeline, PipelineResult},
};

#[derive(Deserialize)]
struct TradelineQuery {
    user_id: String,
}

#[derive(Serialize)]
struct TradelineListResponse {
    total: usize,
    tradelines: Vec<NormalizedTradeline>,
}

pub fn report_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reports", post(process_report))
        .route("/tradelines", get(list_tradelines))
}

/// Accepts a multipart upload (`file` plus `user_id`) and runs the pipeline
/// synchronously. The result object always comes back as the body; the status
/// code reflects whether the input itself was usable.
async fn process_report(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PipelineResult>), (StatusCode, String)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut part_mime: Option<String> = None;
    let mut mime_override: Option<String> = None;
    let mut user_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid multipart payload: {err}"),
        )
    })? {
        match field.name() {
            Some("file") => {
                part_mime = field
                    .content_type()
                    .map(|ct| ct.to_string())
                    .or_else(|| guess_mime(field.file_name()));
                let data = field.bytes().await.map_err(|err| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("failed to read upload field: {err}"),
                    )
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("user_id") => {
                let value = field.text().await.map_err(|err| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("failed to read user_id field: {err}"),
                    )
                })?;
                user_id = Some(value.trim().to_string());
            }
            // Explicit override for clients whose multipart layer mislabels
            // the file part.
            Some("mime") => {
                let value = field.text().await.map_err(|err| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("failed to read mime field: {err}"),
                    )
                })?;
                mime_override = Some(value.trim().to_string());
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing file field".to_string()))?;
    let user_id = user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing user_id field".to_string()))?;
    let mime = mime_override
        .or(part_mime)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    info!(user_id, bytes = file_bytes.len(), %mime, "report upload received");
    let result = state.pipeline.process(file_bytes, &mime, &user_id).await;

    // Input rejection is the caller's problem; everything downstream of a
    // valid document, timeouts included, still answers 200 with the result
    // object.
    let rejected_input = result
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("invalid input document"));
    let status = if rejected_input {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

async fn list_tradelines(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradelineQuery>,
) -> Result<Json<TradelineListResponse>, (StatusCode, String)> {
    let tradelines = state
        .storage
        .list_for_user(&query.user_id)
        .await
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to load tradelines: {err}"),
            )
        })?;

    Ok(Json(TradelineListResponse {
        total: tradelines.len(),
        tradelines,
    }))
}

fn guess_mime(file_name: Option<&str>) -> Option<String> {
    file_name.and_then(|name| {
        name.rsplit('.')
            .next()
            .filter(|ext| ext.eq_ignore_ascii_case("pdf"))
            .map(|_| "application/pdf".to_string())
    })
}
