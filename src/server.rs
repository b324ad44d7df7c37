//! HTTP front end.
//!
//! `POST /query` takes the query text as the request body and answers with a
//! GeoJSON feature collection. Parse errors come back as a structured JSON
//! object carrying the error code and the byte position of the offending
//! character, so clients can highlight it.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::error::{OsmGridError, Result};
use crate::{geojson, OsmIndex};

pub async fn serve(index: Arc<OsmIndex>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/query", post(run_query))
        .with_state(index);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn run_query(State(index): State<Arc<OsmIndex>>, body: String) -> Response {
    let joined = tokio::task::spawn_blocking(move || {
        index
            .query(&body)
            .map(|features| geojson::feature_collection(&features, index.tag_index()))
    })
    .await;

    match joined {
        Ok(Ok(collection)) => Json(collection).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(join_error) => {
            error!("query task failed: {}", join_error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "code": "INTERNAL_ERROR", "message": "query task failed" })),
            )
                .into_response()
        }
    }
}

fn error_response(e: OsmGridError) -> Response {
    let status = match &e {
        OsmGridError::Parse { .. } | OsmGridError::Unsupported(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "code": e.code(),
        "position": e.position(),
        "message": e.to_string(),
    });
    (status, Json(body)).into_response()
}
