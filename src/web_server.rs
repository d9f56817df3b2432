use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::query_processor::{QueryPlan, QueryProcessor};
use crate::structs::Row;

// Request/response bodies

#[derive(Deserialize, Debug)]
pub struct QueryRequest {
    sql: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct QueryResponse {
    rows: Vec<Row>,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    status: &'static str,
    max_parts: usize,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    error: String,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.is_upstream_error() {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Rejected request: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

pub fn router(processor: Arc<QueryProcessor>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/query", post(query_handler))
        .route("/plan", post(plan_handler))
        .with_state(processor)
}

/// Serve the API on `listen` until `shutdown` resolves.
pub async fn start_server<F>(listen: &str, processor: Arc<QueryProcessor>, shutdown: F) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| format!("Failed to bind to address {}: {}", listen, e))?;
    info!("Dispatcher API listening on {}", listen);

    axum::serve(listener, router(processor).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("Server error: {}", e))
}

async fn root_handler() -> &'static str {
    "shardq dispatcher is running"
}

async fn health_handler(State(processor): State<Arc<QueryProcessor>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        max_parts: processor.max_parts(),
    })
}

async fn metrics_handler(State(processor): State<Arc<QueryProcessor>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        processor.metrics().render_prometheus(),
    )
}

async fn query_handler(
    State(processor): State<Arc<QueryProcessor>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, Response> {
    let sql = extract_sql(payload)?;
    let rows = processor.run(&sql).await.map_err(IntoResponse::into_response)?;
    Ok(Json(QueryResponse { rows }))
}

async fn plan_handler(
    State(processor): State<Arc<QueryProcessor>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryPlan>, Response> {
    let sql = extract_sql(payload)?;
    let plan = processor.plan(&sql).await.map_err(IntoResponse::into_response)?;
    Ok(Json(plan))
}

/// Pull a non-empty `sql` string out of the body; anything else is a 400.
fn extract_sql(payload: Result<Json<QueryRequest>, JsonRejection>) -> Result<String, Response> {
    match payload {
        Ok(Json(QueryRequest { sql: Some(sql) })) if !sql.trim().is_empty() => Ok(sql),
        Ok(_) => Err(DispatchError::MissingSql.into_response()),
        Err(rejection) => {
            warn!("Rejected request body: {}", rejection.body_text());
            Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: rejection.body_text(),
                }),
            )
                .into_response())
        }
    }
}
