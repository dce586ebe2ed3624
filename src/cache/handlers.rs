//! REST surface of a cache node.

use super::manager::CacheManager;
use super::stats::StatsSnapshot;
use crate::container::Metadata;
use crate::error::CacheError;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub value: Value,
    #[serde(default)]
    pub lifespan_ms: Option<i64>,
    #[serde(default)]
    pub max_idle_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub cache: String,
    pub key: String,
    pub value: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub(crate) fn status_of(error: &CacheError) -> StatusCode {
    match error {
        CacheError::CacheNotFound(_) => StatusCode::NOT_FOUND,
        CacheError::LockTimeout { .. }
        | CacheError::WriteSkew { .. }
        | CacheError::OutdatedTopology { .. }
        | CacheError::RolledBack { .. } => StatusCode::CONFLICT,
        CacheError::RemoteCommunication { .. } => StatusCode::BAD_GATEWAY,
        CacheError::NotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
        CacheError::Configuration(_)
        | CacheError::IllegalTransactionState(_)
        | CacheError::Serialization(_) => StatusCode::BAD_REQUEST,
        CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: CacheError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_of(&error);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    } else {
        tracing::debug!("Request rejected: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub async fn handle_get(
    Path((cache, key)): Path<(String, String)>,
    Extension(manager): Extension<CacheManager>,
) -> Reply<EntryResponse> {
    let handle = manager.cache::<String, Value>(&cache).map_err(failure)?;
    let value = handle.get(&key).await.map_err(failure)?;
    if value.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("key '{}' not found in cache '{}'", key, cache),
            }),
        ));
    }
    Ok(Json(EntryResponse { cache, key, value }))
}

/// Stores the value and returns the previous one.
pub async fn handle_put(
    Path((cache, key)): Path<(String, String)>,
    Extension(manager): Extension<CacheManager>,
    Json(request): Json<PutRequest>,
) -> Reply<EntryResponse> {
    let handle = manager.cache::<String, Value>(&cache).map_err(failure)?;

    let metadata = Metadata {
        lifespan_ms: request.lifespan_ms.unwrap_or(-1),
        max_idle_ms: request.max_idle_ms.unwrap_or(-1),
    };

    let previous = handle
        .put_with_metadata(&key, &request.value, metadata)
        .await
        .map_err(failure)?;
    Ok(Json(EntryResponse {
        cache,
        key,
        value: previous,
    }))
}

pub async fn handle_delete(
    Path((cache, key)): Path<(String, String)>,
    Extension(manager): Extension<CacheManager>,
) -> Reply<EntryResponse> {
    let handle = manager.cache::<String, Value>(&cache).map_err(failure)?;
    let previous = handle.remove(&key).await.map_err(failure)?;
    Ok(Json(EntryResponse {
        cache,
        key,
        value: previous,
    }))
}

pub async fn handle_stats(
    Path(cache): Path<String>,
    Extension(manager): Extension<CacheManager>,
) -> Reply<StatsSnapshot> {
    let handle = manager.cache::<String, Value>(&cache).map_err(failure)?;
    Ok(Json(handle.stats()))
}

pub async fn handle_list_caches(Extension(manager): Extension<CacheManager>) -> Json<Vec<String>> {
    Json(manager.cache_names())
}
