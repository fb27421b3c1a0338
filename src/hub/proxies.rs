//! Proxy pool endpoints

use super::common::{proxy_json, AddProxyRequest, ApiError, ApiResult};
use super::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

/// GET /proxies - every registered adapter, best first
pub async fn get_proxies(State(state): State<AppState>) -> Json<Value> {
    let proxies: Vec<Value> = state
        .executor
        .all_proxies()
        .iter()
        .map(|a| proxy_json(a))
        .collect();
    Json(json!({ "proxies": proxies }))
}

/// GET /proxies/alive - the ranked alive view
pub async fn get_alive_proxies(State(state): State<AppState>) -> Json<Value> {
    let proxies: Vec<Value> = state
        .executor
        .alive_proxies()
        .iter()
        .map(|a| proxy_json(a))
        .collect();
    Json(json!({ "proxies": proxies }))
}

/// POST /proxies - register a share link or a structured record
pub async fn add_proxy(
    State(state): State<AppState>,
    Json(body): Json<AddProxyRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let added = match (body.link, body.config) {
        (Some(link), _) => state.executor.add_node_from_link(&link),
        (None, Some(config)) => {
            let value = serde_yaml::to_value(config)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            let mapping = value
                .as_mapping()
                .ok_or_else(|| ApiError::bad_request("config must be an object"))?;
            state.executor.add_node_from_config(mapping)
        }
        (None, None) => return Err(ApiError::bad_request("link or config required")),
    }
    .map_err(ApiError::from_error)?;

    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "added": added }))))
}

/// DELETE /proxies/dead - queue removal of adapters whose last check failed
pub async fn clean_dead(State(state): State<AppState>) -> StatusCode {
    state.executor.clean_dead_nodes();
    StatusCode::ACCEPTED
}

/// GET /proxies/:id - one adapter with its normalized config
pub async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let adapter = state
        .executor
        .find(&id)
        .ok_or_else(|| ApiError::not_found("Proxy"))?;

    let config = serde_json::to_value(adapter.to_normalized_config())
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let mut body = proxy_json(&adapter);
    body["config"] = config;
    Ok(Json(body))
}

/// DELETE /proxies/:id
pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    debug!("Remove proxy: {}", id);
    if state.executor.remove_node(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Proxy"))
    }
}

/// GET /proxies/:id/link - share link export
pub async fn get_proxy_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let adapter = state
        .executor
        .find(&id)
        .ok_or_else(|| ApiError::not_found("Proxy"))?;
    let link = adapter.to_share_link().map_err(ApiError::from_error)?;
    Ok(Json(json!({ "link": link })))
}
