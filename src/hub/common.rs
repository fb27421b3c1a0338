//! Common types for REST API responses and errors

use crate::adapter::ProxyAdapter;
use crate::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn not_found(resource: &str) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(format!("{} not found", resource))),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }

    pub fn internal(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
    }

    /// Caller mistakes become 400, everything else 500
    pub fn from_error(err: Error) -> (StatusCode, Json<ApiError>) {
        match err {
            Error::Config(_) | Error::Parse(_) | Error::Rule(_) | Error::Unsupported(_) => {
                Self::bad_request(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// POST /proxies body: one share link or one structured record
#[derive(Debug, Deserialize)]
pub struct AddProxyRequest {
    pub link: Option<String>,
    pub config: Option<Value>,
}

/// Summary of one adapter as listed by the API
pub fn proxy_json(adapter: &ProxyAdapter) -> Value {
    json!({
        "id": adapter.identity(),
        "name": adapter.name(),
        "type": adapter.proxy_type().as_str(),
        "server": adapter.host(),
        "port": adapter.port(),
        "alive": adapter.alive(),
        "delay": adapter.delay(),
        "speed": adapter.speed(),
        "speed_str": adapter.speed_str(),
    })
}
