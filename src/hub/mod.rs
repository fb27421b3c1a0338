//! REST API server (hub)
//!
//! A small control surface over the proxy pool and the rule table.

mod auth;
mod common;
mod proxies;
mod rules;

pub use auth::auth_middleware;
pub use common::{ApiError, ApiResult};

use crate::executor::Executor;
use crate::rule::RuleTable;
use crate::{Result, VERSION};

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// API secret; empty disables authentication
    pub secret: String,
    pub executor: Arc<Executor>,
    pub rules: Arc<RuleTable>,
}

impl AppState {
    pub fn new(secret: String, executor: Arc<Executor>) -> Self {
        let rules = Arc::clone(executor.rules());
        AppState {
            secret,
            executor,
            rules,
        }
    }
}

/// Create the router with every endpoint
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/proxies", get(proxies::get_proxies))
        .route("/proxies", post(proxies::add_proxy))
        .route("/proxies/alive", get(proxies::get_alive_proxies))
        .route("/proxies/dead", delete(proxies::clean_dead))
        .route("/proxies/:id", get(proxies::get_proxy))
        .route("/proxies/:id", delete(proxies::delete_proxy))
        .route("/proxies/:id/link", get(proxies::get_proxy_link))
        .route("/rules", get(rules::get_rules))
        .route("/rules", post(rules::add_rule))
        .route("/rules/sync", put(rules::sync_rules))
        .route("/rules/:key", delete(rules::delete_rule))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the REST API until shutdown
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let router = create_router(state);
    info!("Starting REST API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "nico" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}
