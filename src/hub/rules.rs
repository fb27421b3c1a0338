//! Routing rule endpoints

use super::common::{ApiError, ApiResult};
use super::AppState;
use crate::rule::{Rule, RuleInfo};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

/// GET /rules - every rule, ordered by payload
pub async fn get_rules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "rules": state.rules.rules() }))
}

/// POST /rules - add one rule; an existing rule with the same key wins
pub async fn add_rule(
    State(state): State<AppState>,
    Json(info): Json<RuleInfo>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let rule = Rule::from_info(&info).map_err(ApiError::from_error)?;
    let added = state.rules.add_rule(rule);
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "added": added }))))
}

/// DELETE /rules/:key
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .rules
        .remove(&key)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError::not_found("Rule"))
}

/// PUT /rules/sync - hand the rule list to the config store
pub async fn sync_rules(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.rules.sync().map_err(ApiError::from_error)?;
    Ok(StatusCode::NO_CONTENT)
}
