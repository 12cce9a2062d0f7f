use crate::state::AppState;
use autorem_common::types::Status;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use std::collections::HashMap;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

pub fn routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_rules))
        .routes(routes!(get_remediations))
        .routes(routes!(get_commands))
        .routes(routes!(set_state))
}

/// Currently loaded remediation rules.
#[utoipa::path(
    get,
    path = "/api/rules",
    tag = "Rules",
    responses(
        (status = 200, description = "Loaded rules as configured")
    )
)]
async fn get_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.rules.clone())
}

/// Stored remediation rows, filtered by AND-equality on query params.
/// The `status` filter accepts the status name and is mapped to its
/// integer code before the query.
#[utoipa::path(
    get,
    path = "/api/remediations",
    tag = "Records",
    responses(
        (status = 200, description = "Matching remediation rows"),
        (status = 500, description = "Query failed")
    )
)]
async fn get_remediations(
    State(state): State<AppState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(raw) = params.get("status") {
        if let Ok(status) = raw.parse::<Status>() {
            params.insert("status".to_string(), (status as i16).to_string());
        }
    }
    query_table(&state, "remediations", &params).await
}

/// Stored command rows, filtered by AND-equality on query params.
#[utoipa::path(
    get,
    path = "/api/commands",
    tag = "Records",
    responses(
        (status = 200, description = "Matching command rows"),
        (status = 500, description = "Query failed")
    )
)]
async fn get_commands(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    query_table(&state, "commands", &params).await
}

async fn query_table(
    state: &AppState,
    table: &str,
    params: &HashMap<String, String>,
) -> Response {
    match state.store.query(table, params).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            tracing::error!(table, error = %e, "failed to query items");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to query items: {e}"),
            )
                .into_response()
        }
    }
}

/// Toggles the pipeline admission gate. Requires HTTP Basic auth against
/// the configured admin credentials.
#[utoipa::path(
    post,
    path = "/admin/{state}",
    tag = "Admin",
    params(
        ("state" = String, Path, description = "Either 'enable' or 'disable'")
    ),
    responses(
        (status = 200, description = "State changed"),
        (status = 400, description = "Missing credentials or invalid state"),
        (status = 401, description = "Authentication failed")
    )
)]
async fn set_state(
    State(app): State<AppState>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some((user, pass)) = basic_auth(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing username/password").into_response();
    };
    let (admin_user, admin_pass) = app.config.admin_creds();
    if user != admin_user || pass != admin_pass {
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }
    match target.as_str() {
        "enable" => app.remediator.enable(),
        "disable" => app.remediator.disable(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                "invalid request, choose either 'enable' or 'disable'",
            )
                .into_response()
        }
    }
    (StatusCode::OK, format!("system is now {target}d\n")).into_response()
}

fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
