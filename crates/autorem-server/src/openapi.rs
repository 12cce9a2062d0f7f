use axum::routing::get;
use axum::{Json, Router};

/// Serves the generated OpenAPI document.
pub fn spec_route(spec: utoipa::openapi::OpenApi) -> Router {
    Router::new().route(
        "/v1/openapi.json",
        get(move || {
            let spec = spec.clone();
            async move { Json(spec) }
        }),
    )
}
