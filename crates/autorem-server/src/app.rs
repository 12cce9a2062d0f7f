use crate::state::AppState;
use crate::{api, logging, openapi};
use axum::middleware;
use axum::Router;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "autorem API",
        description = "Auto-remediation admin and query surface",
    ),
    tags(
        (name = "Rules", description = "Loaded rule catalog"),
        (name = "Records", description = "Stored remediation and command rows"),
        (name = "Admin", description = "Pipeline admission control")
    )
)]
struct ApiDoc;

pub fn build_http_app(state: AppState) -> Router {
    let (router, api_spec) = api::routes().split_for_parts();
    let mut spec = ApiDoc::openapi();
    spec.merge(api_spec);

    router
        .with_state(state)
        .merge(openapi::spec_route(spec))
        .layer(middleware::from_fn(logging::request_logging))
}
