use crate::config::ConfigHandler;
use crate::pipeline::Remediator;
use autorem_storage::Store;
use std::sync::Arc;

/// Shared state for the admin HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub remediator: Arc<Remediator>,
    pub store: Arc<dyn Store>,
    pub config: Arc<ConfigHandler>,
}
