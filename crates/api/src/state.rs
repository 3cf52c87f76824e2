use std::sync::Arc;

use tumbler_pipeline::Tracker;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Registry, store, event bus and coordinator.
    pub tracker: Arc<Tracker>,
}
