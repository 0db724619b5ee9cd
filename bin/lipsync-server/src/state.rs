//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use lipsync_core::Dispatcher;
use lipsync_core::storage::SqliteStore;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Owns the work queue, the execution gate and the job/task store.
    pub dispatcher: Dispatcher<SqliteStore>,
}

impl AppState {
    pub fn store(&self) -> &SqliteStore {
        self.dispatcher.store()
    }
}
