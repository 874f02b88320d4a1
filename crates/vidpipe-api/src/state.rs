//! Application state.

use std::sync::Arc;

use vidpipe_queue::{JobBroker, JobDispatcher};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub dispatcher: JobDispatcher,
}

impl AppState {
    pub fn new(config: ApiConfig, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: JobDispatcher::new(broker),
        }
    }
}
