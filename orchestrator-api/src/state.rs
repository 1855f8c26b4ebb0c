//! Shared state for HTTP handlers.

use orchestrator::service::TaskService;

/// Per-request identifier injected by middleware and echoed in error bodies.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[derive(Clone)]
pub struct AppState {
    pub service: TaskService,
}

impl AppState {
    pub fn new(service: TaskService) -> Self {
        Self { service }
    }
}
