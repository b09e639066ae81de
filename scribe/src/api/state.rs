use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::processing::ExtractionOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<ExtractionOrchestrator>,
    /// Cancelled on shutdown; each request runs under a child token.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: ExtractionOrchestrator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            shutdown,
            started_at: Instant::now(),
        }
    }
}
