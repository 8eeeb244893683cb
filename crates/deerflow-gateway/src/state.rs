//! Gateway shared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use deerflow_agent::AgentFactory;
use deerflow_core::config::Config;

use crate::checkpoint::CheckpointStore;

/// Shared state handed to every handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Builds a fresh agent set per request from the process-wide prompts and tools.
    pub factory: Arc<AgentFactory>,
    pub checkpoints: CheckpointStore,
    /// Cancelled on shutdown; every request run hangs off a child token.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, factory: Arc<AgentFactory>) -> Self {
        Self {
            config,
            factory,
            checkpoints: CheckpointStore::new(),
            shutdown: CancellationToken::new(),
        }
    }
}
