use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chat::MessageLog;
use crate::ws::SessionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connections and their joined names
    pub sessions: SessionRegistry,
    /// Append-only chat history
    pub log: Arc<MessageLog>,
    /// Orders joins against message deliveries. Message frames hold it shared
    /// across append + broadcast; joins hold it exclusively across
    /// set_name + history replay.
    pub delivery_gate: Arc<RwLock<()>>,
}

impl AppState {
    pub fn new(log: MessageLog) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            log: Arc::new(log),
            delivery_gate: Arc::new(RwLock::new(())),
        }
    }
}
