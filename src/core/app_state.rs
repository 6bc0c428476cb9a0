use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::config::ColloquyConfig;
use crate::registry::TaskRegistry;
use crate::relay::Event;

/// Shared application state threaded through every component.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ColloquyConfig>,
    /// Single source of truth for task status and accumulated rows.
    pub registry: Arc<TaskRegistry>,
    /// Fire-and-forget event fan-out; zero subscribers is fine.
    pub events: broadcast::Sender<Event>,
    // Serialize batch runs — one automation run per page context.
    pub run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("event_subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl AppState {
    pub fn new(config: ColloquyConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(TaskRegistry::new(
            Some(config.storage.resolve_data_dir()),
            events.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            events,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// In-memory state for tests — no on-disk task spill.
    pub fn ephemeral(config: ColloquyConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(TaskRegistry::new(None, events.clone()));
        Self {
            config: Arc::new(config),
            registry,
            events,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
