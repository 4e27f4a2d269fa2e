use kanban_agents::AgentAdapter;
use kanban_core::{AgentProfile, AppConfig, AttemptEvent};
use kanban_store::SqliteStore;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::registry::AttemptRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct WebState {
    pub store: Arc<SqliteStore>,
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn AgentAdapter>,
    pub registry: AttemptRegistry,
    events_tx: broadcast::Sender<AttemptEvent>,
}

impl WebState {
    pub fn new(store: Arc<SqliteStore>, config: AppConfig, adapter: Arc<dyn AgentAdapter>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            config: Arc::new(config),
            adapter,
            registry: AttemptRegistry::default(),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
        self.events_tx.subscribe()
    }

    pub fn events_tx(&self) -> broadcast::Sender<AttemptEvent> {
        self.events_tx.clone()
    }

    pub fn profile(&self, profile_id: &str) -> Option<&AgentProfile> {
        self.config.profiles.get(profile_id)
    }
}
