//! Shared API state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use weft_core::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Pinged after writes that should shorten scheduler latency.
    pub wake: Arc<Notify>,
    /// Shared secret worker agents present at registration.
    pub worker_key: Option<String>,
    pub lease_ttl: Duration,
    /// Upper bound on lease long-polling.
    pub poll_window: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, wake: Arc<Notify>) -> Self {
        Self {
            store,
            wake,
            worker_key: None,
            lease_ttl: Duration::from_secs(90),
            poll_window: Duration::from_secs(25),
        }
    }

    pub fn with_worker_key(mut self, key: Option<String>) -> Self {
        self.worker_key = key;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_window(mut self, window: Duration) -> Self {
        self.poll_window = window;
        self
    }
}
