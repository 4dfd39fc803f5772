//! Application state shared across request handlers.

use crate::presence::PresenceTracker;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<PresenceTracker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(tracker: Arc<PresenceTracker>) -> Self {
        Self {
            tracker,
            started_at: Instant::now(),
        }
    }
}
