use hookq_core::{ActionStore, Clock, StatusService};
use std::sync::Arc;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ActionStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(store: Arc<dyn ActionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn status(&self) -> StatusService {
        StatusService::new(Arc::clone(&self.store), Arc::clone(&self.clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hookq_core::{ManualClock, MemoryStore};

    #[test]
    fn status_uses_shared_clock() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let state = AppState::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(at)));
        assert_eq!(state.clock.now(), at);
        assert_eq!(state.status().summary().unwrap().generated_at, at);
    }
}
