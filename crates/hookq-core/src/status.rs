//! Read-only reporting over the action store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{ActionFilter, ActionQuery, ActionStore, SortColumn, SortOrder, StatusCounts};
use crate::types::ActionStatus;

#[derive(Debug, Clone, Serialize)]
pub struct NextDue {
    pub action_id: Uuid,
    pub hook: String,
    pub due_at: DateTime<Utc>,
}

/// Dashboard snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub counts: StatusCounts,
    /// Pending actions already past their due time.
    pub overdue: u64,
    pub next_due: Option<NextDue>,
    /// Start time of the longest-running in-progress action.
    pub oldest_in_progress: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

pub struct StatusService {
    store: Arc<dyn ActionStore>,
    clock: Arc<dyn Clock>,
}

impl StatusService {
    pub fn new(store: Arc<dyn ActionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Per-status totals, optionally for one group. Every status is present.
    pub fn counts(&self, group: Option<&str>) -> Result<StatusCounts> {
        let filter = ActionFilter {
            group: group.map(str::to_string),
            ..ActionFilter::default()
        };
        self.store.count_by_status(&filter)
    }

    pub fn summary(&self) -> Result<StatusSummary> {
        let now = self.clock.now();
        let counts = self.store.count_by_status(&ActionFilter::default())?;

        let overdue_filter = ActionFilter {
            due_before: Some(now),
            ..ActionFilter::default().with_status(ActionStatus::Pending)
        };
        let overdue = self
            .store
            .count_by_status(&overdue_filter)?
            .get(ActionStatus::Pending);

        let next_due = self
            .store
            .query(
                &ActionQuery::new(ActionFilter::default().with_status(ActionStatus::Pending))
                    .sorted_by(SortColumn::NextDue, SortOrder::Asc)
                    .page(1, 0),
            )?
            .into_iter()
            .next()
            .map(|a| NextDue {
                action_id: a.id,
                hook: a.hook,
                due_at: a.next_due_at,
            });

        let oldest_in_progress = self
            .store
            .query(&ActionQuery::new(
                ActionFilter::default().with_status(ActionStatus::InProgress),
            ))?
            .iter()
            .filter_map(|a| a.started_at)
            .min();

        Ok(StatusSummary {
            counts,
            overdue,
            next_due,
            oldest_in_progress,
            generated_at: now,
        })
    }
}
