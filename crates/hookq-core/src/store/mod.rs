//! Durable action storage.
//!
//! `ActionStore` is the seam between the scheduler and its backing store.
//! Every method is one atomic operation: a claim either marks its whole batch
//! `in-progress` or nothing, and `record_run` only lands while the caller's
//! claim still holds the action.

mod memory;
mod redb_store;

pub use self::memory::MemoryStore;
pub use self::redb_store::RedbStore;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{Action, CancelOutcome, NewAction, RunTransition};
use crate::claim::{due_order, Claim, ClaimRequest};
use crate::error::{HookqError, Result};
use crate::types::ActionStatus;

pub trait ActionStore: Send + Sync {
    /// Persist a new `pending` action and return it with its assigned id.
    fn enqueue(&self, new_action: NewAction, now: DateTime<Utc>) -> Result<Action>;

    fn get(&self, id: Uuid) -> Result<Action>;

    fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome>;

    fn query(&self, query: &ActionQuery) -> Result<Vec<Action>>;

    fn count_by_status(&self, filter: &ActionFilter) -> Result<StatusCounts>;

    /// Atomically select due `pending` actions and mark them `in-progress`
    /// under a fresh claim.
    fn claim(&self, request: &ClaimRequest) -> Result<Claim>;

    fn get_claim(&self, claim_id: Uuid) -> Result<Claim>;

    /// Push a live claim's expiry out to `expires_at`. Never shortens it.
    /// `ClaimNotFound` once the claim was released or reclaimed.
    fn renew_claim(&self, claim_id: Uuid, expires_at: DateTime<Utc>) -> Result<Claim>;

    /// Delete a claim. Actions it still holds go back to `pending` with the
    /// claim reference cleared, so they are immediately claimable again; they
    /// are not left `in-progress` under a claim that no longer exists.
    fn release(&self, claim_id: Uuid, now: DateTime<Utc>) -> Result<usize>;

    /// Recover actions held by claims that expired at or before `now`.
    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Record one execution outcome. Fails with `StaleClaim` when `claim_id`
    /// no longer holds the action.
    fn record_run(
        &self,
        id: Uuid,
        claim_id: Uuid,
        transition: RunTransition,
        now: DateTime<Utc>,
    ) -> Result<Action>;

    /// Delete terminal actions that finished before `cutoff`.
    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// ActionFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionFilter {
    /// Empty means any status.
    #[serde(default)]
    pub statuses: Vec<ActionStatus>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub hook: Option<String>,
    /// Inclusive lower bound on `next_due_at`.
    #[serde(default)]
    pub due_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `next_due_at`.
    #[serde(default)]
    pub due_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search: Option<String>,
}

impl ActionFilter {
    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn for_hook(mut self, hook: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self
    }

    pub fn search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(after), Some(before)) = (self.due_after, self.due_before) {
            if after > before {
                return Err(HookqError::InvalidQuery(format!(
                    "due_after {} is later than due_before {}",
                    after.to_rfc3339(),
                    before.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// Whether only status and due bounds constrain the filter, so an index
    /// scan can answer it without loading action bodies.
    pub(crate) fn is_index_only(&self) -> bool {
        self.group.is_none() && self.hook.is_none() && self.search.is_none()
    }

    pub fn matches(&self, action: &Action) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&action.status) {
            return false;
        }
        if let Some(group) = &self.group {
            if action.group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(hook) = &self.hook {
            if &action.hook != hook {
                return false;
            }
        }
        if self.due_after.is_some_and(|after| action.next_due_at < after) {
            return false;
        }
        if self.due_before.is_some_and(|before| action.next_due_at > before) {
            return false;
        }
        match &self.search {
            Some(needle) if !needle.is_empty() => action.matches_search(&needle.to_lowercase()),
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    Id,
    Hook,
    Group,
    Status,
    #[default]
    NextDue,
    CreatedAt,
    Priority,
}

impl SortColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            SortColumn::Id => "id",
            SortColumn::Hook => "hook",
            SortColumn::Group => "group",
            SortColumn::Status => "status",
            SortColumn::NextDue => "next_due",
            SortColumn::CreatedAt => "created_at",
            SortColumn::Priority => "priority",
        }
    }

    fn compare(self, a: &Action, b: &Action) -> std::cmp::Ordering {
        match self {
            SortColumn::Id => a.id.cmp(&b.id),
            SortColumn::Hook => a.hook.cmp(&b.hook),
            SortColumn::Group => a.group.cmp(&b.group),
            SortColumn::Status => a.status.cmp(&b.status),
            SortColumn::NextDue => a.next_due_at.cmp(&b.next_due_at),
            SortColumn::CreatedAt => a.created_at.cmp(&b.created_at),
            SortColumn::Priority => a.priority.cmp(&b.priority),
        }
    }
}

impl fmt::Display for SortColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SortColumn {
    type Err = HookqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "id" => Ok(SortColumn::Id),
            "hook" => Ok(SortColumn::Hook),
            "group" => Ok(SortColumn::Group),
            "status" => Ok(SortColumn::Status),
            "next_due" | "next-due" | "due" => Ok(SortColumn::NextDue),
            "created_at" | "created-at" | "created" => Ok(SortColumn::CreatedAt),
            "priority" => Ok(SortColumn::Priority),
            _ => Err(HookqError::InvalidQuery(format!("unknown sort column '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = HookqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(HookqError::InvalidQuery(format!("unknown sort order '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionQuery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionQuery {
    #[serde(default)]
    pub filter: ActionFilter,
    #[serde(default)]
    pub sort: SortColumn,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ActionQuery {
    pub fn new(filter: ActionFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: SortColumn, order: SortOrder) -> Self {
        self.sort = sort;
        self.order = order;
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.filter.validate()
    }

    /// Filter, sort and paginate a candidate set. Ties break on id so the
    /// order is total and pagination is stable.
    pub(crate) fn apply(&self, candidates: impl IntoIterator<Item = Action>) -> Vec<Action> {
        let mut rows: Vec<Action> = candidates
            .into_iter()
            .filter(|a| self.filter.matches(a))
            .collect();
        rows.sort_by(|a, b| {
            let ord = self.sort.compare(a, b).then_with(|| a.id.cmp(&b.id));
            match self.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        let rows = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusCounts
// ---------------------------------------------------------------------------

/// Per-status totals. Every status is present, zero when empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCounts(BTreeMap<ActionStatus, u64>);

impl StatusCounts {
    pub fn new() -> Self {
        Self(ActionStatus::all().iter().map(|s| (*s, 0)).collect())
    }

    pub fn get(&self, status: ActionStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionStatus, u64)> + '_ {
        self.0.iter().map(|(s, n)| (*s, *n))
    }

    pub(crate) fn add(&mut self, status: ActionStatus) {
        *self.0.entry(status).or_insert(0) += 1;
    }
}

impl Default for StatusCounts {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Pick up to `request.batch_size` due actions in claim order.
pub(crate) fn select_due<'a>(
    actions: impl IntoIterator<Item = &'a Action>,
    request: &ClaimRequest,
) -> Vec<Uuid> {
    let mut due: Vec<&Action> = actions
        .into_iter()
        .filter(|a| a.is_due(request.now) && !request.exclude.contains(&a.id))
        .collect();
    due.sort_by(|a, b| due_order(a, b));
    due.into_iter().take(request.batch_size).map(|a| a.id).collect()
}

/// Whether `action` is still held by `claim_id`; `StaleClaim` otherwise.
pub(crate) fn check_held(action: &Action, claim_id: Uuid) -> Result<()> {
    if action.status == ActionStatus::InProgress && action.claim_id == Some(claim_id) {
        Ok(())
    } else {
        Err(HookqError::StaleClaim {
            action: action.id,
            claim: claim_id,
        })
    }
}

/// When a terminal action finished, for retention purposes.
pub(crate) fn finished_at(action: &Action) -> DateTime<Utc> {
    action.completed_at.unwrap_or(action.updated_at)
}
