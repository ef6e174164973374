use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{check_held, finished_at, select_due, ActionFilter, ActionQuery, ActionStore, StatusCounts};
use crate::action::{Action, CancelOutcome, NewAction, RunTransition};
use crate::claim::{Claim, ClaimRequest};
use crate::error::{HookqError, Result};
use crate::types::ActionStatus;

#[derive(Default)]
struct Inner {
    actions: HashMap<Uuid, Action>,
    claims: HashMap<Uuid, Claim>,
}

/// Non-durable store behind a single mutex. Same semantics as
/// [`RedbStore`](super::RedbStore); for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| HookqError::Storage("memory store lock poisoned".into()))
    }
}

impl ActionStore for MemoryStore {
    fn enqueue(&self, new_action: NewAction, now: DateTime<Utc>) -> Result<Action> {
        let mut inner = self.lock()?;
        if new_action.unique {
            if let Some(existing) = inner.actions.values().find(|a| new_action.duplicates(a)) {
                return Ok(existing.clone());
            }
        }
        let action = new_action.into_action(Uuid::new_v4(), now)?;
        inner.actions.insert(action.id, action.clone());
        Ok(action)
    }

    fn get(&self, id: Uuid) -> Result<Action> {
        self.lock()?
            .actions
            .get(&id)
            .cloned()
            .ok_or(HookqError::ActionNotFound(id))
    }

    fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut inner = self.lock()?;
        let action = inner
            .actions
            .get_mut(&id)
            .ok_or(HookqError::ActionNotFound(id))?;
        Ok(action.request_cancel(now))
    }

    fn query(&self, query: &ActionQuery) -> Result<Vec<Action>> {
        query.validate()?;
        let inner = self.lock()?;
        Ok(query.apply(inner.actions.values().cloned()))
    }

    fn count_by_status(&self, filter: &ActionFilter) -> Result<StatusCounts> {
        filter.validate()?;
        let inner = self.lock()?;
        let mut counts = StatusCounts::new();
        for action in inner.actions.values().filter(|a| filter.matches(a)) {
            counts.add(action.status);
        }
        Ok(counts)
    }

    fn claim(&self, request: &ClaimRequest) -> Result<Claim> {
        let mut inner = self.lock()?;
        let ids = select_due(inner.actions.values(), request);
        let claim = request.to_claim(ids)?;
        for id in &claim.action_ids {
            if let Some(action) = inner.actions.get_mut(id) {
                action.mark_claimed(claim.id, request.now);
            }
        }
        if !claim.is_empty() {
            inner.claims.insert(claim.id, claim.clone());
        }
        Ok(claim)
    }

    fn get_claim(&self, claim_id: Uuid) -> Result<Claim> {
        self.lock()?
            .claims
            .get(&claim_id)
            .cloned()
            .ok_or(HookqError::ClaimNotFound(claim_id))
    }

    fn renew_claim(&self, claim_id: Uuid, expires_at: DateTime<Utc>) -> Result<Claim> {
        let mut inner = self.lock()?;
        let claim = inner
            .claims
            .get_mut(&claim_id)
            .ok_or(HookqError::ClaimNotFound(claim_id))?;
        claim.expires_at = claim.expires_at.max(expires_at);
        Ok(claim.clone())
    }

    fn release(&self, claim_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let claim = inner
            .claims
            .remove(&claim_id)
            .ok_or(HookqError::ClaimNotFound(claim_id))?;
        let mut released = 0;
        for id in &claim.action_ids {
            if let Some(action) = inner.actions.get_mut(id) {
                if check_held(action, claim_id).is_ok() {
                    action.mark_released(now);
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let expired: Vec<Uuid> = inner
            .claims
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id)
            .collect();
        let mut reclaimed = 0;
        for claim_id in expired {
            let Some(claim) = inner.claims.remove(&claim_id) else {
                continue;
            };
            for id in &claim.action_ids {
                if let Some(action) = inner.actions.get_mut(id) {
                    if check_held(action, claim_id).is_ok() {
                        action.mark_abandoned(claim_id, now);
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    fn record_run(
        &self,
        id: Uuid,
        claim_id: Uuid,
        transition: RunTransition,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        let mut inner = self.lock()?;
        let action = inner
            .actions
            .get_mut(&id)
            .ok_or(HookqError::ActionNotFound(id))?;
        check_held(action, claim_id)?;
        action.apply_run(transition, now);
        Ok(action.clone())
    }

    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.actions.len();
        inner
            .actions
            .retain(|_, a| !(a.status.is_terminal() && finished_at(a) < cutoff));
        Ok(before - inner.actions.len())
    }
}
