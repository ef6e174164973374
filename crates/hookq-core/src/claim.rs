//! Claims and the claim manager.
//!
//! A claim is a lease: one worker's exclusive right to execute a set of
//! actions until `expires_at`. Selecting due actions and marking them
//! `in-progress` happens in a single store operation, so two workers racing
//! on the same due set never both receive the same action.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;
use crate::error::{HookqError, Result};
use crate::store::ActionStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    /// Opaque worker identifier.
    pub holder: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Reserved actions in execution order.
    pub action_ids: Vec<Uuid>,
}

impl Claim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_empty(&self) -> bool {
        self.action_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.action_ids.len()
    }
}

/// Parameters for one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub holder: String,
    pub batch_size: usize,
    pub lease: Duration,
    pub now: DateTime<Utc>,
    /// Actions this worker is still executing from an earlier claim; they are
    /// never handed out again to the same worker.
    pub exclude: HashSet<Uuid>,
}

impl ClaimRequest {
    pub fn new(holder: impl Into<String>, batch_size: usize, lease: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            batch_size,
            lease,
            now,
            exclude: HashSet::new(),
        }
    }

    pub fn excluding(mut self, exclude: HashSet<Uuid>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|_| HookqError::InvalidQuery(format!("lease {:?} is too long", self.lease)))?;
        self.now
            .checked_add_signed(lease)
            .ok_or_else(|| HookqError::InvalidQuery(format!("lease {:?} is too long", self.lease)))
    }

    /// Build the claim record for the selected action ids.
    pub(crate) fn to_claim(&self, action_ids: Vec<Uuid>) -> Result<Claim> {
        Ok(Claim {
            id: Uuid::new_v4(),
            holder: self.holder.clone(),
            created_at: self.now,
            expires_at: self.expires_at()?,
            action_ids,
        })
    }
}

/// Claim order: earliest due first, then higher priority, then id.
pub(crate) fn due_order(a: &Action, b: &Action) -> std::cmp::Ordering {
    a.next_due_at
        .cmp(&b.next_due_at)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.id.cmp(&b.id))
}

// ---------------------------------------------------------------------------
// ClaimManager
// ---------------------------------------------------------------------------

/// Reserves, releases and recovers claims on behalf of one worker.
pub struct ClaimManager {
    store: Arc<dyn ActionStore>,
    holder: String,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn ActionStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Reserve up to `batch_size` due actions. Returns a partial or empty
    /// claim when fewer are due; an empty claim is not persisted.
    pub fn claim(&self, batch_size: usize, lease: Duration, now: DateTime<Utc>) -> Result<Claim> {
        self.claim_excluding(batch_size, lease, now, HashSet::new())
    }

    pub fn claim_excluding(
        &self,
        batch_size: usize,
        lease: Duration,
        now: DateTime<Utc>,
        exclude: HashSet<Uuid>,
    ) -> Result<Claim> {
        let request = ClaimRequest::new(self.holder.clone(), batch_size, lease, now).excluding(exclude);
        let claim = self.store.claim(&request)?;
        if claim.is_empty() {
            tracing::debug!(holder = %self.holder, "no due actions");
        } else {
            tracing::info!(
                holder = %self.holder,
                claim_id = %claim.id,
                claimed = claim.len(),
                expires_at = %claim.expires_at,
                "claimed actions"
            );
        }
        Ok(claim)
    }

    /// Drop a claim; actions it still holds go back to `pending`.
    pub fn release(&self, claim_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let released = self.store.release(claim_id, now)?;
        if released > 0 {
            tracing::info!(holder = %self.holder, %claim_id, released, "released unexecuted actions");
        } else {
            tracing::debug!(holder = %self.holder, %claim_id, "claim released");
        }
        Ok(released)
    }

    /// Reset actions held by expired claims to `pending`.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let reclaimed = self.store.reclaim_expired(now)?;
        if reclaimed > 0 {
            tracing::warn!(holder = %self.holder, reclaimed, "recovered actions from expired claims");
        }
        Ok(reclaimed)
    }
}
