//! Durable action store on redb.
//!
//! # Table design
//!
//! ```text
//! actions       uuid (16)                                         -> JSON Action
//! due_index     [ status u8 | due_ms u64 BE | !priority u32 BE | uuid ] -> ()
//! group_index   group name                                        =>> uuid  (multimap)
//! claims        uuid (16)                                         -> JSON Claim
//! claim_expiry  [ expires_ms u64 BE | uuid ]                      -> ()
//! ```
//!
//! Big-endian timestamps make byte order equal time order, so the claimable
//! set is one range scan over the `pending` prefix of `due_index` up to
//! `now`, already in claim order (due, then priority descending, then id).
//! The priority bytes are inverted so higher priorities sort first.
//!
//! Every mutation runs in a single write transaction. redb admits one writer
//! at a time, which is what makes a claim atomic across workers sharing the
//! store.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTable, MultimapTableDefinition, ReadOnlyMultimapTable, ReadOnlyTable,
    ReadableMultimapTable, ReadableTable, Table, TableDefinition, WriteTransaction,
};
use uuid::Uuid;

use super::{check_held, finished_at, ActionFilter, ActionQuery, ActionStore, StatusCounts};
use crate::action::{Action, CancelOutcome, NewAction, RunTransition};
use crate::claim::{Claim, ClaimRequest};
use crate::error::{storage, HookqError, Result};
use crate::types::ActionStatus;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("actions");
const DUE_INDEX: TableDefinition<&[u8], ()> = TableDefinition::new("due_index");
const GROUP_INDEX: MultimapTableDefinition<&str, &[u8]> = MultimapTableDefinition::new("group_index");
const CLAIMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("claims");
const CLAIM_EXPIRY: TableDefinition<&[u8], ()> = TableDefinition::new("claim_expiry");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

const DUE_KEY_LEN: usize = 29;
const DUE_ID_OFFSET: usize = 13;
const EXPIRY_KEY_LEN: usize = 24;

fn millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

/// Order-preserving map of `i32` onto `u32`, inverted so larger priorities
/// produce smaller keys.
fn priority_bytes(priority: i32) -> [u8; 4] {
    let shifted = (priority as i64 - i32::MIN as i64) as u32;
    (u32::MAX - shifted).to_be_bytes()
}

fn due_key(action: &Action) -> [u8; DUE_KEY_LEN] {
    let mut key = [0u8; DUE_KEY_LEN];
    key[0] = action.status.tag();
    key[1..9].copy_from_slice(&millis(action.next_due_at).to_be_bytes());
    key[9..13].copy_from_slice(&priority_bytes(action.priority));
    key[DUE_ID_OFFSET..].copy_from_slice(action.id.as_bytes());
    key
}

/// Range bound within one status prefix. `fill` 0x00 gives a lower bound
/// for `ms`, 0xff an upper bound that includes every key at `ms`.
fn due_bound(status: ActionStatus, ms: u64, fill: u8) -> [u8; DUE_KEY_LEN] {
    let mut key = [fill; DUE_KEY_LEN];
    key[0] = status.tag();
    key[1..9].copy_from_slice(&ms.to_be_bytes());
    key
}

fn id_from_due_key(key: &[u8]) -> Result<Uuid> {
    let bytes = key
        .get(DUE_ID_OFFSET..DUE_KEY_LEN)
        .ok_or_else(|| HookqError::Storage("malformed due index key".into()))?;
    Uuid::from_slice(bytes).map_err(storage)
}

fn status_from_tag(tag: u8) -> Option<ActionStatus> {
    ActionStatus::all().iter().copied().find(|s| s.tag() == tag)
}

fn expiry_key(claim: &Claim) -> [u8; EXPIRY_KEY_LEN] {
    let mut key = [0u8; EXPIRY_KEY_LEN];
    key[..8].copy_from_slice(&millis(claim.expires_at).to_be_bytes());
    key[8..].copy_from_slice(claim.id.as_bytes());
    key
}

/// Upper bound covering every claim expiring at or before `now`.
fn expired_upper_bound(now: DateTime<Utc>) -> [u8; EXPIRY_KEY_LEN] {
    let mut key = [0xffu8; EXPIRY_KEY_LEN];
    key[..8].copy_from_slice(&millis(now).to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// Table access
// ---------------------------------------------------------------------------

struct WriteTables<'txn> {
    actions: Table<'txn, &'static [u8], &'static [u8]>,
    due: Table<'txn, &'static [u8], ()>,
    groups: MultimapTable<'txn, &'static str, &'static [u8]>,
    claims: Table<'txn, &'static [u8], &'static [u8]>,
    expiry: Table<'txn, &'static [u8], ()>,
}

impl<'txn> WriteTables<'txn> {
    fn open(wt: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            actions: wt.open_table(ACTIONS).map_err(storage)?,
            due: wt.open_table(DUE_INDEX).map_err(storage)?,
            groups: wt.open_multimap_table(GROUP_INDEX).map_err(storage)?,
            claims: wt.open_table(CLAIMS).map_err(storage)?,
            expiry: wt.open_table(CLAIM_EXPIRY).map_err(storage)?,
        })
    }

    /// Write `new`, moving its due index entry from where `old` left it.
    fn put_action(&mut self, old: Option<&Action>, new: &Action) -> Result<()> {
        match old {
            Some(old) => {
                self.due.remove(due_key(old).as_slice()).map_err(storage)?;
            }
            None => {
                if let Some(group) = &new.group {
                    self.groups
                        .insert(group.as_str(), new.id.as_bytes().as_slice())
                        .map_err(storage)?;
                }
            }
        }
        self.due.insert(due_key(new).as_slice(), ()).map_err(storage)?;
        let value = serde_json::to_vec(new)?;
        self.actions
            .insert(new.id.as_bytes().as_slice(), value.as_slice())
            .map_err(storage)?;
        Ok(())
    }

    fn delete_action(&mut self, action: &Action) -> Result<()> {
        self.due.remove(due_key(action).as_slice()).map_err(storage)?;
        if let Some(group) = &action.group {
            self.groups
                .remove(group.as_str(), action.id.as_bytes().as_slice())
                .map_err(storage)?;
        }
        self.actions
            .remove(action.id.as_bytes().as_slice())
            .map_err(storage)?;
        Ok(())
    }

    fn put_claim(&mut self, claim: &Claim) -> Result<()> {
        let value = serde_json::to_vec(claim)?;
        self.claims
            .insert(claim.id.as_bytes().as_slice(), value.as_slice())
            .map_err(storage)?;
        self.expiry
            .insert(expiry_key(claim).as_slice(), ())
            .map_err(storage)?;
        Ok(())
    }

    fn delete_claim(&mut self, claim: &Claim) -> Result<()> {
        self.claims
            .remove(claim.id.as_bytes().as_slice())
            .map_err(storage)?;
        self.expiry
            .remove(expiry_key(claim).as_slice())
            .map_err(storage)?;
        Ok(())
    }

    fn require_action(&self, id: Uuid) -> Result<Action> {
        load_action(&self.actions, id)?.ok_or(HookqError::ActionNotFound(id))
    }
}

struct ReadTables {
    actions: ReadOnlyTable<&'static [u8], &'static [u8]>,
    due: ReadOnlyTable<&'static [u8], ()>,
    groups: ReadOnlyMultimapTable<&'static str, &'static [u8]>,
}

fn load_action(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    id: Uuid,
) -> Result<Option<Action>> {
    match table.get(id.as_bytes().as_slice()).map_err(storage)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn load_claim(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    id: Uuid,
) -> Result<Option<Claim>> {
    match table.get(id.as_bytes().as_slice()).map_err(storage)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn load_all(table: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for entry in table.iter().map_err(storage)? {
        let (_, value) = entry.map_err(storage)?;
        actions.push(serde_json::from_slice(value.value())?);
    }
    Ok(actions)
}

/// Ids under one status prefix whose due millisecond lies in the bounds.
fn scan_status(
    due: &impl ReadableTable<&'static [u8], ()>,
    status: ActionStatus,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<Uuid>> {
    let lower = due_bound(status, after.map(millis).unwrap_or(0), 0x00);
    let upper = due_bound(status, before.map(millis).unwrap_or(u64::MAX), 0xff);
    let mut ids = Vec::new();
    for entry in due.range(lower.as_slice()..=upper.as_slice()).map_err(storage)? {
        let (key, _) = entry.map_err(storage)?;
        ids.push(id_from_due_key(key.value())?);
    }
    Ok(ids)
}

fn group_members(
    groups: &impl ReadableMultimapTable<&'static str, &'static [u8]>,
    group: &str,
) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    for value in groups.get(group).map_err(storage)? {
        let value = value.map_err(storage)?;
        ids.push(Uuid::from_slice(value.value()).map_err(storage)?);
    }
    Ok(ids)
}

fn load_many(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    ids: impl IntoIterator<Item = Uuid>,
) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for id in ids {
        if let Some(action) = load_action(table, id)? {
            actions.push(action);
        }
    }
    Ok(actions)
}

/// Narrow the candidate set with the most selective index the filter allows.
/// Callers still apply the full filter.
fn candidates(
    actions: &impl ReadableTable<&'static [u8], &'static [u8]>,
    due: &impl ReadableTable<&'static [u8], ()>,
    groups: &impl ReadableMultimapTable<&'static str, &'static [u8]>,
    filter: &ActionFilter,
) -> Result<Vec<Action>> {
    if let Some(group) = &filter.group {
        return load_many(actions, group_members(groups, group)?);
    }
    if filter.statuses.is_empty() {
        return load_all(actions);
    }
    let statuses: BTreeSet<ActionStatus> = filter.statuses.iter().copied().collect();
    let mut ids = Vec::new();
    for status in statuses {
        ids.extend(scan_status(due, status, filter.due_after, filter.due_before)?);
    }
    load_many(actions, ids)
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating parent directories
    /// and every table so read transactions never miss one.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(storage)?;
        let wt = db.begin_write().map_err(storage)?;
        WriteTables::open(&wt)?;
        wt.commit().map_err(storage)?;
        tracing::debug!(path = %path.display(), "opened action store");
        Ok(Self { db })
    }

    fn write<T>(&self, op: impl FnOnce(&mut WriteTables<'_>) -> Result<T>) -> Result<T> {
        let wt = self.db.begin_write().map_err(storage)?;
        let out = {
            let mut tables = WriteTables::open(&wt)?;
            op(&mut tables)?
        };
        wt.commit().map_err(storage)?;
        Ok(out)
    }

    fn read(&self) -> Result<ReadTables> {
        let rt = self.db.begin_read().map_err(storage)?;
        Ok(ReadTables {
            actions: rt.open_table(ACTIONS).map_err(storage)?,
            due: rt.open_table(DUE_INDEX).map_err(storage)?,
            groups: rt.open_multimap_table(GROUP_INDEX).map_err(storage)?,
        })
    }
}

impl ActionStore for RedbStore {
    fn enqueue(&self, new_action: NewAction, now: DateTime<Utc>) -> Result<Action> {
        let action = new_action.clone().into_action(Uuid::new_v4(), now)?;
        self.write(|t| {
            if new_action.unique {
                let live = ActionFilter {
                    statuses: vec![ActionStatus::Pending, ActionStatus::InProgress],
                    group: new_action.group.clone(),
                    ..ActionFilter::default()
                };
                let existing = candidates(&t.actions, &t.due, &t.groups, &live)?
                    .into_iter()
                    .find(|a| new_action.duplicates(a));
                if let Some(existing) = existing {
                    tracing::debug!(action_id = %existing.id, hook = %existing.hook, "unique enqueue matched existing action");
                    return Ok(existing);
                }
            }
            t.put_action(None, &action)?;
            Ok(action)
        })
    }

    fn get(&self, id: Uuid) -> Result<Action> {
        let t = self.read()?;
        load_action(&t.actions, id)?.ok_or(HookqError::ActionNotFound(id))
    }

    fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        self.write(|t| {
            let old = t.require_action(id)?;
            let mut new = old.clone();
            let outcome = new.request_cancel(now);
            if outcome != CancelOutcome::Unchanged {
                t.put_action(Some(&old), &new)?;
            }
            Ok(outcome)
        })
    }

    fn query(&self, query: &ActionQuery) -> Result<Vec<Action>> {
        query.validate()?;
        let t = self.read()?;
        let rows = candidates(&t.actions, &t.due, &t.groups, &query.filter)?;
        Ok(query.apply(rows))
    }

    fn count_by_status(&self, filter: &ActionFilter) -> Result<StatusCounts> {
        filter.validate()?;
        let t = self.read()?;
        let mut counts = StatusCounts::new();

        if filter.is_index_only() && filter.due_after.is_none() && filter.due_before.is_none() {
            // Key-only scan; the leading byte is the status.
            for entry in t.due.iter().map_err(storage)? {
                let (key, _) = entry.map_err(storage)?;
                let Some(status) = key.value().first().copied().and_then(status_from_tag) else {
                    continue;
                };
                if filter.statuses.is_empty() || filter.statuses.contains(&status) {
                    counts.add(status);
                }
            }
            return Ok(counts);
        }

        for action in candidates(&t.actions, &t.due, &t.groups, filter)? {
            if filter.matches(&action) {
                counts.add(action.status);
            }
        }
        Ok(counts)
    }

    fn claim(&self, request: &ClaimRequest) -> Result<Claim> {
        self.write(|t| {
            let mut selected = Vec::new();
            if request.batch_size > 0 {
                let lower = due_bound(ActionStatus::Pending, 0, 0x00);
                let upper = due_bound(ActionStatus::Pending, millis(request.now), 0xff);
                for entry in t.due.range(lower.as_slice()..=upper.as_slice()).map_err(storage)? {
                    let (key, _) = entry.map_err(storage)?;
                    let id = id_from_due_key(key.value())?;
                    if request.exclude.contains(&id) {
                        continue;
                    }
                    let Some(action) = load_action(&t.actions, id)? else {
                        tracing::warn!(action_id = %id, "due index entry without action");
                        continue;
                    };
                    // sub-millisecond due times share a key with `now`
                    if !action.is_due(request.now) {
                        continue;
                    }
                    selected.push(action);
                    if selected.len() >= request.batch_size {
                        break;
                    }
                }
            }

            let mut claim = request.to_claim(Vec::with_capacity(selected.len()))?;
            for old in selected {
                let mut new = old.clone();
                new.mark_claimed(claim.id, request.now);
                t.put_action(Some(&old), &new)?;
                claim.action_ids.push(old.id);
            }

            if !claim.is_empty() {
                t.put_claim(&claim)?;
            }
            Ok(claim)
        })
    }

    fn get_claim(&self, claim_id: Uuid) -> Result<Claim> {
        let rt = self.db.begin_read().map_err(storage)?;
        let claims = rt.open_table(CLAIMS).map_err(storage)?;
        load_claim(&claims, claim_id)?.ok_or(HookqError::ClaimNotFound(claim_id))
    }

    fn renew_claim(&self, claim_id: Uuid, expires_at: DateTime<Utc>) -> Result<Claim> {
        self.write(|t| {
            let old = load_claim(&t.claims, claim_id)?.ok_or(HookqError::ClaimNotFound(claim_id))?;
            let mut renewed = old.clone();
            renewed.expires_at = expires_at.max(old.expires_at);
            t.delete_claim(&old)?;
            t.put_claim(&renewed)?;
            Ok(renewed)
        })
    }

    fn release(&self, claim_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        self.write(|t| {
            let claim = load_claim(&t.claims, claim_id)?.ok_or(HookqError::ClaimNotFound(claim_id))?;
            t.delete_claim(&claim)?;
            let mut released = 0;
            for id in &claim.action_ids {
                let Some(old) = load_action(&t.actions, *id)? else {
                    continue;
                };
                if check_held(&old, claim_id).is_err() {
                    continue;
                }
                let mut new = old.clone();
                new.mark_released(now);
                t.put_action(Some(&old), &new)?;
                released += 1;
            }
            Ok(released)
        })
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.write(|t| {
            let upper = expired_upper_bound(now);
            let mut expired = Vec::new();
            for entry in t.expiry.range(..=upper.as_slice()).map_err(storage)? {
                let (key, _) = entry.map_err(storage)?;
                let key = key.value().to_vec();
                let claim_id = key
                    .get(8..EXPIRY_KEY_LEN)
                    .ok_or_else(|| HookqError::Storage("malformed claim expiry key".into()))
                    .and_then(|b| Uuid::from_slice(b).map_err(storage))?;
                expired.push((key, claim_id));
            }

            let mut reclaimed = 0;
            for (key, claim_id) in expired {
                t.expiry.remove(key.as_slice()).map_err(storage)?;
                let Some(claim) = load_claim(&t.claims, claim_id)? else {
                    continue;
                };
                t.claims
                    .remove(claim_id.as_bytes().as_slice())
                    .map_err(storage)?;
                for id in &claim.action_ids {
                    let Some(old) = load_action(&t.actions, *id)? else {
                        continue;
                    };
                    if check_held(&old, claim_id).is_err() {
                        continue;
                    }
                    let mut new = old.clone();
                    new.mark_abandoned(claim_id, now);
                    t.put_action(Some(&old), &new)?;
                    tracing::debug!(action_id = %id, %claim_id, "reclaimed abandoned action");
                    reclaimed += 1;
                }
            }
            Ok(reclaimed)
        })
    }

    fn record_run(
        &self,
        id: Uuid,
        claim_id: Uuid,
        transition: RunTransition,
        now: DateTime<Utc>,
    ) -> Result<Action> {
        self.write(|t| {
            let old = t.require_action(id)?;
            check_held(&old, claim_id)?;
            let mut new = old.clone();
            new.apply_run(transition, now);
            t.put_action(Some(&old), &new)?;
            Ok(new)
        })
    }

    fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.write(|t| {
            let mut doomed = Vec::new();
            for status in ActionStatus::all().iter().copied().filter(|s| s.is_terminal()) {
                for id in scan_status(&t.due, status, None, None)? {
                    if let Some(action) = load_action(&t.actions, id)? {
                        if finished_at(&action) < cutoff {
                            doomed.push(action);
                        }
                    }
                }
            }
            for action in &doomed {
                t.delete_action(action)?;
            }
            Ok(doomed.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance::{self, t0};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("actions.redb")).unwrap()
    }

    #[test]
    fn redb_store_conformance() {
        // each factory call gets its own directory; keep them alive for the run
        let dirs = std::cell::RefCell::new(Vec::new());
        conformance::run_all(|| {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir);
            dirs.borrow_mut().push(dir);
            Box::new(store)
        });
    }

    #[test]
    fn priority_bytes_sort_descending() {
        let mut keys: Vec<[u8; 4]> = [i32::MIN, -1, 0, 1, i32::MAX]
            .iter()
            .map(|p| priority_bytes(*p))
            .collect();
        let expected: Vec<[u8; 4]> = [i32::MAX, 1, 0, -1, i32::MIN]
            .iter()
            .map(|p| priority_bytes(*p))
            .collect();
        keys.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn due_bound_brackets_keys() {
        let action = NewAction::single("h", t0())
            .with_priority(3)
            .into_action(Uuid::new_v4(), t0())
            .unwrap();
        let key = due_key(&action);
        let lower = due_bound(ActionStatus::Pending, millis(t0()), 0x00);
        let upper = due_bound(ActionStatus::Pending, millis(t0()), 0xff);
        assert!(lower <= key && key <= upper);
        let before = due_bound(ActionStatus::Pending, millis(t0()) - 1, 0xff);
        assert!(key > before);
        assert_eq!(id_from_due_key(&key).unwrap(), action.id);
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = open_store(&dir);
            store
                .enqueue(NewAction::interval("nightly", t0(), 86_400).in_group("ops"), t0())
                .unwrap()
                .id
        };
        let store = open_store(&dir);
        let action = store.get(id).unwrap();
        assert_eq!(action.hook, "nightly");
        let grouped = store
            .query(&ActionQuery::new(ActionFilter::default().in_group("ops")))
            .unwrap();
        assert_eq!(grouped.len(), 1);
    }

    #[test]
    fn index_follows_status_changes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let a = store.enqueue(NewAction::single("h", t0()), t0()).unwrap();
        let claim = store
            .claim(&ClaimRequest::new("w", 1, Duration::from_secs(30), t0()))
            .unwrap();
        store
            .record_run(a.id, claim.id, RunTransition::Succeeded { next_due: None }, t0())
            .unwrap();

        let counts = store.count_by_status(&ActionFilter::default()).unwrap();
        assert_eq!(counts.get(ActionStatus::Complete), 1);
        assert_eq!(counts.get(ActionStatus::Pending), 0);
        assert_eq!(counts.get(ActionStatus::InProgress), 0);
        assert_eq!(counts.total(), 1);
    }

    #[test]
    fn concurrent_claims_never_overlap() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_store(&dir));
        for i in 0..40 {
            store
                .enqueue(NewAction::single(format!("job-{i}"), t0()), t0())
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let claim = store
                            .claim(&ClaimRequest::new(
                                format!("w{w}"),
                                3,
                                Duration::from_secs(60),
                                t0(),
                            ))
                            .unwrap();
                        if claim.is_empty() {
                            break;
                        }
                        mine.extend(claim.action_ids);
                    }
                    mine
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: HashSet<Uuid> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }
}
