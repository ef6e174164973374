//! End-to-end scheduler behaviour against the durable store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hookq_core::{
    ActionFilter, ActionQuery, ActionStatus, ActionStore, CancelOutcome, ClaimRequest, Clock,
    HandlerContext, HandlerError, HandlerRegistry, InFlight, ManualClock, NewAction, RedbStore,
    RetryPolicy, RunOutcome, Scheduler, SchedulerOptions,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

struct Harness {
    _dir: TempDir,
    store: Arc<RedbStore>,
    clock: Arc<ManualClock>,
    calls: Arc<AtomicU32>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("actions.redb")).unwrap());
        Self {
            _dir: dir,
            store,
            clock: Arc::new(ManualClock::new(t0())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn handlers(&self) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        let calls = self.calls.clone();
        handlers
            .register("succeed", move |_ctx: HandlerContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            })
            .unwrap();
        let calls = self.calls.clone();
        handlers
            .register("fail", move |_ctx: HandlerContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(HandlerError::new("downstream unavailable"))
                }
            })
            .unwrap();
        handlers
    }

    fn scheduler(&self, holder: &str) -> Scheduler {
        Scheduler::with_options(
            self.store.clone(),
            Arc::new(self.handlers()),
            self.clock.clone(),
            holder,
            RetryPolicy::fixed(3, 10),
            SchedulerOptions {
                batch_size: 10,
                lease: StdDuration::from_secs(30),
                tick_interval: StdDuration::from_millis(10),
                execution_budget: StdDuration::from_secs(5),
                retention: None,
                purge_interval: StdDuration::from_secs(3600),
            },
        )
    }

    /// Schedulers sharing `in_flight` whose "overrun" handler sleeps far past
    /// a 50ms budget and ignores the cancel flag.
    fn overrun_scheduler(
        &self,
        holder: &str,
        in_flight: &InFlight,
        running: &Arc<AtomicU32>,
        peak: &Arc<AtomicU32>,
    ) -> Scheduler {
        let mut handlers = HandlerRegistry::new();
        let (running, peak) = (running.clone(), peak.clone());
        handlers
            .register("overrun", move |_ctx: HandlerContext| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(300)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            })
            .unwrap();
        Scheduler::with_options(
            self.store.clone(),
            Arc::new(handlers),
            self.clock.clone(),
            holder,
            RetryPolicy::fixed(5, 1),
            SchedulerOptions {
                batch_size: 10,
                lease: StdDuration::from_secs(30),
                tick_interval: StdDuration::from_millis(10),
                execution_budget: StdDuration::from_millis(50),
                retention: None,
                purge_interval: StdDuration::from_secs(3600),
            },
        )
        .with_in_flight(in_flight.clone())
    }

    fn claim(&self, holder: &str, batch: usize) -> hookq_core::Claim {
        self.store
            .claim(&ClaimRequest::new(
                holder,
                batch,
                StdDuration::from_secs(30),
                self.clock.now(),
            ))
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_action_runs_exactly_once() {
    let h = Harness::new();
    let due = t0() + Duration::seconds(30);
    let a = h.store.enqueue(NewAction::single("succeed", due), t0()).unwrap();
    let sched = h.scheduler("w1");

    assert_eq!(sched.tick().await.unwrap().claimed, 0);

    h.clock.set(due + Duration::seconds(1));
    assert_eq!(sched.tick().await.unwrap().claimed, 1);
    assert_eq!(sched.tick().await.unwrap().claimed, 0);

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.get(a.id).unwrap().status, ActionStatus::Complete);
}

#[tokio::test]
async fn overrunning_handler_is_never_invoked_twice_at_once() {
    let h = Harness::new();
    let in_flight = InFlight::new();
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let first = h.overrun_scheduler("w1", &in_flight, &running, &peak);
    let second = h.overrun_scheduler("w2", &in_flight, &running, &peak);
    let a = h.store.enqueue(NewAction::single("overrun", t0()), t0()).unwrap();

    let report = first.tick().await.unwrap();
    assert!(matches!(report.results[0].outcome, RunOutcome::Retrying { attempt: 1, .. }));
    assert_eq!(h.store.get(a.id).unwrap().status, ActionStatus::Pending);

    // due again, but the timed-out invocation is still running
    h.clock.advance(Duration::seconds(2));
    assert_eq!(second.tick().await.unwrap().claimed, 0);

    for _ in 0..100 {
        if in_flight.is_empty() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(in_flight.is_empty());
    let report = second.tick().await.unwrap();
    assert!(matches!(report.results[0].outcome, RunOutcome::Retrying { attempt: 2, .. }));

    for _ in 0..100 {
        if in_flight.is_empty() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interval_action_runs_on_its_grid() {
    let h = Harness::new();
    let a = h
        .store
        .enqueue(NewAction::interval("succeed", t0(), 60), t0())
        .unwrap();
    let sched = h.scheduler("w1");

    sched.tick().await.unwrap();
    h.clock.advance(Duration::seconds(60));
    sched.tick().await.unwrap();

    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    let a = h.store.get(a.id).unwrap();
    assert_eq!(a.status, ActionStatus::Pending);
    assert_eq!(a.runs, 2);
    assert_eq!(a.next_due_at, t0() + Duration::seconds(120));
}

#[tokio::test]
async fn interval_does_not_drift_when_runs_are_late() {
    let h = Harness::new();
    let a = h
        .store
        .enqueue(NewAction::interval("succeed", t0(), 45), t0())
        .unwrap();
    let sched = h.scheduler("w1");

    for k in 1..=20i64 {
        // each tick happens 13 seconds after the action was due
        h.clock.set(h.store.get(a.id).unwrap().next_due_at + Duration::seconds(13));
        sched.tick().await.unwrap();
        assert_eq!(
            h.store.get(a.id).unwrap().next_due_at,
            t0() + Duration::seconds(45 * k)
        );
    }
}

#[test]
fn two_workers_split_due_set_without_overlap() {
    let h = Harness::new();
    let ids: HashSet<Uuid> = (0..5)
        .map(|i| {
            h.store
                .enqueue(NewAction::single("succeed", t0()).with_arg(json!(i)), t0())
                .unwrap()
                .id
        })
        .collect();

    let now = h.clock.now();
    let workers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|holder| {
            let store = h.store.clone();
            std::thread::spawn(move || {
                store
                    .claim(&ClaimRequest::new(holder, 10, StdDuration::from_secs(30), now))
                    .unwrap()
                    .action_ids
            })
        })
        .collect();

    let results: Vec<Vec<Uuid>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let union: HashSet<Uuid> = results.iter().flatten().copied().collect();
    assert_eq!(results[0].len() + results[1].len(), 5);
    assert_eq!(union, ids);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn claim_never_returns_future_or_non_pending_actions() {
    let h = Harness::new();
    let future = h
        .store
        .enqueue(NewAction::single("succeed", t0() + Duration::seconds(1)), t0())
        .unwrap();
    let canceled = h.store.enqueue(NewAction::single("succeed", t0()), t0()).unwrap();
    h.store.cancel(canceled.id, t0()).unwrap();
    let due = h.store.enqueue(NewAction::single("succeed", t0()), t0()).unwrap();

    let claim = h.claim("w", 10);
    assert_eq!(claim.action_ids, vec![due.id]);
    assert!(!claim.action_ids.contains(&future.id));
    // an in-progress action is not handed out twice
    assert!(h.claim("w2", 10).is_empty());
}

#[test]
fn abandoned_claim_is_recovered_exactly_once() {
    let h = Harness::new();
    let a = h.store.enqueue(NewAction::single("succeed", t0()), t0()).unwrap();
    let first = h.claim("crashed", 10);
    assert_eq!(first.action_ids, vec![a.id]);

    // lease not yet expired
    h.clock.set(t0() + Duration::seconds(29));
    assert_eq!(h.store.reclaim_expired(h.clock.now()).unwrap(), 0);
    assert!(h.claim("w", 10).is_empty());

    h.clock.set(t0() + Duration::seconds(30));
    assert_eq!(h.store.reclaim_expired(h.clock.now()).unwrap(), 1);
    let second = h.claim("w", 10);
    let third = h.claim("w2", 10);
    assert_eq!(second.action_ids, vec![a.id]);
    assert!(third.is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_and_are_never_claimed_again() {
    let h = Harness::new();
    let a = h.store.enqueue(NewAction::single("fail", t0()), t0()).unwrap();
    let sched = h.scheduler("w1");

    for _ in 0..3 {
        let report = sched.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        // jump past any backoff
        h.clock.advance(Duration::hours(1));
    }

    let a = h.store.get(a.id).unwrap();
    assert_eq!(a.status, ActionStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);

    h.clock.advance(Duration::days(30));
    assert_eq!(sched.tick().await.unwrap().claimed, 0);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_actions() {
    let h = Harness::new();
    let done = h.store.enqueue(NewAction::single("succeed", t0()), t0()).unwrap();
    let failed = h
        .store
        .enqueue(NewAction::single("fail", t0()).with_max_attempts(1), t0())
        .unwrap();
    let canceled = h
        .store
        .enqueue(NewAction::single("succeed", t0() + Duration::hours(1)), t0())
        .unwrap();
    h.store.cancel(canceled.id, t0()).unwrap();
    h.scheduler("w1").tick().await.unwrap();

    for (id, status) in [
        (done.id, ActionStatus::Complete),
        (failed.id, ActionStatus::Failed),
        (canceled.id, ActionStatus::Canceled),
    ] {
        let before = h.store.get(id).unwrap();
        assert_eq!(before.status, status);
        assert_eq!(h.store.cancel(id, h.clock.now()).unwrap(), CancelOutcome::Unchanged);
        assert_eq!(h.store.get(id).unwrap(), before);
    }
}

#[test]
fn query_and_counts_agree() {
    let h = Harness::new();
    for i in 0..6 {
        let new_action = NewAction::single("succeed", t0() + Duration::minutes(i))
            .in_group(if i < 4 { "reports" } else { "mail" });
        h.store.enqueue(new_action, t0()).unwrap();
    }
    h.claim("w", 2);

    let filter = ActionFilter::default().in_group("reports");
    let rows = h.store.query(&ActionQuery::new(filter.clone())).unwrap();
    let counts = h.store.count_by_status(&filter).unwrap();
    assert_eq!(rows.len() as u64, counts.total());
    let in_progress = rows
        .iter()
        .filter(|a| a.status == ActionStatus::InProgress)
        .count() as u64;
    assert_eq!(in_progress, counts.get(ActionStatus::InProgress));
    assert_eq!(counts.get(ActionStatus::InProgress), 1);
}
