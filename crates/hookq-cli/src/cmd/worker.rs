use crate::cmd::{holder_id, open_project, Project};
use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{Duration, Utc};
use hookq_core::{ActionResult, HandlerRegistry, InFlight, RunOutcome, Scheduler, SystemClock};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn handlers(project: &Project, root: &Path) -> anyhow::Result<Arc<HandlerRegistry>> {
    let registry = HandlerRegistry::from_hooks(&project.config.hooks, root)
        .context("failed to build hook handlers")?;
    if registry.is_empty() {
        tracing::warn!("no hooks configured; every claimed action will fail as unknown");
    }
    Ok(Arc::new(registry))
}

fn scheduler(project: &Project, handlers: Arc<HandlerRegistry>, n: usize) -> Scheduler {
    Scheduler::new(
        Arc::clone(&project.store),
        handlers,
        Arc::new(SystemClock),
        holder_id(n),
        &project.config,
    )
}

/// Start `count` schedulers over one store. They share one in-flight set, and
/// each stops once `stop` flips to true.
pub fn spawn_workers(
    project: &Project,
    root: &Path,
    count: usize,
    stop: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let registry = handlers(project, root)?;
    let in_flight = InFlight::new();
    let mut tasks = Vec::with_capacity(count);
    for n in 0..count.max(1) {
        let sched = scheduler(project, Arc::clone(&registry), n).with_in_flight(in_flight.clone());
        let mut stop = stop.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            sched.run_until(shutdown).await;
        }));
    }
    Ok(tasks)
}

// ---------------------------------------------------------------------------
// tick
// ---------------------------------------------------------------------------

pub fn tick(root: &Path, json: bool) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let sched = scheduler(&project, handlers(&project, root)?, 0);
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(sched.tick())?;

    if json {
        return print_json(&report);
    }
    if report.reclaimed > 0 {
        println!("Reclaimed {} expired claim(s).", report.reclaimed);
    }
    if report.claimed == 0 {
        println!("Nothing due.");
        return Ok(());
    }
    println!("Claimed {} action(s).", report.claimed);
    print_table(
        &["ACTION", "HOOK", "OUTCOME", "DURATION"],
        report.results.iter().map(result_row).collect(),
    );
    Ok(())
}

fn result_row(r: &ActionResult) -> Vec<String> {
    let outcome = match &r.outcome {
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::Rescheduled { next_due } => format!("rescheduled for {}", next_due.to_rfc3339()),
        RunOutcome::Retrying { attempt, next_due } => {
            format!("retry {attempt} at {}", next_due.to_rfc3339())
        }
        RunOutcome::Failed { error } => format!("failed: {error}"),
        RunOutcome::Canceled => "canceled".to_string(),
        RunOutcome::Skipped { reason } => format!("skipped: {reason}"),
    };
    vec![
        r.action_id.to_string(),
        r.hook.clone(),
        outcome,
        format!("{}ms", r.duration_ms),
    ]
}

// ---------------------------------------------------------------------------
// work
// ---------------------------------------------------------------------------

pub fn work(root: &Path, workers: Option<usize>) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let count = workers.unwrap_or(project.config.worker.workers).max(1);
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let (tx, rx) = watch::channel(false);
        let tasks = spawn_workers(&project, root, count, &rx)?;
        println!("hookq: {count} worker(s) running; Ctrl-C to stop");

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        tracing::info!("shutting down");
        let _ = tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// reclaim / purge
// ---------------------------------------------------------------------------

pub fn reclaim(root: &Path, json: bool) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let reclaimed = project.store.reclaim_expired(Utc::now())?;
    if json {
        return print_json(&serde_json::json!({ "reclaimed": reclaimed }));
    }
    println!("Reclaimed {reclaimed} expired claim(s).");
    Ok(())
}

pub fn purge(root: &Path, older_than_days: Option<u32>, json: bool) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let days = older_than_days.unwrap_or(project.config.retention.completed_days);
    if days == 0 && older_than_days.is_none() {
        if json {
            return print_json(&serde_json::json!({ "purged": 0 }));
        }
        println!("Retention is disabled (retention.completed_days = 0); nothing purged.");
        return Ok(());
    }

    let cutoff = Utc::now()
        .checked_sub_signed(Duration::days(i64::from(days)))
        .with_context(|| format!("retention of {days} day(s) is too large"))?;
    let purged = project.store.purge_terminal(cutoff)?;
    if json {
        return print_json(&serde_json::json!({ "purged": purged, "cutoff": cutoff }));
    }
    println!("Purged {purged} finished action(s) older than {days} day(s).");
    Ok(())
}
