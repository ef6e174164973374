//! The worker loop: reclaim, claim, run, release.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::claim::ClaimManager;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{HookqError, Result};
use crate::handler::HandlerRegistry;
use crate::runner::{ActionResult, InFlight, Runner};
use crate::store::ActionStore;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub batch_size: usize,
    pub lease: Duration,
    pub tick_interval: Duration,
    pub execution_budget: Duration,
    /// Finished actions older than this are purged; `None` keeps them.
    pub retention: Option<chrono::Duration>,
    pub purge_interval: Duration,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.worker.batch_size,
            lease: config.worker.lease(),
            tick_interval: config.worker.tick_interval(),
            execution_budget: config.worker.execution_budget(),
            retention: config.retention.window(),
            purge_interval: config.retention.purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub reclaimed: usize,
    pub claim_id: Option<Uuid>,
    pub claimed: usize,
    pub results: Vec<ActionResult>,
}

pub struct Scheduler {
    store: Arc<dyn ActionStore>,
    clock: Arc<dyn Clock>,
    claims: ClaimManager,
    runner: Runner,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ActionStore>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        holder: impl Into<String>,
        config: &Config,
    ) -> Self {
        Self::with_options(
            store,
            handlers,
            clock,
            holder,
            config.retry.clone(),
            SchedulerOptions::from_config(config),
        )
    }

    pub fn with_options(
        store: Arc<dyn ActionStore>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        holder: impl Into<String>,
        retry: crate::retry::RetryPolicy,
        options: SchedulerOptions,
    ) -> Self {
        let runner = Runner::new(
            Arc::clone(&store),
            handlers,
            Arc::clone(&clock),
            retry,
            options.execution_budget,
        );
        Self {
            claims: ClaimManager::new(Arc::clone(&store), holder),
            store,
            clock,
            runner,
            options,
        }
    }

    /// Share `in_flight` with other schedulers in this process. None of them
    /// claims an action whose handler any of them is still running, even
    /// after its budget elapsed and the action went back to `pending`.
    pub fn with_in_flight(mut self, in_flight: InFlight) -> Self {
        self.runner = self.runner.with_in_flight(in_flight);
        self
    }

    pub fn holder(&self) -> &str {
        self.claims.holder()
    }

    /// One pass: recover expired claims, claim a batch, execute it, release
    /// the claim.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let reclaimed = self.claims.reclaim_expired(now)?;
        let claim = self.claims.claim_excluding(
            self.options.batch_size,
            self.options.lease,
            now,
            self.runner.in_flight(),
        )?;

        let mut report = TickReport {
            reclaimed,
            ..TickReport::default()
        };
        if claim.is_empty() {
            return Ok(report);
        }
        report.claim_id = Some(claim.id);
        report.claimed = claim.len();
        report.results = self.runner.run(&claim).await;

        match self.claims.release(claim.id, self.clock.now()) {
            Ok(_) => {}
            Err(HookqError::ClaimNotFound(_)) => {
                tracing::debug!(claim_id = %claim.id, "claim already reclaimed");
            }
            Err(e) => {
                tracing::error!(claim_id = %claim.id, error = %e, "failed to release claim; lease expiry will recover it");
            }
        }
        Ok(report)
    }

    /// Delete finished actions older than the retention window.
    pub fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(window) = self.options.retention else {
            return Ok(0);
        };
        // a window reaching before the earliest representable time keeps everything
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return Ok(0);
        };
        let purged = self.store.purge_terminal(cutoff)?;
        if purged > 0 {
            tracing::info!(purged, "purged finished actions");
        }
        Ok(purged)
    }

    /// Tick on the configured cadence until `shutdown` resolves. A full batch
    /// triggers another tick immediately so backlogs drain without waiting.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.options.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_purge: Option<DateTime<Utc>> = None;
        tracing::info!(holder = %self.holder(), "scheduler started");

        'outer: loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            loop {
                match self.tick().await {
                    Ok(report) => {
                        let full = self.options.batch_size > 0 && report.claimed >= self.options.batch_size;
                        if !full {
                            break;
                        }
                        tracing::debug!(claimed = report.claimed, "full batch; draining");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "tick failed");
                        break;
                    }
                }
                if shutdown.as_mut().now_or_never().is_some() {
                    break 'outer;
                }
            }

            let now = self.clock.now();
            let purge_due = last_purge.map_or(true, |at| {
                (now - at).to_std().unwrap_or_default() >= self.options.purge_interval
            });
            if purge_due {
                if let Err(e) = self.purge(now) {
                    tracing::error!(error = %e, "purge failed");
                }
                last_purge = Some(now);
            }
        }
        tracing::info!(holder = %self.holder(), "scheduler stopped");
    }
}
