//! Periodic driver: claims due feeds in batches and refreshes each in its own
//! task.
//!
//! A feed is Idle until a tick claims it (`claimed = true`, lease issued),
//! and Idle again once its refresh stores entries or releases the claim.
//! Claiming is a single conditional UPDATE in the store, so overlapping
//! ticks, on-demand refreshes and a second process never hand out the same
//! feed twice while its lease is valid.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::feed::{refresh_claimed, wait_for_shutdown, RefreshContext, RefreshError, RefreshReport};
use crate::storage::{Claim, DatabaseError, Release};

/// Outcome of one feed's refresh, as seen by the scheduler.
#[derive(Debug)]
pub struct RefreshResult {
    pub feed_id: i64,
    pub result: Result<RefreshReport, RefreshError>,
}

pub struct Scheduler {
    ctx: Arc<RefreshContext>,
    interval: Duration,
    batch_size: u32,
}

enum Wake {
    Tick,
    Finished(Result<RefreshResult, JoinError>),
    Shutdown,
}

impl Scheduler {
    pub fn new(ctx: Arc<RefreshContext>, interval: Duration, batch_size: u32) -> Self {
        Self {
            ctx,
            interval,
            batch_size,
        }
    }

    pub fn from_config(ctx: Arc<RefreshContext>, config: &Config) -> Self {
        Self::new(ctx, config.tick_interval(), config.batch_size)
    }

    /// Claim up to one batch of due feeds and spawn a refresh for each.
    async fn dispatch_due(
        &self,
        tasks: &mut JoinSet<RefreshResult>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize, DatabaseError> {
        let claims = self
            .ctx
            .db
            .claim_due(Utc::now(), self.batch_size, self.ctx.policy.lease)
            .await?;

        let claimed = claims.len();
        for claim in claims {
            let worker = refresh_task(Arc::clone(&self.ctx), claim.clone(), shutdown.clone());
            tasks.spawn(supervise(Arc::clone(&self.ctx), claim, worker));
        }

        if claimed > 0 {
            tracing::info!(claimed, batch_size = self.batch_size, "Dispatched refreshes");
        } else {
            tracing::debug!("No feeds due");
        }
        Ok(claimed)
    }

    /// Run a single tick and wait for every refresh it dispatched.
    ///
    /// Results are ordered by feed id.
    pub async fn tick(&self) -> Result<Vec<RefreshResult>, DatabaseError> {
        let (_keep, shutdown) = watch::channel(false);
        let mut tasks = JoinSet::new();
        self.dispatch_due(&mut tasks, &shutdown).await?;

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(result) = joined_result(joined) {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.feed_id);
        Ok(results)
    }

    /// Tick every interval until `shutdown` becomes true.
    ///
    /// The first tick runs immediately; ticks missed while the runtime was
    /// busy are skipped, not replayed. Refreshes still running at shutdown
    /// see the signal, release their claims and are awaited before this
    /// returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks: JoinSet<RefreshResult> = JoinSet::new();

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Scheduler started"
        );

        loop {
            let wake = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => Wake::Shutdown,
                _ = timer.tick() => Wake::Tick,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => Wake::Finished(joined),
            };

            match wake {
                Wake::Tick => {
                    if let Err(e) = self.dispatch_due(&mut tasks, &shutdown).await {
                        tracing::error!(error = %e, "Failed to claim due feeds");
                    }
                }
                Wake::Finished(joined) => {
                    joined_result(joined);
                }
                Wake::Shutdown => break,
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for refreshes to stop");
        }
        while let Some(joined) = tasks.join_next().await {
            joined_result(joined);
        }
        tracing::info!("Scheduler stopped");
    }
}

fn joined_result(joined: Result<RefreshResult, JoinError>) -> Option<RefreshResult> {
    match joined {
        Ok(result) => Some(result),
        Err(e) => {
            tracing::error!(error = %e, "Refresh supervisor failed");
            None
        }
    }
}

async fn refresh_task(
    ctx: Arc<RefreshContext>,
    claim: Claim,
    shutdown: watch::Receiver<bool>,
) -> Result<RefreshReport, RefreshError> {
    refresh_claimed(&ctx, &claim.feed, &claim.lease, shutdown).await
}

/// Runs `worker` for `claim` in its own task and turns a panic into a
/// released claim.
async fn supervise<F>(ctx: Arc<RefreshContext>, claim: Claim, worker: F) -> RefreshResult
where
    F: Future<Output = Result<RefreshReport, RefreshError>> + Send + 'static,
{
    let feed_id = claim.feed.id;

    let result = match tokio::spawn(worker).await {
        Ok(result) => result,
        Err(e) => {
            let (reason, detail) = if e.is_panic() {
                ("refresh task panicked", panic_message(e.into_panic()))
            } else {
                ("refresh task was cancelled", e.to_string())
            };
            tracing::error!(feed_id, url = %claim.feed.url, error = %detail, "{}", reason);

            let release = Release::Deferred {
                last_error: Some(reason),
                next_eligible_at: Utc::now() + ctx.policy.cooldown,
            };
            if let Err(db_err) = ctx.db.release_claim(&claim.lease, release).await {
                tracing::error!(feed_id, error = %db_err, "Failed to release claim");
            }
            Err(RefreshError::Aborted(detail))
        }
    };

    RefreshResult { feed_id, result }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
