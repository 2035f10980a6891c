//! Decides which accounts are due and hands them to workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::model::Account;
use crate::state::{Context, Refusal, WorkerSlot};
use crate::worker::AccountWorker;

/// Scheduling inputs for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub account_id: Uuid,
    pub last_run: Option<DateTime<Utc>>,
    pub interval: Duration,
}

/// Accounts to dispatch now, longest waiting first.
///
/// An account is due when it never ran or its interval has elapsed since its
/// last run. In-flight accounts are never due. At most `capacity` accounts
/// are returned.
pub fn due_accounts(
    now: DateTime<Utc>,
    candidates: &[Candidate],
    in_flight: &HashSet<Uuid>,
    capacity: usize,
) -> Vec<Uuid> {
    let mut due: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !in_flight.contains(&c.account_id))
        .filter(|c| match c.last_run {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .map_or(false, |elapsed| elapsed >= c.interval),
        })
        .collect();

    // None sorts first: accounts that never ran have waited the longest
    due.sort_by_key(|c| c.last_run);
    due.into_iter().take(capacity).map(|c| c.account_id).collect()
}

/// Result of a dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    AlreadyRunning,
    AtCapacity,
    NotRunning,
}

/// Spawns a worker for the account if it is free and capacity allows.
pub(crate) fn dispatch(ctx: &Arc<Context>, account: Account) -> Dispatch {
    let account_id = account.id;
    let (slot, cancel) = match ctx.try_reserve(account_id) {
        Ok(reserved) => reserved,
        Err(Refusal::Busy) => {
            debug!("Account '{}' is already being processed", account.name);
            return Dispatch::AlreadyRunning;
        }
        Err(Refusal::AtCapacity) => return Dispatch::AtCapacity,
        Err(Refusal::NotRunning) => return Dispatch::NotRunning,
    };

    let worker_ctx = Arc::clone(ctx);
    let handle = ctx
        .tracker
        .spawn(run_reserved(worker_ctx, slot, account, cancel));
    ctx.attach_abort_handle(account_id, handle.abort_handle());
    Dispatch::Started
}

async fn run_reserved(ctx: Arc<Context>, slot: WorkerSlot, account: Account, cancel: CancellationToken) {
    info!("📬 Processing account '{}'", account.name);
    let worker = AccountWorker::new(&ctx.config, ctx.repo.as_ref(), ctx.mail.as_ref(), &ctx.retention);
    let report = worker.run(&account, &cancel).await;

    for e in &report.errors {
        ctx.status.record_error(Some(account.id), e);
    }
    match &report.failure {
        None => info!(
            "✅ Account '{}' done: {} message(s), {} new item(s), {} action(s)",
            account.name, report.messages_seen, report.items_created, report.actions_applied
        ),
        Some(e) => {
            error!("❌ Account '{}' failed after {} attempt(s): {}", account.name, report.attempts, e);
            ctx.status.record_error(Some(account.id), e);
        }
    }
    slot.finish(report.messages_seen);
}

/// One decision step: deferred manual requests first, then due accounts.
/// Returns the number of workers started.
pub(crate) async fn tick(ctx: &Arc<Context>, now: DateTime<Utc>) -> Result<usize> {
    let accounts: Vec<Account> = ctx
        .repo
        .list_accounts()
        .await?
        .into_iter()
        .filter(|a| a.active)
        .collect();
    ctx.status.set_accounts_count(accounts.len());
    let by_id: HashMap<Uuid, &Account> = accounts.iter().map(|a| (a.id, a)).collect();

    let mut started = 0;
    for account_id in ctx.take_pending() {
        let Some(account) = by_id.get(&account_id) else {
            debug!("Dropping deferred request for unknown or inactive account {}", account_id);
            continue;
        };
        match dispatch(ctx, (*account).clone()) {
            Dispatch::Started => started += 1,
            Dispatch::AtCapacity => ctx.defer(account_id),
            Dispatch::AlreadyRunning | Dispatch::NotRunning => {}
        }
    }

    let (in_flight, last_runs, capacity) = ctx.dispatch_view();
    if capacity == 0 {
        return Ok(started);
    }
    let candidates: Vec<Candidate> = accounts
        .iter()
        .map(|a| Candidate {
            account_id: a.id,
            last_run: last_runs.get(&a.id).copied(),
            interval: ctx.config.interval_for(a.poll_interval_minutes),
        })
        .collect();

    for account_id in due_accounts(now, &candidates, &in_flight, capacity) {
        if let Some(account) = by_id.get(&account_id) {
            if dispatch(ctx, (*account).clone()) == Dispatch::Started {
                started += 1;
            }
        }
    }
    Ok(started)
}

/// Ticks until cancelled. Never waits on a worker.
pub(crate) async fn run_loop(ctx: Arc<Context>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = ctx.wake.notified() => {}
        }
        match tick(&ctx, Utc::now()).await {
            Ok(0) => {}
            Ok(started) => debug!("Tick started {} worker(s)", started),
            Err(e) => {
                warn!("⚠️  Scheduler tick failed: {}", e);
                ctx.status.record_error(None, &e);
            }
        }
    }
    debug!("Scheduler loop stopped");
}
