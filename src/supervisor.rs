use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::ProcessingError;
use crate::mail::MailClient;
use crate::scheduler::{self, Dispatch};
use crate::state::Context;
use crate::status::{LifecycleState, ServiceStatus};
use crate::storage::Repository;

/// Grace period for aborted workers to unwind.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Result of a supervisor command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    fn ok(message: impl Into<String>) -> Self {
        CommandResult { success: true, message: message.into() }
    }

    fn fail(message: impl Into<String>) -> Self {
        CommandResult { success: false, message: message.into() }
    }

    fn conflict(message: impl Into<String>) -> Self {
        let error = ProcessingError::LifecycleConflict(message.into());
        warn!("⚠️  {}", error);
        Self::fail(error.to_string())
    }
}

/// Owns the service lifecycle and exposes the operator commands.
///
/// Cloning is cheap; every clone drives the same service.
#[derive(Clone)]
pub struct Supervisor {
    ctx: Arc<Context>,
}

impl Supervisor {
    pub fn new(config: ServiceConfig, repo: Arc<dyn Repository>, mail: Arc<dyn MailClient>) -> Self {
        Supervisor {
            ctx: Arc::new(Context::new(config, repo, mail)),
        }
    }

    pub async fn start(&self, force: bool) -> CommandResult {
        let current = self.ctx.lock().lifecycle.clone();
        match current {
            LifecycleState::Stopped | LifecycleState::Error(_) => {}
            LifecycleState::Running if force => {
                let stopped = self.stop().await;
                if !stopped.success {
                    return stopped;
                }
            }
            LifecycleState::Running => return CommandResult::fail("service is already running"),
            other => return CommandResult::conflict(format!("cannot start while the service is {}", other)),
        }
        self.launch().await
    }

    async fn launch(&self) -> CommandResult {
        let cancel = {
            let mut state = self.ctx.lock();
            match &state.lifecycle {
                LifecycleState::Stopped | LifecycleState::Error(_) => {}
                other => return CommandResult::conflict(format!("cannot start while the service is {}", other)),
            }
            if !self.ctx.config.enabled {
                return CommandResult::fail("processing is disabled in the configuration");
            }
            state.lifecycle = LifecycleState::Starting;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };

        info!("🚀 Starting mail feed service");
        self.ctx.status.reset();

        let accounts = match self.ctx.config.validate() {
            Ok(()) => self.ctx.repo.list_accounts().await,
            Err(e) => Err(e),
        };
        let accounts = match accounts {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("❌ Service failed to start: {}", e);
                self.ctx.status.record_error(None, &e);
                self.ctx.fail(&e.to_string());
                return CommandResult::fail(format!("start failed: {}", e));
            }
        };
        let mut state = self.ctx.lock();
        // a stop during the listing has already cancelled this start
        if state.lifecycle != LifecycleState::Starting || cancel.is_cancelled() {
            return CommandResult::fail("start was interrupted by a stop");
        }
        self.ctx
            .status
            .set_accounts_count(accounts.iter().filter(|a| a.active).count());
        self.ctx.tracker.reopen();
        let loop_task = tokio::spawn(scheduler::run_loop(Arc::clone(&self.ctx), cancel));
        let ctx = Arc::clone(&self.ctx);
        // a panicking scheduler loop is a service fault, not a worker failure
        let watcher = tokio::spawn(async move {
            if let Err(e) = loop_task.await {
                if e.is_panic() {
                    error!("❌ Scheduler loop panicked");
                    ctx.fail("scheduler loop panicked");
                }
            }
        });
        state.loop_handle = Some(watcher);
        state.lifecycle = LifecycleState::Running;
        state.started_at = Some(Utc::now());
        info!("✅ Service running with {} account(s)", accounts.len());
        CommandResult::ok("service started")
    }

    /// Cancels workers, waits for them up to the drain timeout and abandons
    /// the rest.
    pub async fn stop(&self) -> CommandResult {
        let (cancel, watcher) = {
            let mut state = self.ctx.lock();
            match &state.lifecycle {
                LifecycleState::Running | LifecycleState::Starting => {}
                LifecycleState::Stopped => return CommandResult::fail("service is not running"),
                other => return CommandResult::conflict(format!("cannot stop while the service is {}", other)),
            }
            state.lifecycle = LifecycleState::Stopping;
            (state.cancel.clone(), state.loop_handle.take())
        };

        info!("🛑 Stopping mail feed service");
        cancel.cancel();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        let abandoned = self.drain().await;

        {
            let mut state = self.ctx.lock();
            state.lifecycle = LifecycleState::Stopped;
            state.pending.clear();
        }
        info!("👋 Service stopped");
        if abandoned == 0 {
            CommandResult::ok("service stopped")
        } else {
            CommandResult::ok(format!("service stopped, {} worker(s) abandoned", abandoned))
        }
    }

    pub async fn restart(&self) -> CommandResult {
        let running = matches!(
            self.ctx.lock().lifecycle,
            LifecycleState::Running | LifecycleState::Starting
        );
        if running {
            let stopped = self.stop().await;
            if !stopped.success {
                return stopped;
            }
        }
        self.launch().await
    }

    /// Runs one account now, or as soon as capacity frees up.
    pub async fn process(&self, account_id: Uuid) -> CommandResult {
        if let Some(refused) = self.require_running() {
            return refused;
        }
        let account = match self.ctx.repo.get_account(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return CommandResult::fail(format!("unknown account {}", account_id)),
            Err(e) => return CommandResult::fail(e.to_string()),
        };
        if !account.active {
            return CommandResult::fail(format!("account '{}' is inactive", account.name));
        }

        let name = account.name.clone();
        match scheduler::dispatch(&self.ctx, account) {
            Dispatch::Started => CommandResult::ok(format!("processing started for '{}'", name)),
            Dispatch::AlreadyRunning => CommandResult::ok(format!("'{}' is already being processed", name)),
            Dispatch::AtCapacity => {
                self.ctx.defer(account_id);
                CommandResult::ok(format!("'{}' deferred until a worker is free", name))
            }
            Dispatch::NotRunning => CommandResult::fail("service is not running"),
        }
    }

    pub async fn process_all(&self) -> CommandResult {
        if let Some(refused) = self.require_running() {
            return refused;
        }
        let accounts = match self.ctx.repo.list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => return CommandResult::fail(e.to_string()),
        };

        let (mut started, mut deferred, mut busy) = (0, 0, 0);
        for account in accounts.into_iter().filter(|a| a.active) {
            let account_id = account.id;
            match scheduler::dispatch(&self.ctx, account) {
                Dispatch::Started => started += 1,
                Dispatch::AlreadyRunning => busy += 1,
                Dispatch::AtCapacity => {
                    self.ctx.defer(account_id);
                    deferred += 1;
                }
                Dispatch::NotRunning => return CommandResult::fail("service is not running"),
            }
        }
        CommandResult::ok(format!(
            "{} started, {} deferred, {} already running",
            started, deferred, busy
        ))
    }

    pub fn status(&self) -> ServiceStatus {
        let counters = self.ctx.status.counters();
        let state = self.ctx.lock();
        let uptime_seconds = match (&state.lifecycle, state.started_at) {
            (LifecycleState::Running, Some(started)) => Some((Utc::now() - started).num_seconds()),
            _ => None,
        };

        ServiceStatus {
            state: state.lifecycle.clone(),
            started_at: state.started_at,
            accounts_count: counters.accounts_count,
            active_processing_count: counters.active_processing_count,
            total_emails_processed: counters.total_emails_processed,
            total_errors: counters.total_errors,
            uptime_seconds,
            recent_errors: self.ctx.status.recent_errors(),
            last_runs: state.last_runs.iter().map(|(k, v)| (*k, *v)).collect::<BTreeMap<_, _>>(),
            config: self.ctx.config.clone(),
        }
    }

    fn require_running(&self) -> Option<CommandResult> {
        match &self.ctx.lock().lifecycle {
            LifecycleState::Running => None,
            LifecycleState::Starting | LifecycleState::Stopping => {
                Some(CommandResult::conflict("service is changing state, try again"))
            }
            other => Some(CommandResult::fail(format!("service is {}", other))),
        }
    }

    /// Returns the number of abandoned workers.
    async fn drain(&self) -> usize {
        let tracker = &self.ctx.tracker;
        tracker.close();
        if timeout(self.ctx.config.drain_timeout(), tracker.wait()).await.is_ok() {
            return 0;
        }

        let abandoned = self.ctx.abort_in_flight();
        warn!(
            "⚠️  {} worker(s) still running after {}s, abandoning them",
            abandoned, self.ctx.config.drain_timeout_seconds
        );
        if timeout(ABORT_GRACE, tracker.wait()).await.is_err() {
            warn!("⚠️  Aborted workers did not unwind in time");
        }
        abandoned
    }
}
