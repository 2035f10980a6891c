//! The single process-wide state object shared by the supervisor, the
//! scheduler loop and the workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::ProcessingError;
use crate::mail::MailClient;
use crate::retention::RetentionManager;
use crate::status::{LifecycleState, StatusAggregator};
use crate::storage::Repository;

pub(crate) struct ServiceState {
    pub lifecycle: LifecycleState,
    pub started_at: Option<DateTime<Utc>>,
    /// Root token of the current run of the service; workers get children.
    pub cancel: CancellationToken,
    pub loop_handle: Option<JoinHandle<()>>,
    pub in_flight: HashMap<Uuid, Option<AbortHandle>>,
    /// Manual requests waiting for capacity, oldest first.
    pub pending: VecDeque<Uuid>,
    pub last_runs: HashMap<Uuid, DateTime<Utc>>,
}

pub(crate) struct Context {
    pub config: ServiceConfig,
    pub repo: Arc<dyn Repository>,
    pub mail: Arc<dyn MailClient>,
    pub status: StatusAggregator,
    pub retention: RetentionManager,
    pub tracker: TaskTracker,
    /// Wakes the scheduler loop early when deferred work can proceed.
    pub wake: Notify,
    state: Mutex<ServiceState>,
}

/// Why an account could not get a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    NotRunning,
    Busy,
    AtCapacity,
}

impl Context {
    pub fn new(config: ServiceConfig, repo: Arc<dyn Repository>, mail: Arc<dyn MailClient>) -> Self {
        let status = StatusAggregator::new(config.max_recent_errors);
        Context {
            config,
            repo,
            mail,
            status,
            retention: RetentionManager::new(),
            tracker: TaskTracker::new(),
            wake: Notify::new(),
            state: Mutex::new(ServiceState {
                lifecycle: LifecycleState::Stopped,
                started_at: None,
                cancel: CancellationToken::new(),
                loop_handle: None,
                in_flight: HashMap::new(),
                pending: VecDeque::new(),
                last_runs: HashMap::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims a worker slot for the account.
    ///
    /// The in-flight set is checked and updated under the state lock so the
    /// per-account exclusivity and the concurrency ceiling hold under races.
    pub fn try_reserve(self: &Arc<Self>, account_id: Uuid) -> Result<(WorkerSlot, CancellationToken), Refusal> {
        let mut state = self.lock();
        if state.lifecycle != LifecycleState::Running {
            return Err(Refusal::NotRunning);
        }
        if state.in_flight.contains_key(&account_id) {
            return Err(Refusal::Busy);
        }
        if state.in_flight.len() >= self.config.max_concurrent_accounts {
            return Err(Refusal::AtCapacity);
        }
        state.in_flight.insert(account_id, None);
        self.status.worker_started();

        let slot = WorkerSlot {
            ctx: Arc::clone(self),
            account_id,
            emails_processed: None,
        };
        Ok((slot, state.cancel.child_token()))
    }

    pub fn attach_abort_handle(&self, account_id: Uuid, handle: AbortHandle) {
        if let Some(entry) = self.lock().in_flight.get_mut(&account_id) {
            *entry = Some(handle);
        }
    }

    /// Queues a manual request; duplicates collapse into one.
    pub fn defer(&self, account_id: Uuid) {
        let mut state = self.lock();
        if !state.pending.contains(&account_id) {
            state.pending.push_back(account_id);
        }
    }

    pub fn take_pending(&self) -> VecDeque<Uuid> {
        std::mem::take(&mut self.lock().pending)
    }

    /// In-flight accounts, last runs and free capacity, read in one go.
    pub fn dispatch_view(&self) -> (HashSet<Uuid>, HashMap<Uuid, DateTime<Utc>>, usize) {
        let state = self.lock();
        let in_flight: HashSet<Uuid> = state.in_flight.keys().copied().collect();
        let capacity = self
            .config
            .max_concurrent_accounts
            .saturating_sub(in_flight.len());
        (in_flight, state.last_runs.clone(), capacity)
    }

    /// Aborts every worker still registered. Returns how many were aborted.
    pub fn abort_in_flight(&self) -> usize {
        let state = self.lock();
        let mut aborted = 0;
        for (account_id, handle) in state.in_flight.iter() {
            if let Some(handle) = handle {
                warn!("⚠️  Abandoning worker for account {}", account_id);
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Moves the service into the error state after an invariant violation.
    pub fn fail(&self, message: &str) {
        let mut state = self.lock();
        if matches!(state.lifecycle, LifecycleState::Running | LifecycleState::Starting) {
            state.lifecycle = LifecycleState::Error(message.to_string());
            state.cancel.cancel();
        }
    }
}

/// Ownership of one account's in-flight entry.
///
/// Dropping the slot releases the account, whether the worker finished or
/// was aborted; an unfinished slot counts as a failed run.
pub(crate) struct WorkerSlot {
    ctx: Arc<Context>,
    account_id: Uuid,
    emails_processed: Option<usize>,
}

impl WorkerSlot {
    pub fn finish(mut self, emails_processed: usize) {
        self.emails_processed = Some(emails_processed);
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.emails_processed.is_none() {
            warn!("Worker for account {} was abandoned before completing", self.account_id);
            self.ctx.status.record_error(
                Some(self.account_id),
                &ProcessingError::Timeout(self.ctx.config.drain_timeout_seconds),
            );
        }
        // the gauge drops before the slot is released, so it never exceeds
        // the number of in-flight accounts
        self.ctx.status.worker_finished(self.emails_processed.unwrap_or(0));

        let wake = {
            let mut state = self.ctx.lock();
            state.in_flight.remove(&self.account_id);
            state.last_runs.insert(self.account_id, Utc::now());
            !state.pending.is_empty()
        };
        if wake {
            self.ctx.wake.notify_one();
        }
    }
}
