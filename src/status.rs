//! Process-wide counters and the status snapshot served to monitoring.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::ProcessingError;

/// Lifecycle of the background service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub account_id: Option<Uuid>,
    pub kind: String,
    pub message: String,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub accounts_count: usize,
    pub active_processing_count: usize,
    pub total_emails_processed: u64,
    pub total_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: LifecycleState,
    pub started_at: Option<DateTime<Utc>>,
    pub accounts_count: usize,
    pub active_processing_count: usize,
    pub total_emails_processed: u64,
    pub total_errors: u64,
    pub uptime_seconds: Option<i64>,
    pub recent_errors: Vec<ErrorRecord>,
    pub last_runs: BTreeMap<Uuid, DateTime<Utc>>,
    pub config: ServiceConfig,
}

/// Counters are plain atomics so that workers never contend with the
/// scheduler's dispatch lock when reporting.
pub struct StatusAggregator {
    accounts_count: AtomicUsize,
    active: AtomicUsize,
    emails_processed: AtomicU64,
    errors: AtomicU64,
    recent_errors: Mutex<VecDeque<ErrorRecord>>,
    max_recent_errors: usize,
}

impl StatusAggregator {
    pub fn new(max_recent_errors: usize) -> Self {
        StatusAggregator {
            accounts_count: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            emails_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::new()),
            max_recent_errors,
        }
    }

    pub fn reset(&self) {
        self.emails_processed.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.recent_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn set_accounts_count(&self, count: usize) {
        self.accounts_count.store(count, Ordering::SeqCst);
    }

    pub fn worker_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// Called once per worker, whatever the outcome.
    pub fn worker_finished(&self, emails_processed: usize) {
        self.emails_processed
            .fetch_add(emails_processed as u64, Ordering::SeqCst);
        // saturating so that a stray double report cannot wrap the gauge
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn record_error(&self, account_id: Option<Uuid>, error: &ProcessingError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if self.max_recent_errors == 0 {
            return;
        }
        let mut recent = self
            .recent_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.push_back(ErrorRecord {
            at: Utc::now(),
            account_id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        while recent.len() > self.max_recent_errors {
            recent.pop_front();
        }
    }

    pub fn counters(&self) -> Counters {
        Counters {
            accounts_count: self.accounts_count.load(Ordering::SeqCst),
            active_processing_count: self.active.load(Ordering::SeqCst),
            total_emails_processed: self.emails_processed.load(Ordering::SeqCst),
            total_errors: self.errors.load(Ordering::SeqCst),
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
