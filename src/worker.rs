use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{ProcessingError, Result};
use crate::mail::{apply_action, MailClient, MailConnection, MailMessage};
use crate::matcher;
use crate::model::{Account, Feed, FeedItem, PostAction, Rule, Watermark};
use crate::retention::RetentionManager;
use crate::retry::RetryPolicy;
use crate::storage::Repository;

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a run stopped before draining every folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EmailLimit,
    TimeBudget,
}

/// Outcome of one account run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub account_id: Uuid,
    /// Connection attempts, the first one included.
    pub attempts: u32,
    pub messages_seen: usize,
    pub items_created: usize,
    pub actions_applied: usize,
    pub stopped_early: Option<StopReason>,
    pub watermark_advanced: bool,
    /// Errors the run recovered from: retried attempts, failed actions and
    /// failed insertions.
    pub errors: Vec<ProcessingError>,
    /// The error that ended the run, if any.
    pub failure: Option<ProcessingError>,
}

impl RunReport {
    fn new(account_id: Uuid) -> Self {
        RunReport {
            account_id,
            attempts: 0,
            messages_seen: 0,
            items_created: 0,
            actions_applied: 0,
            stopped_early: None,
            watermark_advanced: false,
            errors: Vec::new(),
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

struct RulePlan {
    rule: Rule,
    feeds: Vec<Feed>,
    action: PostAction,
}

struct FolderPlan {
    folder: String,
    rules: Vec<RulePlan>,
}

/// Work carried across the attempts of one run, so a retry neither
/// re-lists nor re-applies what an earlier attempt finished.
struct RunProgress {
    cursor: Watermark,
    handled: HashSet<(String, u32)>,
    counted: usize,
}

/// What became of one fetched message.
#[derive(Debug, PartialEq, Eq)]
enum Handling {
    /// Fully handled; the cursor may move past it.
    Done,
    /// Must be fetched again by a later run.
    Retry,
    /// The run's deadline passed before its action finished.
    OutOfTime,
}

/// Processes one account from connection to watermark.
///
/// The worker does not guard against concurrent runs of the same account;
/// the scheduler's reservation does.
pub struct AccountWorker<'a> {
    config: &'a ServiceConfig,
    repo: &'a dyn Repository,
    mail: &'a dyn MailClient,
    retention: &'a RetentionManager,
}

impl<'a> AccountWorker<'a> {
    pub fn new(
        config: &'a ServiceConfig,
        repo: &'a dyn Repository,
        mail: &'a dyn MailClient,
        retention: &'a RetentionManager,
    ) -> Self {
        AccountWorker {
            config,
            repo,
            mail,
            retention,
        }
    }

    pub async fn run(&self, account: &Account, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::new(account.id);
        let deadline = Instant::now() + self.config.processing_budget();

        if let Err(e) = self.run_until(account, cancel, deadline, &mut report).await {
            report.failure = Some(e);
        }
        report
    }

    async fn run_until(
        &self,
        account: &Account,
        cancel: &CancellationToken,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<()> {
        account.validate()?;

        let plan = self.load_plan(account).await?;
        if plan.is_empty() {
            debug!("No active rule with a feed for account '{}'", account.name);
            return Ok(());
        }

        let stored = self.repo.load_watermark(account.id).await?;
        let mut progress = RunProgress {
            cursor: stored.clone(),
            handled: HashSet::new(),
            counted: 0,
        };
        let policy = RetryPolicy::from(&self.config.retry);
        let mut retries = 0;

        loop {
            report.attempts += 1;
            // a failed attempt keeps its progress in memory only
            let error = match self
                .attempt(account, &plan, &mut progress, cancel, deadline, report)
                .await
            {
                Ok(()) => {
                    self.repo.save_watermark(account.id, &progress.cursor).await?;
                    report.watermark_advanced = progress.cursor != stored;
                    return Ok(());
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            let delay = match policy.next_delay(retries) {
                Some(delay) if Instant::now() + delay < deadline => delay,
                _ => return Err(error),
            };
            retries += 1;
            warn!(
                "🔁 Attempt {} for account '{}' failed ({}), retrying in {:?}",
                report.attempts, account.name, error, delay
            );
            report.errors.push(error);

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }

    /// Active rules with at least one active feed, grouped by folder in rule
    /// order, each with its action already resolved.
    async fn load_plan(&self, account: &Account) -> Result<Vec<FolderPlan>> {
        let mut plan: Vec<FolderPlan> = Vec::new();

        for rule in self.repo.rules_for_account(account.id).await? {
            if !rule.active {
                continue;
            }
            let feeds: Vec<Feed> = self
                .repo
                .feeds_for_rule(rule.id)
                .await?
                .into_iter()
                .filter(|f| f.active)
                .collect();
            if feeds.is_empty() {
                continue;
            }
            let action = matcher::resolve_action(&rule, account)?;

            let rule_plan = RulePlan { rule, feeds, action };
            match plan.iter_mut().find(|f| f.folder == rule_plan.rule.folder) {
                Some(folder) => folder.rules.push(rule_plan),
                None => plan.push(FolderPlan {
                    folder: rule_plan.rule.folder.clone(),
                    rules: vec![rule_plan],
                }),
            }
        }
        Ok(plan)
    }

    async fn attempt(
        &self,
        account: &Account,
        plan: &[FolderPlan],
        progress: &mut RunProgress,
        cancel: &CancellationToken,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<()> {
        let connection = tokio::select! {
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            connected = timeout_at(deadline, self.mail.connect(account)) => match connected {
                Ok(connection) => connection?,
                Err(_) => return Err(ProcessingError::Timeout(self.config.limits.max_processing_time_seconds)),
            },
        };

        let outcome = self
            .drain_folders(account, &*connection, plan, progress, cancel, deadline, report)
            .await;

        match timeout(LOGOUT_TIMEOUT, connection.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Logout failed for account '{}': {}", account.name, e),
            Err(_) => debug!("Logout timed out for account '{}'", account.name),
        }
        outcome
    }

    /// Walks every folder of the plan, moving the cursor in `progress` as
    /// messages are fully handled.
    #[allow(clippy::too_many_arguments)]
    async fn drain_folders(
        &self,
        account: &Account,
        connection: &dyn MailConnection,
        plan: &[FolderPlan],
        progress: &mut RunProgress,
        cancel: &CancellationToken,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Result<()> {
        let limit = self.config.limits.max_emails_per_run;
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.limits.max_email_age_days));
        let batch_size = self.config.batch_size.max(1);

        'folders: for folder in plan {
            let remaining = limit.saturating_sub(progress.counted);
            if remaining == 0 {
                report.stopped_early = Some(StopReason::EmailLimit);
                break;
            }

            let since = progress.cursor.for_folder(&folder.folder);
            let listing = connection.list_messages(&folder.folder, since, cutoff, remaining);
            let stream = match timeout_at(deadline, listing).await {
                Ok(listed) => listed?,
                Err(_) => {
                    report.stopped_early = Some(StopReason::TimeBudget);
                    break;
                }
            };
            let mut batches = stream.chunks(batch_size);
            // the cursor stops at the first message that was not fully handled
            let mut cursor_open = true;

            loop {
                if cancel.is_cancelled() {
                    return Err(ProcessingError::Cancelled);
                }
                let batch = match timeout_at(deadline, batches.next()).await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(_) => {
                        report.stopped_early = Some(StopReason::TimeBudget);
                        break 'folders;
                    }
                };

                for fetched in batch {
                    let message = fetched?;
                    if Instant::now() >= deadline {
                        report.stopped_early = Some(StopReason::TimeBudget);
                        break 'folders;
                    }

                    let key = (folder.folder.clone(), message.uid);
                    let handling = if progress.handled.contains(&key) {
                        Handling::Done
                    } else if message.date < cutoff {
                        debug!("Skipping {} (older than the age limit)", message.message_id);
                        Handling::Done
                    } else {
                        progress.counted += 1;
                        report.messages_seen += 1;
                        self.handle_message(account, connection, folder, &message, deadline, report)
                            .await
                    };

                    match handling {
                        Handling::Done => {
                            progress.handled.insert(key);
                            if cursor_open {
                                progress.cursor.advance(&folder.folder, message.uid);
                            }
                        }
                        Handling::Retry => cursor_open = false,
                        Handling::OutOfTime => {
                            report.stopped_early = Some(StopReason::TimeBudget);
                            break 'folders;
                        }
                    }
                }
            }

            if progress.counted >= limit {
                report.stopped_early = Some(StopReason::EmailLimit);
            }
        }

        if let Some(reason) = report.stopped_early {
            info!(
                "⏱️  Run for account '{}' stopped early ({:?}) after {} message(s)",
                account.name, reason, report.messages_seen
            );
        }
        Ok(())
    }

    async fn handle_message(
        &self,
        account: &Account,
        connection: &dyn MailConnection,
        folder: &FolderPlan,
        message: &MailMessage,
        deadline: Instant,
        report: &mut RunReport,
    ) -> Handling {
        let matched: Vec<&RulePlan> = folder
            .rules
            .iter()
            .filter(|plan| matcher::matches(&plan.rule, message))
            .collect();
        let Some(first) = matched.first() else {
            return Handling::Done;
        };

        let mut stored = true;
        for plan in &matched {
            for feed in &plan.feeds {
                let item = feed_item(feed, message);
                match self.retention.ingest(self.repo, feed, &item).await {
                    Ok(true) => {
                        debug!("New item for feed '{}' from {}", feed.title, message.message_id);
                        report.items_created += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to store {} in feed '{}': {}", message.message_id, feed.title, e);
                        report.errors.push(e);
                        stored = false;
                    }
                }
            }
        }
        // the action waits until every item is stored
        if !stored {
            return Handling::Retry;
        }

        if first.action != PostAction::None {
            match timeout_at(deadline, apply_action(connection, message, &first.action)).await {
                Ok(Ok(())) => report.actions_applied += 1,
                Ok(Err(e)) => {
                    warn!(
                        "Action {:?} failed for {} on account '{}': {}",
                        first.action, message.message_id, account.name, e
                    );
                    report.errors.push(e);
                }
                Err(_) => {
                    debug!("Out of time before {:?} finished for {}", first.action, message.message_id);
                    return Handling::OutOfTime;
                }
            }
        }
        Handling::Done
    }
}

fn feed_item(feed: &Feed, message: &MailMessage) -> FeedItem {
    let title = if message.subject.trim().is_empty() {
        "(no subject)".to_string()
    } else {
        message.subject.clone()
    };
    FeedItem {
        id: Uuid::new_v4(),
        feed_id: feed.id,
        dedupe_key: message.dedupe_key().to_string(),
        title,
        author: message.from.clone(),
        summary: message.summary(),
        content: message.body.clone(),
        published_at: message.date,
        ingested_at: Utc::now(),
    }
}
