use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use mailfeed::config::ServiceConfig;
use mailfeed::mail::{MailMessage, MemoryMailServer};
use mailfeed::model::{ActionKind, Account, Feed, FeedFormat, PostAction, RetentionPolicy, Rule, Watermark};
use mailfeed::storage::{MemoryRepository, Repository};
use mailfeed::{LifecycleState, ServiceStatus, Supervisor};

struct Harness {
    repo: Arc<MemoryRepository>,
    mail: MemoryMailServer,
    supervisor: Supervisor,
}

impl Harness {
    fn new(config: ServiceConfig) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let mail = MemoryMailServer::new();
        let supervisor = Supervisor::new(config, repo.clone(), Arc::new(mail.clone()));
        Harness { repo, mail, supervisor }
    }

    /// An account with one rule on `list@example.org` feeding one feed.
    async fn add_account(&self, name: &str) -> (Account, Feed) {
        let mut account = Account::new(name, "imap.example.com", name, "secret");
        account.default_action = ActionKind::MarkRead;
        self.repo.save_account(&account).await.unwrap();

        let rule = Rule::new(account.id, name, "INBOX").with_to("list@example.org");
        self.repo.save_rule(&rule).await.unwrap();
        let feed = Feed::new(rule.id, name, FeedFormat::Atom, RetentionPolicy::default());
        self.repo.save_feed(&feed).await.unwrap();
        (account, feed)
    }

    fn deliver(&self, account: &Account, uid: u32, to: &str) {
        self.mail.deliver(
            account.id,
            MailMessage::new(uid, "INBOX", &format!("<{}-{}@example.org>", account.name, uid))
                .from("poster@example.org")
                .to(to)
                .subject(&format!("message {}", uid))
                .dated(Utc::now()),
        );
    }

    async fn wait_for(&self, what: &str, done: impl Fn(&ServiceStatus) -> bool) -> ServiceStatus {
        for _ in 0..2000 {
            let status = self.supervisor.status();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}: {:?}", what, self.supervisor.status());
    }

    async fn wait_for_run(&self, account_id: Uuid) -> ServiceStatus {
        self.wait_for("account run", |s| {
            s.last_runs.contains_key(&account_id) && s.active_processing_count == 0
        })
        .await
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_processing() {
    let h = Harness::new(ServiceConfig::default());
    let (account, feed) = h.add_account("rust").await;
    h.deliver(&account, 1, "list@example.org");
    h.deliver(&account, 2, "someone@example.org");
    h.deliver(&account, 3, "LIST@example.org");

    assert!(h.supervisor.start(false).await.success);
    let status = h.wait_for_run(account.id).await;

    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.accounts_count, 1);
    assert_eq!(status.total_emails_processed, 3);
    assert_eq!(status.total_errors, 0);
    assert_eq!(h.repo.list_items(feed.id).await.unwrap().len(), 2);
    assert_eq!(
        h.repo.load_watermark(account.id).await.unwrap().for_folder("INBOX"),
        Some(3)
    );
    let actions = h.mail.actions();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|(_, _, action)| *action == PostAction::MarkRead));

    // replaying the same messages does not duplicate items
    h.repo
        .save_watermark(account.id, &Watermark::default())
        .await
        .unwrap();
    let previous = status.last_runs[&account.id];
    assert!(h.supervisor.process(account.id).await.success);
    h.wait_for("second run", |s| {
        s.last_runs.get(&account.id) != Some(&previous) && s.active_processing_count == 0
    })
    .await;
    assert_eq!(h.repo.list_items(feed.id).await.unwrap().len(), 2);

    assert!(h.supervisor.stop().await.success);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling_and_account_exclusivity() {
    let config = ServiceConfig { max_concurrent_accounts: 2, ..ServiceConfig::default() };
    let h = Harness::new(config);
    let mut accounts = Vec::new();
    for i in 0..6 {
        let (account, _) = h.add_account(&format!("acct{}", i)).await;
        for uid in 1..=3 {
            h.deliver(&account, uid, "list@example.org");
        }
        accounts.push(account);
    }
    h.mail.set_fetch_delay(Some(Duration::from_millis(200)));

    assert!(h.supervisor.start(false).await.success);
    let result = h.supervisor.process_all().await;
    assert!(result.success, "{}", result.message);
    // asking again while work is queued or running never double-dispatches
    assert!(h.supervisor.process(accounts[0].id).await.success);

    let status = h
        .wait_for("all accounts", |s| {
            accounts.iter().all(|a| s.last_runs.contains_key(&a.id)) && s.active_processing_count == 0
        })
        .await;
    // sessions only exist inside workers
    assert_eq!(h.mail.max_open_total(), 2);
    for account in &accounts {
        assert_eq!(h.mail.max_open_sessions(account.id), 1);
    }
    assert_eq!(status.total_emails_processed, 18);

    h.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deferred_request_runs_when_capacity_frees() {
    let config = ServiceConfig { max_concurrent_accounts: 1, ..ServiceConfig::default() };
    let h = Harness::new(config);
    let (first, _) = h.add_account("first").await;
    let (second, _) = h.add_account("second").await;
    h.deliver(&first, 1, "list@example.org");
    h.deliver(&second, 1, "list@example.org");
    h.mail.set_fetch_delay(Some(Duration::from_secs(1)));

    let began = Instant::now();
    assert!(h.supervisor.start(false).await.success);
    h.wait_for("a worker", |s| s.active_processing_count == 1).await;

    let replies = [
        h.supervisor.process(first.id).await,
        h.supervisor.process(second.id).await,
    ];
    assert!(replies.iter().all(|r| r.success));
    assert!(replies.iter().any(|r| r.message.contains("deferred")));
    assert!(replies.iter().any(|r| r.message.contains("already being processed")));

    h.wait_for("both accounts", |s| {
        s.last_runs.contains_key(&first.id) && s.last_runs.contains_key(&second.id)
    })
    .await;
    // well before the next periodic tick
    assert!(began.elapsed() < ServiceConfig::default().tick_period());

    h.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_run_keeps_watermark() {
    let config = ServiceConfig { batch_size: 2, ..ServiceConfig::default() };
    let h = Harness::new(config);
    let (account, feed) = h.add_account("slow").await;
    for uid in 1..=10 {
        h.deliver(&account, uid, "list@example.org");
    }
    h.mail.set_fetch_delay(Some(Duration::from_millis(500)));

    assert!(h.supervisor.start(false).await.success);
    for _ in 0..100 {
        if !h.repo.list_items(feed.id).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stopped = h.supervisor.stop().await;
    assert!(stopped.success);
    assert!(!stopped.message.contains("abandoned"));

    let status = h.supervisor.status();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert_eq!(status.active_processing_count, 0);

    let items = h.repo.list_items(feed.id).await.unwrap().len();
    assert!(items > 0 && items < 10);
    // the batch in progress was finished
    assert_eq!(items % 2, 0);
    assert_eq!(h.repo.load_watermark(account.id).await.unwrap(), Watermark::default());
}

#[tokio::test(start_paused = true)]
async fn test_stuck_worker_is_abandoned_after_drain_timeout() {
    let config = ServiceConfig { drain_timeout_seconds: 1, ..ServiceConfig::default() };
    let h = Harness::new(config);
    let (account, _) = h.add_account("stuck").await;
    h.deliver(&account, 1, "list@example.org");
    h.mail.set_fetch_delay(Some(Duration::from_secs(120)));

    assert!(h.supervisor.start(false).await.success);
    h.wait_for("a worker", |s| s.active_processing_count == 1).await;

    let stopped = h.supervisor.stop().await;
    assert!(stopped.success);
    assert!(stopped.message.contains("1 worker(s) abandoned"));

    let status = h.supervisor.status();
    assert_eq!(status.state, LifecycleState::Stopped);
    assert_eq!(status.active_processing_count, 0);
    assert!(status.total_errors >= 1);
    assert!(status.recent_errors.iter().any(|e| e.account_id == Some(account.id)));

    // the service can be started again afterwards
    assert!(h.supervisor.start(false).await.success);
    h.supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_during_transition_fail_fast() {
    let h = Harness::new(ServiceConfig::default());
    let (account, _) = h.add_account("busy").await;
    h.deliver(&account, 1, "list@example.org");
    h.mail.set_fetch_delay(Some(Duration::from_secs(10)));

    assert!(h.supervisor.start(false).await.success);
    h.wait_for("a worker", |s| s.active_processing_count == 1).await;

    let stopping = tokio::spawn({
        let supervisor = h.supervisor.clone();
        async move { supervisor.stop().await }
    });
    h.wait_for("stopping", |s| s.state == LifecycleState::Stopping).await;

    let start = h.supervisor.start(false).await;
    assert!(!start.success);
    assert!(start.message.contains("stopping"));
    assert!(!h.supervisor.stop().await.success);
    assert!(!h.supervisor.process(account.id).await.success);

    assert!(stopping.await.unwrap().success);
    assert_eq!(h.supervisor.status().state, LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_failing_account_does_not_affect_others() {
    let h = Harness::new(ServiceConfig::default());
    let (broken, _) = h.add_account("broken").await;
    let (healthy, feed) = h.add_account("healthy").await;
    h.mail.fail_connect(
        broken.id,
        mailfeed::ProcessingError::Config("authentication failed".into()),
        1,
    );
    h.deliver(&healthy, 1, "list@example.org");

    assert!(h.supervisor.start(false).await.success);
    h.wait_for_run(broken.id).await;
    let status = h.wait_for_run(healthy.id).await;

    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.total_errors, 1);
    assert_eq!(status.recent_errors[0].kind, "config");
    assert_eq!(h.repo.list_items(feed.id).await.unwrap().len(), 1);

    h.supervisor.stop().await;
}
