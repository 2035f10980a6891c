//! Scriptable in-memory mail server.
//!
//! Holds per-account folders, can be told to fail connections, slow down
//! fetches or reject actions, and records what was done to each message.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use uuid::Uuid;

use super::{MailClient, MailConnection, MailMessage, MessageStream};
use crate::error::{ProcessingError, Result};
use crate::model::{Account, PostAction};

#[derive(Default)]
struct ServerState {
    folders: HashMap<Uuid, HashMap<String, Vec<MailMessage>>>,
    connect_failures: HashMap<Uuid, VecDeque<ProcessingError>>,
    connect_log: HashMap<Uuid, Vec<Instant>>,
    open: HashMap<Uuid, usize>,
    max_open_per_account: HashMap<Uuid, usize>,
    open_total: usize,
    max_open_total: usize,
    actions: Vec<(Uuid, String, PostAction)>,
    failing_actions: bool,
    fetch_delay: Option<Duration>,
    action_delay: Option<Duration>,
    listing_failures: HashMap<Uuid, VecDeque<(usize, ProcessingError)>>,
}

#[derive(Clone, Default)]
pub struct MemoryMailServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryMailServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.state)
    }

    pub fn deliver(&self, account_id: Uuid, message: MailMessage) {
        let mut state = self.lock();
        let folder = state
            .folders
            .entry(account_id)
            .or_default()
            .entry(message.folder.clone())
            .or_default();
        folder.push(message);
        folder.sort_by_key(|m| m.uid);
    }

    /// The next `times` connection attempts for the account fail with `error`.
    pub fn fail_connect(&self, account_id: Uuid, error: ProcessingError, times: usize) {
        let mut state = self.lock();
        let queue = state.connect_failures.entry(account_id).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_actions(&self, failing: bool) {
        self.lock().failing_actions = failing;
    }

    /// Delay applied before each message is yielded.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    /// Delay applied before each action takes effect.
    pub fn set_action_delay(&self, delay: Option<Duration>) {
        self.lock().action_delay = delay;
    }

    /// The next listing for the account yields `after` messages and then
    /// fails with `error`, as a dropped connection would.
    pub fn break_listing_after(&self, account_id: Uuid, after: usize, error: ProcessingError) {
        let mut state = self.lock();
        state
            .listing_failures
            .entry(account_id)
            .or_default()
            .push_back((after, error));
    }

    pub fn connect_attempts(&self, account_id: Uuid) -> u32 {
        self.connect_times(account_id).len() as u32
    }

    /// When each connection attempt for the account happened.
    pub fn connect_times(&self, account_id: Uuid) -> Vec<Instant> {
        self.lock().connect_log.get(&account_id).cloned().unwrap_or_default()
    }

    /// Applied actions as `(account, message id, action)`.
    pub fn actions(&self) -> Vec<(Uuid, String, PostAction)> {
        self.lock().actions.clone()
    }

    pub fn messages(&self, account_id: Uuid, folder: &str) -> Vec<MailMessage> {
        self.lock()
            .folders
            .get(&account_id)
            .and_then(|f| f.get(folder))
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneous sessions ever seen for one account.
    pub fn max_open_sessions(&self, account_id: Uuid) -> usize {
        self.lock().max_open_per_account.get(&account_id).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous sessions across all accounts.
    pub fn max_open_total(&self) -> usize {
        self.lock().max_open_total
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_total
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MailClient for MemoryMailServer {
    fn connect<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Box<dyn MailConnection>>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.connect_log.entry(account.id).or_default().push(Instant::now());

            if let Some(error) = state
                .connect_failures
                .get_mut(&account.id)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }

            let open = state.open.entry(account.id).or_insert(0);
            *open += 1;
            let open = *open;
            let max = state.max_open_per_account.entry(account.id).or_insert(0);
            *max = (*max).max(open);
            state.open_total += 1;
            state.max_open_total = state.max_open_total.max(state.open_total);

            Ok(Box::new(MemoryConnection {
                account_id: account.id,
                state: Arc::clone(&self.state),
            }) as Box<dyn MailConnection>)
        })
    }
}

struct MemoryConnection {
    account_id: Uuid,
    state: Arc<Mutex<ServerState>>,
}

impl MemoryConnection {
    async fn act(&self, message: &MailMessage, action: PostAction) -> Result<()> {
        let delay = lock(&self.state).action_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(message, action)
    }

    fn record(&self, message: &MailMessage, action: PostAction) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_actions {
            return Err(ProcessingError::Protocol(format!(
                "action rejected for {}",
                message.message_id
            )));
        }
        state
            .actions
            .push((self.account_id, message.message_id.clone(), action.clone()));

        let folders = state.folders.entry(self.account_id).or_default();
        match action {
            PostAction::Delete => {
                if let Some(folder) = folders.get_mut(&message.folder) {
                    folder.retain(|m| m.uid != message.uid);
                }
            }
            PostAction::Move(target) => {
                let moved = folders.get_mut(&message.folder).and_then(|folder| {
                    let index = folder.iter().position(|m| m.uid == message.uid)?;
                    Some(folder.remove(index))
                });
                if let Some(mut moved) = moved {
                    let destination = folders.entry(target.clone()).or_default();
                    moved.uid = destination.last().map(|m| m.uid + 1).unwrap_or(1);
                    moved.folder = target;
                    destination.push(moved);
                }
            }
            PostAction::None | PostAction::MarkRead => {}
        }
        Ok(())
    }
}

impl MailConnection for MemoryConnection {
    fn list_messages<'a>(
        &'a self,
        folder: &'a str,
        since_uid: Option<u32>,
        received_since: DateTime<Utc>,
        max_count: usize,
    ) -> BoxFuture<'a, Result<MessageStream>> {
        Box::pin(async move {
            let (listed, delay) = {
                let mut state = lock(&self.state);
                let mut listed: Vec<Result<MailMessage>> = state
                    .folders
                    .get(&self.account_id)
                    .and_then(|f| f.get(folder))
                    .map(|msgs| {
                        msgs.iter()
                            .filter(|m| since_uid.map_or(true, |since| m.uid > since))
                            .filter(|m| m.date >= received_since)
                            .take(max_count)
                            .cloned()
                            .map(Ok)
                            .collect()
                    })
                    .unwrap_or_default();
                let broken = state
                    .listing_failures
                    .get_mut(&self.account_id)
                    .and_then(VecDeque::pop_front);
                if let Some((after, error)) = broken {
                    listed.truncate(after);
                    listed.push(Err(error));
                }
                (listed, state.fetch_delay)
            };

            let stream = stream::iter(listed).then(move |fetched| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                fetched
            });
            Ok(stream.boxed())
        })
    }

    fn mark_read<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.act(message, PostAction::MarkRead))
    }

    fn delete<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.act(message, PostAction::Delete))
    }

    fn move_to<'a>(&'a self, message: &'a MailMessage, folder: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.act(message, PostAction::Move(folder.to_string())))
    }

    fn logout(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(open) = state.open.get_mut(&self.account_id) {
            *open = open.saturating_sub(1);
        }
        state.open_total = state.open_total.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_respects_cursor_and_limit() {
        let server = MemoryMailServer::new();
        let account = Account::new("list", "imap.example.com", "me", "secret");
        for uid in 1..=5 {
            server.deliver(account.id, MailMessage::new(uid, "INBOX", &format!("m{}", uid)));
        }

        let conn = server.connect(&account).await.unwrap();
        let listed: Vec<u32> = conn
            .list_messages("INBOX", Some(2), Utc::now() - chrono::Duration::days(1), 2)
            .await
            .unwrap()
            .map(|m| m.unwrap().uid)
            .collect()
            .await;
        assert_eq!(listed, vec![3, 4]);
        assert_eq!(server.open_sessions(), 1);

        conn.logout().await.unwrap();
        assert_eq!(server.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let server = MemoryMailServer::new();
        let account = Account::new("list", "imap.example.com", "me", "secret");
        server.fail_connect(account.id, ProcessingError::Connection("refused".into()), 2);

        assert!(server.connect(&account).await.is_err());
        assert!(server.connect(&account).await.is_err());
        assert!(server.connect(&account).await.is_ok());
        assert_eq!(server.connect_attempts(account.id), 3);
    }
}
