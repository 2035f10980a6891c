//! Persistence boundary for accounts, rules, feeds, feed items and watermarks.

pub mod memory;
pub mod postgres;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Account, Feed, FeedItem, Rule, Watermark};

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

pub trait Repository: Send + Sync {
    fn list_accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>>;

    fn get_account(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Account>>>;

    /// Validates and inserts or replaces an account.
    fn save_account<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>>;

    /// Removes the account with its rules, feeds, items and watermark.
    fn delete_account(&self, id: Uuid) -> BoxFuture<'_, Result<bool>>;

    /// Rules of an account in creation order.
    fn rules_for_account(&self, account_id: Uuid) -> BoxFuture<'_, Result<Vec<Rule>>>;

    fn save_rule<'a>(&'a self, rule: &'a Rule) -> BoxFuture<'a, Result<()>>;

    fn feeds_for_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Vec<Feed>>>;

    fn save_feed<'a>(&'a self, feed: &'a Feed) -> BoxFuture<'a, Result<()>>;

    /// Inserts unless the feed already holds an item with the same dedupe key.
    /// Returns whether a row was written.
    fn insert_item_if_absent<'a>(&'a self, item: &'a FeedItem) -> BoxFuture<'a, Result<bool>>;

    /// Items of a feed, newest first.
    fn list_items(&self, feed_id: Uuid) -> BoxFuture<'_, Result<Vec<FeedItem>>>;

    fn delete_items<'a>(&'a self, feed_id: Uuid, ids: &'a [Uuid]) -> BoxFuture<'a, Result<usize>>;

    fn load_watermark(&self, account_id: Uuid) -> BoxFuture<'_, Result<Watermark>>;

    fn save_watermark<'a>(&'a self, account_id: Uuid, watermark: &'a Watermark) -> BoxFuture<'a, Result<()>>;
}

/// Newest-first ordering shared by the repositories.
pub(crate) fn sort_newest_first(items: &mut [FeedItem]) {
    items.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| b.ingested_at.cmp(&a.ingested_at))
    });
}
