use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{sort_newest_first, Repository};
use crate::error::{ProcessingError, Result};
use crate::model::{Account, Feed, FeedItem, Rule, Watermark};

#[derive(Default)]
struct Store {
    accounts: Vec<Account>,
    rules: Vec<Rule>,
    feeds: Vec<Feed>,
    items: HashMap<Uuid, Vec<FeedItem>>,
    watermarks: HashMap<Uuid, Watermark>,
}

/// Repository kept entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
    listing_delay: Mutex<Option<Duration>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied before `list_accounts` answers.
    pub fn set_listing_delay(&self, delay: Option<Duration>) {
        *self.listing_delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }
}

fn upsert<T, F>(rows: &mut Vec<T>, row: &T, same: F)
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    match rows.iter_mut().find(|r| same(r)) {
        Some(existing) => *existing = row.clone(),
        None => rows.push(row.clone()),
    }
}

impl Repository for MemoryRepository {
    fn list_accounts(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let delay = *self.listing_delay.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.store.read().await.accounts.clone())
        })
    }

    fn get_account(&self, id: Uuid) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let store = self.store.read().await;
            Ok(store.accounts.iter().find(|a| a.id == id).cloned())
        })
    }

    fn save_account<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            account.validate()?;
            let mut store = self.store.write().await;
            upsert(&mut store.accounts, account, |a| a.id == account.id);
            Ok(())
        })
    }

    fn delete_account(&self, id: Uuid) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut store = self.store.write().await;
            let before = store.accounts.len();
            store.accounts.retain(|a| a.id != id);
            if store.accounts.len() == before {
                return Ok(false);
            }

            let rule_ids: Vec<Uuid> = store
                .rules
                .iter()
                .filter(|r| r.account_id == id)
                .map(|r| r.id)
                .collect();
            store.rules.retain(|r| r.account_id != id);

            let feed_ids: Vec<Uuid> = store
                .feeds
                .iter()
                .filter(|f| rule_ids.contains(&f.rule_id))
                .map(|f| f.id)
                .collect();
            store.feeds.retain(|f| !rule_ids.contains(&f.rule_id));
            for feed_id in feed_ids {
                store.items.remove(&feed_id);
            }
            store.watermarks.remove(&id);
            Ok(true)
        })
    }

    fn rules_for_account(&self, account_id: Uuid) -> BoxFuture<'_, Result<Vec<Rule>>> {
        Box::pin(async move {
            let store = self.store.read().await;
            Ok(store
                .rules
                .iter()
                .filter(|r| r.account_id == account_id)
                .cloned()
                .collect())
        })
    }

    fn save_rule<'a>(&'a self, rule: &'a Rule) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            rule.validate()?;
            let mut store = self.store.write().await;
            if !store.accounts.iter().any(|a| a.id == rule.account_id) {
                return Err(ProcessingError::Config(format!(
                    "rule '{}' references unknown account {}",
                    rule.name, rule.account_id
                )));
            }
            upsert(&mut store.rules, rule, |r| r.id == rule.id);
            Ok(())
        })
    }

    fn feeds_for_rule(&self, rule_id: Uuid) -> BoxFuture<'_, Result<Vec<Feed>>> {
        Box::pin(async move {
            let store = self.store.read().await;
            Ok(store.feeds.iter().filter(|f| f.rule_id == rule_id).cloned().collect())
        })
    }

    fn save_feed<'a>(&'a self, feed: &'a Feed) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            feed.validate()?;
            let mut store = self.store.write().await;
            if !store.rules.iter().any(|r| r.id == feed.rule_id) {
                return Err(ProcessingError::Config(format!(
                    "feed '{}' references unknown rule {}",
                    feed.title, feed.rule_id
                )));
            }
            upsert(&mut store.feeds, feed, |f| f.id == feed.id);
            Ok(())
        })
    }

    fn insert_item_if_absent<'a>(&'a self, item: &'a FeedItem) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut store = self.store.write().await;
            if !store.feeds.iter().any(|f| f.id == item.feed_id) {
                return Err(ProcessingError::Storage(format!("unknown feed {}", item.feed_id)));
            }
            let items = store.items.entry(item.feed_id).or_default();
            if items.iter().any(|i| i.dedupe_key == item.dedupe_key) {
                return Ok(false);
            }
            items.push(item.clone());
            Ok(true)
        })
    }

    fn list_items(&self, feed_id: Uuid) -> BoxFuture<'_, Result<Vec<FeedItem>>> {
        Box::pin(async move {
            let store = self.store.read().await;
            let mut items = store.items.get(&feed_id).cloned().unwrap_or_default();
            sort_newest_first(&mut items);
            Ok(items)
        })
    }

    fn delete_items<'a>(&'a self, feed_id: Uuid, ids: &'a [Uuid]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut store = self.store.write().await;
            let items = match store.items.get_mut(&feed_id) {
                Some(items) => items,
                None => return Ok(0),
            };
            let before = items.len();
            items.retain(|i| !ids.contains(&i.id));
            Ok(before - items.len())
        })
    }

    fn load_watermark(&self, account_id: Uuid) -> BoxFuture<'_, Result<Watermark>> {
        Box::pin(async move {
            let store = self.store.read().await;
            Ok(store.watermarks.get(&account_id).cloned().unwrap_or_default())
        })
    }

    fn save_watermark<'a>(&'a self, account_id: Uuid, watermark: &'a Watermark) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.store
                .write()
                .await
                .watermarks
                .insert(account_id, watermark.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedFormat, RetentionPolicy};
    use chrono::Utc;

    fn item(feed_id: Uuid, key: &str) -> FeedItem {
        FeedItem {
            id: Uuid::new_v4(),
            feed_id,
            dedupe_key: key.to_string(),
            title: key.to_string(),
            author: "a@example.org".to_string(),
            summary: String::new(),
            content: String::new(),
            published_at: Utc::now(),
            ingested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_and_cascade() {
        let repo = MemoryRepository::new();
        let account = Account::new("list", "imap.example.com", "me", "secret");
        repo.save_account(&account).await.unwrap();
        let rule = Rule::new(account.id, "rust", "INBOX").with_label("rust");
        repo.save_rule(&rule).await.unwrap();
        let feed = Feed::new(rule.id, "rust", FeedFormat::Atom, RetentionPolicy::default());
        repo.save_feed(&feed).await.unwrap();

        assert!(repo.insert_item_if_absent(&item(feed.id, "m1")).await.unwrap());
        assert!(!repo.insert_item_if_absent(&item(feed.id, "m1")).await.unwrap());
        assert_eq!(repo.list_items(feed.id).await.unwrap().len(), 1);

        let mut mark = Watermark::default();
        mark.advance("INBOX", 3);
        repo.save_watermark(account.id, &mark).await.unwrap();

        assert!(repo.delete_account(account.id).await.unwrap());
        assert!(repo.rules_for_account(account.id).await.unwrap().is_empty());
        assert!(repo.feeds_for_rule(rule.id).await.unwrap().is_empty());
        assert!(repo.list_items(feed.id).await.unwrap().is_empty());
        assert_eq!(repo.load_watermark(account.id).await.unwrap(), Watermark::default());
        assert!(!repo.delete_account(account.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_validates() {
        let repo = MemoryRepository::new();
        let account = Account::new("list", "imap.example.com", "me", "secret");
        let orphan = Rule::new(account.id, "orphan", "INBOX").with_to("a@x.com");
        assert!(matches!(repo.save_rule(&orphan).await, Err(ProcessingError::Config(_))));

        repo.save_account(&account).await.unwrap();
        let no_predicate = Rule::new(account.id, "none", "INBOX");
        assert!(repo.save_rule(&no_predicate).await.is_err());
    }
}
