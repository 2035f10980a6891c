//! Feed retention: decides which items a feed drops after an insertion and
//! serializes mutations per feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Feed, FeedItem, RetentionPolicy};
use crate::storage::Repository;

/// Ids of the items to evict from a newest-first list.
///
/// The newest `min_items` always stay. Of the rest, items older than
/// `max_age_days` go first, then the oldest survivors until at most
/// `max_items` remain.
pub fn plan_eviction(items: &[FeedItem], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Uuid> {
    let min_items = policy.min_items.min(policy.max_items) as usize;
    let max_items = policy.max_items as usize;

    let protected = items.len().min(min_items);
    let cutoff = policy
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)));

    let (young, expired): (Vec<&FeedItem>, Vec<&FeedItem>) = items[protected..]
        .iter()
        .partition(|item| cutoff.map_or(true, |cutoff| item.published_at >= cutoff));

    let mut evicted: Vec<Uuid> = expired.iter().map(|item| item.id).collect();

    let surviving = protected + young.len();
    if surviving > max_items {
        let excess = surviving - max_items;
        // young is newest-first, so its tail holds the oldest survivors
        evicted.extend(young[young.len() - excess..].iter().map(|item| item.id));
    }

    evicted
}

/// Applies retention after insertions, one feed at a time.
#[derive(Default)]
pub struct RetentionManager {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RetentionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn feed_lock(&self, feed_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(feed_id).or_default())
    }

    /// Inserts the item unless its dedupe key is already present, then
    /// enforces the feed's retention. Returns whether the item was new.
    pub async fn ingest(&self, repo: &dyn Repository, feed: &Feed, item: &FeedItem) -> Result<bool> {
        let lock = self.feed_lock(feed.id);
        let _guard = lock.lock().await;

        let inserted = repo.insert_item_if_absent(item).await?;
        if inserted {
            self.evict(repo, feed).await?;
        }
        Ok(inserted)
    }

    /// Enforces retention on a feed. Returns the number of evicted items.
    pub async fn enforce(&self, repo: &dyn Repository, feed: &Feed) -> Result<usize> {
        let lock = self.feed_lock(feed.id);
        let _guard = lock.lock().await;
        self.evict(repo, feed).await
    }

    async fn evict(&self, repo: &dyn Repository, feed: &Feed) -> Result<usize> {
        let items = repo.list_items(feed.id).await?;
        let evicted = plan_eviction(&items, &feed.retention, Utc::now());
        if evicted.is_empty() {
            return Ok(0);
        }
        let removed = repo.delete_items(feed.id, &evicted).await?;
        debug!("Retention removed {} item(s) from feed '{}'", removed, feed.title);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(ages_in_days: &[i64], now: DateTime<Utc>) -> Vec<FeedItem> {
        // callers pass ages newest first
        ages_in_days
            .iter()
            .enumerate()
            .map(|(i, age)| FeedItem {
                id: Uuid::new_v4(),
                feed_id: Uuid::nil(),
                dedupe_key: format!("m{}", i),
                title: format!("item {}", i),
                author: String::new(),
                summary: String::new(),
                content: String::new(),
                published_at: now - Duration::days(*age) - Duration::minutes(i as i64),
                ingested_at: now,
            })
            .collect()
    }

    fn survivors(items: &[FeedItem], evicted: &[Uuid]) -> Vec<String> {
        items
            .iter()
            .filter(|i| !evicted.contains(&i.id))
            .map(|i| i.dedupe_key.clone())
            .collect()
    }

    #[test]
    fn test_all_expired_keeps_min_items() {
        let now = Utc::now();
        let list = items(&[40; 12], now);
        let policy = RetentionPolicy { max_items: 10, min_items: 2, max_age_days: Some(30) };

        let evicted = plan_eviction(&list, &policy, now);
        assert_eq!(evicted.len(), 10);
        assert_eq!(survivors(&list, &evicted), vec!["m0", "m1"]);
    }

    #[test]
    fn test_count_cap_after_age() {
        let now = Utc::now();
        let list = items(&[1, 2, 3, 4, 5, 6, 50], now);
        let policy = RetentionPolicy { max_items: 4, min_items: 1, max_age_days: Some(30) };

        let evicted = plan_eviction(&list, &policy, now);
        assert_eq!(survivors(&list, &evicted), vec!["m0", "m1", "m2", "m3"]);
    }

    #[test]
    fn test_no_age_limit() {
        let now = Utc::now();
        let list = items(&[400, 500, 600], now);
        let policy = RetentionPolicy { max_items: 5, min_items: 0, max_age_days: None };
        assert!(plan_eviction(&list, &policy, now).is_empty());
    }

    #[tokio::test]
    async fn test_ingest_dedupes_and_trims() {
        use crate::model::{Account, FeedFormat, Rule};
        use crate::storage::MemoryRepository;

        let repo = MemoryRepository::new();
        let account = Account::new("lists", "imap.example.com", "me", "secret");
        repo.save_account(&account).await.unwrap();
        let rule = Rule::new(account.id, "r", "INBOX").with_to("a@x.com");
        repo.save_rule(&rule).await.unwrap();
        let policy = RetentionPolicy { max_items: 3, min_items: 1, max_age_days: None };
        let feed = Feed::new(rule.id, "f", FeedFormat::Rss, policy);
        repo.save_feed(&feed).await.unwrap();

        let manager = RetentionManager::new();
        let now = Utc::now();
        for mut item in items(&[1, 2, 3, 4, 5], now).into_iter().rev() {
            item.feed_id = feed.id;
            assert!(manager.ingest(&repo, &feed, &item).await.unwrap());
            assert!(!manager.ingest(&repo, &feed, &item).await.unwrap());
        }

        let kept = repo.list_items(feed.id).await.unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].dedupe_key, "m0");
        assert_eq!(manager.enforce(&repo, &feed).await.unwrap(), 0);
    }

    #[test]
    fn test_bounds_hold_for_any_length() {
        let now = Utc::now();
        let policy = RetentionPolicy { max_items: 6, min_items: 3, max_age_days: Some(10) };
        for len in 0..20usize {
            let ages: Vec<i64> = (0..len as i64).map(|i| i * 2).collect();
            let list = items(&ages, now);
            let evicted = plan_eviction(&list, &policy, now);
            let kept: Vec<&FeedItem> = list.iter().filter(|i| !evicted.contains(&i.id)).collect();

            assert!(kept.len() <= 6);
            assert!(kept.len() >= len.min(3));
            let cutoff = now - Duration::days(10);
            assert!(kept.len() <= 3 || kept.iter().all(|i| i.published_at >= cutoff));
        }
    }
}
