//! Domain records: accounts, rules, feeds and the items they hold.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProcessingError, Result};

/// What to do with a message once it has been turned into feed items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    None,
    MarkRead,
    Delete,
    Move,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::None => "none",
            ActionKind::MarkRead => "mark_read",
            ActionKind::Delete => "delete",
            ActionKind::Move => "move",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(ActionKind::None),
            "mark_read" => Ok(ActionKind::MarkRead),
            "delete" => Ok(ActionKind::Delete),
            "move" => Ok(ActionKind::Move),
            other => Err(ProcessingError::Config(format!("unknown action '{}'", other))),
        }
    }
}

/// A fully resolved post-process action, ready to be applied to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "folder", rename_all = "snake_case")]
pub enum PostAction {
    None,
    MarkRead,
    Delete,
    Move(String),
}

impl PostAction {
    /// Combines an action kind with its target folder.
    pub fn resolve(kind: ActionKind, folder: Option<&str>) -> Result<Self> {
        match kind {
            ActionKind::None => Ok(PostAction::None),
            ActionKind::MarkRead => Ok(PostAction::MarkRead),
            ActionKind::Delete => Ok(PostAction::Delete),
            ActionKind::Move => match folder.map(str::trim).filter(|f| !f.is_empty()) {
                Some(folder) => Ok(PostAction::Move(folder.to_string())),
                None => Err(ProcessingError::Config(
                    "move action requires a target folder".to_string(),
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub default_action: ActionKind,
    pub default_folder: Option<String>,
    /// Overrides the service-wide polling interval for this account.
    pub poll_interval_minutes: Option<u32>,
    pub active: bool,
}

impl Account {
    pub fn new(name: &str, host: &str, username: &str, password: &str) -> Self {
        Account {
            id: Uuid::new_v4(),
            name: name.to_string(),
            host: host.to_string(),
            port: 993,
            username: username.to_string(),
            password: password.to_string(),
            use_tls: true,
            default_action: ActionKind::None,
            default_folder: None,
            poll_interval_minutes: None,
            active: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProcessingError::Config(format!("account '{}' has no host", self.name)));
        }
        if self.port == 0 {
            return Err(ProcessingError::Config(format!("account '{}' has no port", self.name)));
        }
        if self.username.trim().is_empty() {
            return Err(ProcessingError::Config(format!("account '{}' has no username", self.name)));
        }
        if self.poll_interval_minutes == Some(0) {
            return Err(ProcessingError::Config(format!(
                "account '{}' has a zero polling interval",
                self.name
            )));
        }
        PostAction::resolve(self.default_action, self.default_folder.as_deref())?;
        Ok(())
    }
}

/// Selects messages of one folder of an account and routes them to feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub folder: String,
    pub to_address: Option<String>,
    pub from_address: Option<String>,
    pub subject_contains: Option<String>,
    pub label: Option<String>,
    pub active: bool,
    pub action: Option<ActionKind>,
    pub target_folder: Option<String>,
    /// When set, the account defaults win over `action`/`target_folder`.
    pub inherit_defaults: bool,
}

impl Rule {
    pub fn new(account_id: Uuid, name: &str, folder: &str) -> Self {
        Rule {
            id: Uuid::new_v4(),
            account_id,
            name: name.to_string(),
            folder: folder.to_string(),
            to_address: None,
            from_address: None,
            subject_contains: None,
            label: None,
            active: true,
            action: None,
            target_folder: None,
            inherit_defaults: true,
        }
    }

    pub fn with_to(mut self, address: &str) -> Self {
        self.to_address = Some(address.to_string());
        self
    }

    pub fn with_from(mut self, address: &str) -> Self {
        self.from_address = Some(address.to_string());
        self
    }

    pub fn with_subject(mut self, needle: &str) -> Self {
        self.subject_contains = Some(needle.to_string());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_action(mut self, action: ActionKind, target_folder: Option<&str>) -> Self {
        self.action = Some(action);
        self.target_folder = target_folder.map(str::to_string);
        self.inherit_defaults = false;
        self
    }

    /// Non-empty predicate fields, as `(field, value)` pairs.
    pub fn predicates(&self) -> Vec<(&'static str, &str)> {
        [
            ("to_address", self.to_address.as_deref()),
            ("from_address", self.from_address.as_deref()),
            ("subject_contains", self.subject_contains.as_deref()),
            ("label", self.label.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (field, v))
        })
        .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.folder.trim().is_empty() {
            return Err(ProcessingError::Config(format!("rule '{}' has no source folder", self.name)));
        }
        if self.predicates().is_empty() {
            return Err(ProcessingError::Config(format!(
                "rule '{}' must specify at least one of to/from/subject/label",
                self.name
            )));
        }
        if !self.inherit_defaults {
            if let Some(action) = self.action {
                PostAction::resolve(action, self.target_folder.as_deref())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    Rss,
    Atom,
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Rss => "rss",
            FeedFormat::Atom => "atom",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "rss" => Ok(FeedFormat::Rss),
            "atom" => Ok(FeedFormat::Atom),
            other => Err(ProcessingError::Config(format!("unknown feed format '{}'", other))),
        }
    }
}

/// The (max_items, min_items, max_age_days) triple governing eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_items: u32,
    pub min_items: u32,
    /// `None` keeps items regardless of age.
    pub max_age_days: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            max_items: 100,
            min_items: 10,
            max_age_days: Some(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub title: String,
    pub format: FeedFormat,
    pub active: bool,
    pub retention: RetentionPolicy,
}

impl Feed {
    pub fn new(rule_id: Uuid, title: &str, format: FeedFormat, retention: RetentionPolicy) -> Self {
        Feed {
            id: Uuid::new_v4(),
            rule_id,
            title: title.to_string(),
            format,
            active: true,
            retention,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retention;
        if r.max_items == 0 {
            return Err(ProcessingError::Config(format!("feed '{}' has max_items = 0", self.title)));
        }
        if r.min_items > r.max_items {
            return Err(ProcessingError::Config(format!(
                "feed '{}' has min_items ({}) greater than max_items ({})",
                self.title, r.min_items, r.max_items
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: Uuid,
    pub feed_id: Uuid,
    /// Source message identity; unique per feed.
    pub dedupe_key: String,
    pub title: String,
    pub author: String,
    pub summary: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

/// Per-account polling cursor: highest fully handled UID per folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub folders: BTreeMap<String, u32>,
}

impl Watermark {
    pub fn for_folder(&self, folder: &str) -> Option<u32> {
        self.folders.get(folder).copied()
    }

    /// Moves a folder cursor forward; never moves it back.
    pub fn advance(&mut self, folder: &str, uid: u32) {
        let entry = self.folders.entry(folder.to_string()).or_insert(uid);
        if uid > *entry {
            *entry = uid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_requires_a_predicate() {
        let account = Account::new("list", "imap.example.com", "me", "secret");
        let rule = Rule::new(account.id, "empty", "INBOX");
        assert!(matches!(rule.validate(), Err(ProcessingError::Config(_))));

        let blank = Rule::new(account.id, "blank", "INBOX").with_subject("   ");
        assert!(blank.validate().is_err());

        let ok = Rule::new(account.id, "rust", "INBOX").with_subject("[rust-users]");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_feed_retention_bounds() {
        let rule_id = Uuid::new_v4();
        let bad = Feed::new(
            rule_id,
            "bad",
            FeedFormat::Atom,
            RetentionPolicy { max_items: 5, min_items: 6, max_age_days: None },
        );
        assert!(bad.validate().is_err());

        let good = Feed::new(rule_id, "good", FeedFormat::Rss, RetentionPolicy::default());
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_move_needs_folder() {
        assert!(PostAction::resolve(ActionKind::Move, None).is_err());
        assert!(PostAction::resolve(ActionKind::Move, Some(" ")).is_err());
        assert_eq!(
            PostAction::resolve(ActionKind::Move, Some("Archive")).unwrap(),
            PostAction::Move("Archive".to_string())
        );

        let mut account = Account::new("list", "imap.example.com", "me", "secret");
        account.default_action = ActionKind::Move;
        assert!(account.validate().is_err());
    }

    #[test]
    fn test_watermark_never_moves_back() {
        let mut mark = Watermark::default();
        mark.advance("INBOX", 10);
        mark.advance("INBOX", 4);
        assert_eq!(mark.for_folder("INBOX"), Some(10));

        mark.advance("Lists", 3);
        assert_eq!(mark.for_folder("INBOX"), Some(10));
        assert_eq!(mark.for_folder("Lists"), Some(3));
    }
}
