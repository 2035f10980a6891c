use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use mail_parser::{Address, MessageParser};
use regex::Regex;

const SUMMARY_CHARS: usize = 500;

/// A message as seen by the orchestrator, independent of the mail protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Folder-scoped, strictly increasing identifier used for the watermark.
    pub uid: u32,
    pub folder: String,
    /// Stable identity of the message, used as the feed dedupe key.
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub labels: Vec<String>,
    pub date: DateTime<Utc>,
    pub body: String,
}

impl MailMessage {
    pub fn new(uid: u32, folder: &str, message_id: &str) -> Self {
        MailMessage {
            uid,
            folder: folder.to_string(),
            message_id: message_id.to_string(),
            from: String::new(),
            to: Vec::new(),
            subject: String::new(),
            labels: Vec::new(),
            date: Utc::now(),
            body: String::new(),
        }
    }

    pub fn from(mut self, address: &str) -> Self {
        self.from = address.to_string();
        self
    }

    pub fn to(mut self, address: &str) -> Self {
        self.to.push(address.to_string());
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.labels.push(label.to_string());
        self
    }

    pub fn dated(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn dedupe_key(&self) -> &str {
        &self.message_id
    }

    /// Leading part of the body, cut on a character boundary.
    pub fn summary(&self) -> String {
        let trimmed = self.body.trim();
        if trimmed.chars().count() <= SUMMARY_CHARS {
            return trimmed.to_string();
        }
        let mut summary: String = trimmed.chars().take(SUMMARY_CHARS).collect();
        summary.push('…');
        summary
    }

    /// Builds a message from raw RFC 822 bytes.
    ///
    /// Messages without a `Message-ID` get a synthetic identity derived from
    /// `scope`, the folder and the UID, so that re-delivery still deduplicates.
    pub fn parse_rfc822(uid: u32, folder: &str, scope: &str, raw: &[u8]) -> Option<Self> {
        let parsed = match MessageParser::default().parse(raw) {
            Some(parsed) => parsed,
            None => {
                warn!("Unable to parse message {} in {}", uid, folder);
                return None;
            }
        };

        let message_id = parsed
            .message_id()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}/{}/{}", scope, folder, uid));

        let from = addresses(parsed.from()).into_iter().next().unwrap_or_default();

        let mut to = addresses(parsed.to());
        to.extend(addresses(parsed.cc()));

        let subject = parsed.subject().unwrap_or_default().to_string();

        let date = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .or_else(|| raw_header(raw, "Date").and_then(|d| parse_rfc2822(&d)))
            .unwrap_or_else(Utc::now);

        let body = match parsed.body_text(0) {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => parsed
                .body_html(0)
                .map(|html| strip_html(&html))
                .unwrap_or_default(),
        };

        let mut labels = Vec::new();
        if let Some(list_id) = raw_header(raw, "List-Id") {
            labels.push(list_id_label(&list_id));
        }
        if let Some(gmail_labels) = raw_header(raw, "X-Gmail-Labels") {
            labels.extend(
                gmail_labels
                    .split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }

        debug!("Parsed message {} in {}: {}", uid, folder, subject);

        Some(MailMessage {
            uid,
            folder: folder.to_string(),
            message_id,
            from,
            to,
            subject,
            labels,
            date,
            body,
        })
    }
}

fn addresses(address: Option<&Address<'_>>) -> Vec<String> {
    address
        .map(|a| {
            a.iter()
                .filter_map(|addr| addr.address.as_deref())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Reads an unfolded header value from the raw header block.
fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let prefix = format!("{}:", name.to_ascii_lowercase());
    let mut value: Option<String> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        match value.as_mut() {
            Some(current) if line.starts_with([' ', '\t']) => {
                current.push(' ');
                current.push_str(line.trim());
            }
            Some(_) => break,
            None => {
                if line.to_ascii_lowercase().starts_with(&prefix) {
                    value = Some(line[prefix.len()..].trim().to_string());
                }
            }
        }
    }

    value.filter(|v| !v.is_empty())
}

/// `"Rust users <rust-users.lists.example.org>"` -> `rust-users.lists.example.org`
fn list_id_label(value: &str) -> String {
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.trim().to_string(),
    }
}

fn strip_html(html: &str) -> String {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();

    let text = html
        .replace("<br>", "\n")
        .replace("<BR>", "\n")
        .replace("</p>", "\n")
        .replace("</P>", "\n");

    match TAGS.get_or_init(|| Regex::new(r"<[^>]+>").ok()) {
        Some(tags) => tags.replace_all(&text, "").to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "From: Alice <alice@example.org>\r\n\
To: rust-users@lists.example.org\r\n\
Cc: Bob <bob@example.org>\r\n\
Subject: [rust-users] Borrow checker question\r\n\
Message-ID: <abc123@example.org>\r\n\
Date: Tue, 14 Oct 2025 09:30:00 +0000\r\n\
List-Id: Rust users\r\n <rust-users.lists.example.org>\r\n\
X-Gmail-Labels: Lists,Rust\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Hello <b>world</b></p>\r\n";

    #[test]
    fn test_parse_rfc822() {
        let msg = MailMessage::parse_rfc822(42, "INBOX", "acct", RAW.as_bytes()).unwrap();

        assert_eq!(msg.uid, 42);
        assert_eq!(msg.message_id, "abc123@example.org");
        assert_eq!(msg.from, "alice@example.org");
        assert_eq!(msg.to, vec!["rust-users@lists.example.org", "bob@example.org"]);
        assert_eq!(msg.subject, "[rust-users] Borrow checker question");
        assert_eq!(msg.date.to_rfc3339(), "2025-10-14T09:30:00+00:00");
        assert_eq!(msg.labels, vec!["rust-users.lists.example.org", "Lists", "Rust"]);
        assert!(msg.body.contains("Hello world"));
        assert!(!msg.body.contains("<b>"));
    }

    #[test]
    fn test_missing_message_id_gets_synthetic_key() {
        let raw = "From: a@example.org\r\nSubject: hi\r\n\r\nbody\r\n";
        let msg = MailMessage::parse_rfc822(7, "Lists", "acct", raw.as_bytes()).unwrap();
        assert_eq!(msg.dedupe_key(), "acct/Lists/7");
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "x".repeat(2000);
        let msg = MailMessage::new(1, "INBOX", "id").body(&long);
        assert_eq!(msg.summary().chars().count(), SUMMARY_CHARS + 1);
    }
}
