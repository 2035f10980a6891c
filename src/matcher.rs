//! Rule evaluation and post-process action resolution.

use crate::error::Result;
use crate::mail::MailMessage;
use crate::model::{Account, PostAction, Rule};

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// True when every non-empty predicate of the rule holds for the message.
///
/// Addresses and subject are matched by case-insensitive containment, labels
/// by case-insensitive equality. A rule without predicates never matches;
/// such rules are rejected when they are saved.
pub fn matches(rule: &Rule, message: &MailMessage) -> bool {
    let predicates = rule.predicates();
    if predicates.is_empty() {
        return false;
    }

    predicates.into_iter().all(|(field, expected)| match field {
        "to_address" => message.to.iter().any(|to| contains_ci(to, expected)),
        "from_address" => contains_ci(&message.from, expected),
        "subject_contains" => contains_ci(&message.subject, expected),
        "label" => message.labels.iter().any(|l| l.eq_ignore_ascii_case(expected)),
        _ => false,
    })
}

/// Action for messages matched by `rule`.
///
/// The rule's own action applies only when it is set and the rule does not
/// inherit; otherwise the account defaults apply.
pub fn resolve_action(rule: &Rule, account: &Account) -> Result<PostAction> {
    match rule.action {
        Some(action) if !rule.inherit_defaults => {
            PostAction::resolve(action, rule.target_folder.as_deref())
        }
        _ => PostAction::resolve(account.default_action, account.default_folder.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;

    fn account() -> Account {
        let mut account = Account::new("lists", "imap.example.com", "me", "secret");
        account.default_action = ActionKind::Move;
        account.default_folder = Some("Archive".to_string());
        account
    }

    #[test]
    fn test_to_address_scenario() {
        let account = account();
        let rule = Rule::new(account.id, "a", "INBOX").with_to("a@x.com");

        let hit = MailMessage::new(1, "INBOX", "m1")
            .from("anyone@y.org")
            .to("A@X.com")
            .subject("whatever");
        let miss = MailMessage::new(2, "INBOX", "m2").to("c@x.com");

        assert!(matches(&rule, &hit));
        assert!(!matches(&rule, &miss));
    }

    #[test]
    fn test_all_predicates_must_hold() {
        let account = account();
        let rule = Rule::new(account.id, "rust", "INBOX")
            .with_from("lists.example.org")
            .with_subject("[Rust-Users]")
            .with_label("rust");

        let full = MailMessage::new(1, "INBOX", "m1")
            .from("bounce@lists.example.org")
            .subject("[rust-users] lifetimes")
            .label("Rust");
        assert!(matches(&rule, &full));

        let unlabeled = MailMessage { labels: vec![], ..full.clone() };
        assert!(!matches(&rule, &unlabeled));

        // labels compare whole, not by substring
        let other_label = MailMessage { labels: vec!["rustacean".into()], ..full };
        assert!(!matches(&rule, &other_label));
    }

    #[test]
    fn test_empty_rule_never_matches() {
        let rule = Rule::new(account().id, "empty", "INBOX");
        assert!(!matches(&rule, &MailMessage::new(1, "INBOX", "m1")));
    }

    #[test]
    fn test_action_resolution() {
        let account = account();

        let inherits = Rule::new(account.id, "r", "INBOX").with_to("a@x.com");
        assert_eq!(
            resolve_action(&inherits, &account).unwrap(),
            PostAction::Move("Archive".to_string())
        );

        let own = inherits.clone().with_action(ActionKind::MarkRead, None);
        assert_eq!(resolve_action(&own, &account).unwrap(), PostAction::MarkRead);

        // the inherit flag wins over a stale rule-level action
        let stale = Rule { inherit_defaults: true, ..own };
        assert_eq!(
            resolve_action(&stale, &account).unwrap(),
            PostAction::Move("Archive".to_string())
        );
    }
}
