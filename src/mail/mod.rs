//! Mail access boundary: connecting to an account, listing new messages and
//! applying post-process actions.

pub mod imap;
pub mod memory;
pub mod message;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{Account, PostAction};

pub use imap::ImapMailClient;
pub use memory::MemoryMailServer;
pub use message::MailMessage;

/// Finite, non-restartable sequence of messages in ascending UID order.
pub type MessageStream = BoxStream<'static, Result<MailMessage>>;

pub trait MailClient: Send + Sync {
    /// Opens an authenticated session for the account.
    ///
    /// Network failures must map to `ProcessingError::Connection`, rejected
    /// credentials to `ProcessingError::Config`.
    fn connect<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Box<dyn MailConnection>>>;
}

pub trait MailConnection: Send + Sync {
    /// Messages of `folder` with a UID above `since_uid` received on or after
    /// `received_since`, at most `max_count`.
    ///
    /// Servers may apply the date bound per day, so callers still check
    /// message dates.
    fn list_messages<'a>(
        &'a self,
        folder: &'a str,
        since_uid: Option<u32>,
        received_since: DateTime<Utc>,
        max_count: usize,
    ) -> BoxFuture<'a, Result<MessageStream>>;

    fn mark_read<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>>;

    fn delete<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>>;

    fn move_to<'a>(&'a self, message: &'a MailMessage, folder: &'a str) -> BoxFuture<'a, Result<()>>;

    fn logout(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Applies a resolved post-process action to a message.
pub async fn apply_action(
    connection: &dyn MailConnection,
    message: &MailMessage,
    action: &PostAction,
) -> Result<()> {
    match action {
        PostAction::None => Ok(()),
        PostAction::MarkRead => connection.mark_read(message).await,
        PostAction::Delete => connection.delete(message).await,
        PostAction::Move(folder) => connection.move_to(message, folder).await,
    }
}
