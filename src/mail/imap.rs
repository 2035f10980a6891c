use std::fmt::Debug;
use std::sync::Arc;

use async_imap::Session;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{MailClient, MailConnection, MailMessage, MessageStream};
use crate::error::{ProcessingError, Result};
use crate::model::Account;

trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> ImapStream for T {}

type ImapSession = Session<Box<dyn ImapStream>>;

/// IMAP access over TLS, or plain TCP when the account disables encryption.
#[derive(Debug, Clone, Default)]
pub struct ImapMailClient;

impl ImapMailClient {
    pub fn new() -> Self {
        ImapMailClient
    }
}

impl MailClient for ImapMailClient {
    fn connect<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Box<dyn MailConnection>>> {
        Box::pin(async move {
            info!("Connecting to IMAP server {}:{}", account.host, account.port);

            let tcp_stream = TcpStream::connect((account.host.as_str(), account.port))
                .await
                .map_err(|e| {
                    ProcessingError::Connection(format!(
                        "unable to reach {}:{}: {}",
                        account.host, account.port, e
                    ))
                })?;

            let stream: Box<dyn ImapStream> = if account.use_tls {
                let connector = tokio_native_tls::native_tls::TlsConnector::new()
                    .map_err(|e| ProcessingError::Connection(format!("TLS setup failed: {}", e)))?;
                let tls_stream = tokio_native_tls::TlsConnector::from(connector)
                    .connect(&account.host, tcp_stream)
                    .await
                    .map_err(|e| ProcessingError::Connection(format!("TLS handshake failed: {}", e)))?;
                Box::new(tls_stream)
            } else {
                Box::new(tcp_stream)
            };

            let client = async_imap::Client::new(stream);
            let session = client
                .login(&account.username, &account.password)
                .await
                .map_err(|(e, _client)| match e {
                    async_imap::error::Error::No(msg) => ProcessingError::Config(format!(
                        "authentication rejected for {}: {}",
                        account.username, msg
                    )),
                    other => ProcessingError::Connection(format!("IMAP login failed: {:?}", other)),
                })?;

            info!("IMAP session established for {}", account.name);

            Ok(Box::new(ImapConnection {
                scope: account.id.to_string(),
                inner: Arc::new(Mutex::new(SessionState {
                    session,
                    selected: None,
                })),
            }) as Box<dyn MailConnection>)
        })
    }
}

struct SessionState {
    session: ImapSession,
    selected: Option<String>,
}

fn protocol(context: &str) -> impl Fn(async_imap::error::Error) -> ProcessingError + '_ {
    move |e| ProcessingError::Protocol(format!("{}: {:?}", context, e))
}

impl SessionState {
    async fn select(&mut self, folder: &str) -> Result<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session
            .select(folder)
            .await
            .map_err(protocol("unable to select folder"))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }

    async fn store(&mut self, uid: u32, flags: &str) -> Result<()> {
        let updates = self
            .session
            .uid_store(uid.to_string(), flags)
            .await
            .map_err(protocol("unable to store flags"))?;
        // the store only takes effect once the response stream is drained
        let results: Vec<_> = updates.collect().await;
        if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
            return Err(ProcessingError::Protocol(format!("flag update failed: {:?}", e)));
        }
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        let expunged = self
            .session
            .expunge()
            .await
            .map_err(protocol("unable to expunge"))?;
        let _results: Vec<_> = expunged.collect().await;
        Ok(())
    }

    async fn fetch(&mut self, folder: &str, scope: &str, uid: u32) -> Result<Option<MailMessage>> {
        self.select(folder).await?;

        let fetches: Vec<_> = self
            .session
            .uid_fetch(uid.to_string(), "(UID RFC822)")
            .await
            .map_err(protocol("unable to fetch message"))?
            .collect()
            .await;

        for fetch in fetches {
            let fetch = fetch.map_err(protocol("unable to read message"))?;
            if let Some(body) = fetch.body() {
                debug!("Fetched message {} from {} ({} bytes)", uid, folder, body.len());
                return Ok(MailMessage::parse_rfc822(uid, folder, scope, body));
            }
        }

        warn!("Message {} in {} has no body", uid, folder);
        Ok(None)
    }
}

struct ImapConnection {
    scope: String,
    inner: Arc<Mutex<SessionState>>,
}

impl MailConnection for ImapConnection {
    fn list_messages<'a>(
        &'a self,
        folder: &'a str,
        since_uid: Option<u32>,
        received_since: DateTime<Utc>,
        max_count: usize,
    ) -> BoxFuture<'a, Result<MessageStream>> {
        Box::pin(async move {
            let start = since_uid.map_or(1, |uid| uid.saturating_add(1));
            // SINCE compares the internal date, day by day
            let query = format!("UID {}:* SINCE {}", start, received_since.format("%d-%b-%Y"));

            let mut uids: Vec<u32> = {
                let mut state = self.inner.lock().await;
                state.select(folder).await?;
                state
                    .session
                    .uid_search(query)
                    .await
                    .map_err(protocol("unable to search folder"))?
                    .into_iter()
                    // `n:*` also returns the last message when n is past the end
                    .filter(|uid| *uid >= start)
                    .collect()
            };
            uids.sort_unstable();
            uids.truncate(max_count);

            debug!("{} new message(s) in {} above UID {}", uids.len(), folder, start - 1);

            let inner = Arc::clone(&self.inner);
            let scope = self.scope.clone();
            let folder = folder.to_string();

            let messages = stream::iter(uids)
                .then(move |uid| {
                    let inner = Arc::clone(&inner);
                    let scope = scope.clone();
                    let folder = folder.clone();
                    async move { inner.lock().await.fetch(&folder, &scope, uid).await }
                })
                .filter_map(|fetched| async move { fetched.transpose() });

            Ok(messages.boxed())
        })
    }

    fn mark_read<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state.select(&message.folder).await?;
            state.store(message.uid, "+FLAGS (\\Seen)").await
        })
    }

    fn delete<'a>(&'a self, message: &'a MailMessage) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state.select(&message.folder).await?;
            state.store(message.uid, "+FLAGS (\\Deleted)").await?;
            state.expunge().await
        })
    }

    fn move_to<'a>(&'a self, message: &'a MailMessage, folder: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state.select(&message.folder).await?;
            state
                .session
                .uid_copy(message.uid.to_string(), folder)
                .await
                .map_err(protocol("unable to copy message"))?;
            state.store(message.uid, "+FLAGS (\\Deleted)").await?;
            state.expunge().await?;
            info!("Message {} moved from {} to {}", message.uid, message.folder, folder);
            Ok(())
        })
    }

    fn logout(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state
                .session
                .logout()
                .await
                .map_err(protocol("IMAP logout failed"))
        })
    }
}
