//! IMAP implementation of [`MailSession`] on top of async-imap

use std::borrow::Cow;
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::{Fetch, NameAttribute};
use async_imap::Client;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, trace, warn};

use crate::config::{AccountConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{Envelope, EnvelopeAddress, MailboxDescriptor, MessageRef, MessageSummary};

use super::MailSession;

/// Items of the batched metadata fetch
const SUMMARY_QUERY: &str = "(UID ENVELOPE RFC822.SIZE RFC822.HEADER)";

/// Full message without touching \Seen
const BODY_QUERY: &str = "BODY.PEEK[]";

const INITIAL_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 30000;

/// Paces the commands sent to one account's server.
///
/// Connection attempts and every command of the resulting session draw from
/// the same bucket, so retries count against the budget too.
#[derive(Clone)]
struct CommandPacer {
    host: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl CommandPacer {
    /// A zero rate falls back to one command per second
    fn new(host: &str, commands_per_second: u32) -> Self {
        let rate = NonZeroU32::new(commands_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            host: host.to_string(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    async fn pace(&self, command: &str) {
        self.limiter.until_ready().await;
        trace!("{} to {}", command, self.host);
    }
}

/// Connects and logs in to one account's IMAP server
pub struct ImapClient {
    account: AccountConfig,
    pacer: CommandPacer,
    connect_attempts: u32,
    connect_timeout: Duration,
}

impl ImapClient {
    pub fn new(account: AccountConfig, config: &SyncConfig) -> Self {
        Self {
            pacer: CommandPacer::new(&account.server, config.rate_limit_per_second),
            account,
            connect_attempts: config.connect_attempts.max(1),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        }
    }

    /// Connect with exponential backoff; authentication failures are not retried
    pub async fn connect_with_retry(&self) -> Result<Box<dyn MailSession>> {
        let mut last_error = None;
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;

        for attempt in 1..=self.connect_attempts {
            match self.connect().await {
                Ok(session) => return Ok(session),
                Err(e @ Error::ConnectionFailed { .. }) => {
                    warn!(
                        "IMAP connection attempt {}/{} failed for {}: {}",
                        attempt, self.connect_attempts, self.account.login, e
                    );
                    last_error = Some(e);

                    if attempt < self.connect_attempts {
                        info!("Retrying in {}ms...", delay_ms);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::ConnectionFailed {
            host: self.account.server.clone(),
            reason: "connection failed after retries".to_string(),
        }))
    }

    /// Open one session: TCP, optional TLS, greeting, LOGIN
    pub async fn connect(&self) -> Result<Box<dyn MailSession>> {
        let host = self.account.server.clone();
        tokio::time::timeout(self.connect_timeout, self.connect_inner())
            .await
            .map_err(|_| Error::ConnectionFailed {
                host,
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
    }

    async fn connect_inner(&self) -> Result<Box<dyn MailSession>> {
        self.pacer.pace("CONNECT").await;

        let host = self.account.server.as_str();
        info!("Connecting to server {}:{}...", host, self.account.port);
        let tcp = TcpStream::connect((host, self.account.port))
            .await
            .map_err(|e| connection_failed(host, e))?;

        if self.account.tls {
            let tls_stream = TlsConnector::new()
                .connect(host, tcp.compat())
                .await
                .map_err(|e| connection_failed(host, e))?;
            debug!("TLS connection established with {}", host);
            self.login(Client::new(tls_stream)).await
        } else {
            self.login(Client::new(tcp.compat())).await
        }
    }

    async fn login<T>(&self, mut client: Client<T>) -> Result<Box<dyn MailSession>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
    {
        let host = self.account.server.as_str();

        // The server greeting has to be consumed before the first command
        match client.read_response().await {
            Some(Ok(_greeting)) => debug!("Server greeting received from {}", host),
            Some(Err(e)) => return Err(connection_failed(host, e)),
            None => {
                return Err(connection_failed(host, "unexpected end of stream, expected greeting"))
            }
        }

        let session = client
            .login(&self.account.login, &self.account.password)
            .await
            .map_err(|(e, _)| Error::Auth {
                login: self.account.login.clone(),
                reason: e.to_string(),
            })?;
        info!("Logged in to {} as {}", host, self.account.login);

        Ok(Box::new(ImapSession {
            session,
            host: host.to_string(),
            selected: None,
            pacer: self.pacer.clone(),
        }))
    }
}

/// An authenticated IMAP session
pub struct ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: async_imap::Session<T>,
    host: String,
    selected: Option<String>,
    pacer: CommandPacer,
}

impl<T> ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    /// EXAMINE (read-only SELECT); returns the message count
    async fn examine(&mut self, mailbox: &str) -> Result<u32> {
        self.pacer.pace("EXAMINE").await;
        let status = self
            .session
            .examine(mailbox)
            .await
            .map_err(|e| Error::Protocol(format!("failed to select mailbox '{}': {}", mailbox, e)))?;
        self.selected = Some(mailbox.to_string());
        Ok(status.exists)
    }

    async fn select_if_needed(&mut self, mailbox: &str) -> Result<()> {
        if self.selected.as_deref() != Some(mailbox) {
            self.examine(mailbox).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T> MailSession for ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    async fn list_mailboxes(&mut self) -> Result<Vec<String>> {
        self.pacer.pace("LIST").await;
        let names: Vec<_> = self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| Error::Protocol(format!("failed to list mailboxes: {}", e)))?
            .collect()
            .await;

        let mut mailboxes = Vec::with_capacity(names.len());
        for name in names {
            let name = name.map_err(|e| Error::Protocol(format!("failed to read mailboxes: {}", e)))?;
            if name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, NameAttribute::NoSelect))
            {
                debug!("Skipping non-selectable mailbox {}", name.name());
                continue;
            }
            mailboxes.push(name.name().to_string());
        }
        Ok(mailboxes)
    }

    async fn status(&mut self, mailbox: &str) -> Result<MailboxDescriptor> {
        let exists = self.examine(mailbox).await?;
        Ok(MailboxDescriptor::new(mailbox, exists))
    }

    async fn fetch_summaries(
        &mut self,
        mailbox: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<MessageSummary>> {
        self.select_if_needed(mailbox).await?;
        self.pacer.pace("FETCH").await;

        let fetches: Vec<_> = self
            .session
            .fetch(format!("{}:{}", from, to), SUMMARY_QUERY)
            .await
            .map_err(|e| Error::Protocol(format!("failed to fetch mails from {}: {}", mailbox, e)))?
            .collect()
            .await;

        let mut summaries = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let fetch = fetch.map_err(|e| Error::Protocol(format!("failed to fetch mails from {}: {}", mailbox, e)))?;
            // Unsolicited FETCH responses (flag updates) carry no header
            let Some(header) = fetch.header() else {
                debug!("Ignoring FETCH without header for message {}", fetch.message);
                continue;
            };
            summaries.push(MessageSummary {
                reference: MessageRef::new(fetch.message, fetch.uid),
                envelope: envelope_of(&fetch),
                header: header.to_vec(),
                size: fetch.size,
            });
        }

        let expected = (to.saturating_sub(from) + 1) as usize;
        if summaries.len() != expected {
            return Err(Error::Protocol(format!(
                "expected {} but got {} mails from {}",
                expected,
                summaries.len(),
                mailbox
            )));
        }
        Ok(summaries)
    }

    async fn fetch_message(&mut self, mailbox: &str, reference: MessageRef) -> Result<Vec<u8>> {
        self.select_if_needed(mailbox).await?;
        self.pacer.pace("FETCH BODY").await;

        let host = self.host.clone();
        let fetches: Vec<_> = match reference.uid {
            Some(uid) => self
                .session
                .uid_fetch(uid.to_string(), BODY_QUERY)
                .await
                .map_err(|e| classify_fetch_error(&host, e))?
                .collect()
                .await,
            None => self
                .session
                .fetch(reference.seq.to_string(), BODY_QUERY)
                .await
                .map_err(|e| classify_fetch_error(&host, e))?
                .collect()
                .await,
        };

        let mut replies = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            replies.push(fetch.map_err(|e| classify_fetch_error(&host, e))?);
        }
        body_of(
            reference,
            mailbox,
            replies.iter().map(|fetch| (fetch.message, fetch.uid, fetch.body())),
        )
    }

    async fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .await
            .map_err(|e| Error::Protocol(format!("logout failed: {}", e)))
    }
}

/// Map a single-message fetch failure onto the error taxonomy.
///
/// Responses the client cannot parse and per-message NO replies concern one
/// message only; everything else means the session is unusable.
fn classify_fetch_error(host: &str, err: ImapError) -> Error {
    match err {
        ImapError::Parse(e) => Error::MalformedMessage(format!("unparseable FETCH response: {}", e)),
        ImapError::No(reason) => Error::MalformedMessage(format!("server refused message: {}", reason)),
        ImapError::Io(e) => connection_failed(host, e),
        ImapError::ConnectionLost => connection_failed(host, "connection lost"),
        other => Error::Protocol(other.to_string()),
    }
}

/// Pick the body of `reference` out of the FETCH replies `(seq, uid, body)`.
///
/// Replies for other messages (unsolicited updates) are skipped; no body at
/// all means the server could not render the message.
fn body_of<'a>(
    reference: MessageRef,
    mailbox: &str,
    replies: impl IntoIterator<Item = (u32, Option<u32>, Option<&'a [u8]>)>,
) -> Result<Vec<u8>> {
    for (seq, uid, body) in replies {
        let matches = match reference.uid {
            Some(expected) => uid == Some(expected),
            None => seq == reference.seq,
        };
        if let (true, Some(body)) = (matches, body) {
            return Ok(body.to_vec());
        }
    }

    Err(Error::MalformedMessage(format!(
        "server returned no body for message {} in {}",
        reference, mailbox
    )))
}

fn connection_failed(host: &str, reason: impl std::fmt::Display) -> Error {
    Error::ConnectionFailed {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn lossy(value: &Option<Cow<'_, [u8]>>) -> Option<String> {
    value
        .as_ref()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn envelope_of(fetch: &Fetch) -> Envelope {
    let Some(envelope) = fetch.envelope() else {
        return Envelope::default();
    };
    Envelope {
        from: envelope
            .from
            .as_ref()
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|addr| EnvelopeAddress {
                        name: lossy(&addr.name),
                        mailbox: lossy(&addr.mailbox),
                        host: lossy(&addr.host),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        subject: lossy(&envelope.subject),
        date: lossy(&envelope.date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Instant;

    #[test]
    fn test_refused_message_is_recoverable() {
        let err = classify_fetch_error("imap.example.com", ImapError::No("message vanished".into()));
        assert!(matches!(err, Error::MalformedMessage(_)));
        assert!(err.is_recoverable_fetch());
    }

    #[test]
    fn test_lost_connection_aborts_the_run() {
        let err = classify_fetch_error("imap.example.com", ImapError::ConnectionLost);
        match &err {
            Error::ConnectionFailed { host, reason } => {
                assert_eq!(host, "imap.example.com");
                assert_eq!(reason, "connection lost");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.is_recoverable_fetch());

        let err = classify_fetch_error(
            "imap.example.com",
            ImapError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        );
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(!err.is_recoverable_fetch());
    }

    #[test]
    fn test_bad_response_is_a_protocol_error() {
        let err = classify_fetch_error("imap.example.com", ImapError::Bad("unknown command".into()));
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!err.is_recoverable_fetch());
    }

    #[test]
    fn test_body_of_prefers_the_pinned_uid() {
        let reference = MessageRef::new(3, Some(42));
        let replies = vec![
            (3, Some(41), Some(&b"stale"[..])),
            (4, Some(42), Some(&b"wanted"[..])),
        ];
        assert_eq!(body_of(reference, "INBOX", replies).unwrap(), b"wanted");

        let by_seq = MessageRef::new(7, None);
        let replies = vec![(6, None, Some(&b"other"[..])), (7, None, Some(&b"mine"[..]))];
        assert_eq!(body_of(by_seq, "INBOX", replies).unwrap(), b"mine");
    }

    #[test]
    fn test_fetch_without_body_is_malformed() {
        let reference = MessageRef::new(3, Some(42));
        let err = body_of(reference, "INBOX", vec![(3, Some(42), None)]).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
        assert!(err.is_recoverable_fetch());

        let err = body_of(reference, "INBOX", Vec::new()).unwrap_err();
        assert!(err.is_recoverable_fetch());
    }

    #[tokio::test]
    async fn test_pacer_delays_commands_beyond_the_rate() {
        let pacer = CommandPacer::new("imap.example.com", 5);
        let started = Instant::now();
        for _ in 0..5 {
            pacer.pace("NOOP").await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        pacer.clone().pace("NOOP").await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
