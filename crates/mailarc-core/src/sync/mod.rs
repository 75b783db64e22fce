//! Archive synchronizer
//!
//! Mirrors every mailbox of an account into the content-addressed [`Store`].
//! One batched metadata fetch per mailbox decides which messages are missing;
//! only those are fetched in full, so re-running after a partial failure costs
//! no full-body fetches for messages that are already archived.

mod imap;

pub use imap::*;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AccountConfig, SyncConfig};
use crate::error::Result;
use crate::models::{
    MailboxDescriptor, MailboxMetadata, MessageRef, MessageSummary, UnprocessableRecord,
};
use crate::store::{sanitize, Store};

/// Operations the synchronizer needs from a logged-in mail server session.
///
/// A session has at most one selected mailbox, so calls are strictly sequential.
#[async_trait]
pub trait MailSession: Send {
    /// Names of all selectable mailboxes
    async fn list_mailboxes(&mut self) -> Result<Vec<String>>;

    /// Current message count of a mailbox
    async fn status(&mut self, mailbox: &str) -> Result<MailboxDescriptor>;

    /// Envelope, header bytes, size and UID for sequence numbers `from..=to`.
    ///
    /// Fails with a protocol error when the server returns a different number
    /// of messages.
    async fn fetch_summaries(
        &mut self,
        mailbox: &str,
        from: u32,
        to: u32,
    ) -> Result<Vec<MessageSummary>>;

    /// Full raw message.
    ///
    /// Fails with [`Error::MalformedMessage`](crate::Error::MalformedMessage)
    /// when only this message is affected.
    async fn fetch_message(&mut self, mailbox: &str, reference: MessageRef) -> Result<Vec<u8>>;

    async fn logout(&mut self) -> Result<()>;
}

/// Outcome of archiving one mailbox
#[derive(Debug, Clone, Default, Serialize)]
pub struct MailboxReport {
    pub mailbox: String,
    /// Messages fetched and written this run
    pub archived: usize,
    /// Messages whose artifact already existed
    pub skipped: usize,
    pub unprocessable: Vec<UnprocessableRecord>,
}

/// Summary of one account run
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub server: String,
    pub login: String,
    pub mailboxes: Vec<MailboxDescriptor>,
    pub total_messages: u64,
    pub archived: usize,
    pub skipped: usize,
    pub unprocessable: Vec<UnprocessableRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ArchiveReport {
    fn absorb(&mut self, mailbox: MailboxReport) {
        self.archived += mailbox.archived;
        self.skipped += mailbox.skipped;
        self.unprocessable.extend(mailbox.unprocessable);
    }
}

/// Per-account orchestrator writing artifacts through the store
pub struct Archiver {
    store: Store,
    server: String,
    login: String,
}

impl Archiver {
    pub fn new(store: Store, account: &AccountConfig) -> Self {
        Self {
            store,
            server: account.server.clone(),
            login: account.login.clone(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Archive every mailbox of the session's account.
    ///
    /// The first mailbox failure aborts the run.
    pub async fn archive(&self, session: &mut dyn MailSession) -> Result<ArchiveReport> {
        let started_at = Utc::now();
        let names = session.list_mailboxes().await?;

        let mut mailboxes = Vec::with_capacity(names.len());
        let mut total_messages = 0u64;
        for name in names {
            let descriptor = session.status(&name).await?;
            info!("{} contains {} mails", descriptor.name, descriptor.message_count);
            total_messages += u64::from(descriptor.message_count);
            mailboxes.push(descriptor);
        }
        info!("Total mails on {} for {}: {}", self.server, self.login, total_messages);
        warn_on_collisions(&mailboxes);

        let mut report = ArchiveReport {
            server: self.server.clone(),
            login: self.login.clone(),
            mailboxes: mailboxes.clone(),
            total_messages,
            archived: 0,
            skipped: 0,
            unprocessable: Vec::new(),
            started_at,
            finished_at: None,
        };

        for descriptor in &mailboxes {
            let mailbox_report = self.archive_mailbox(session, descriptor).await?;
            report.absorb(mailbox_report);
        }
        report.finished_at = Some(Utc::now());

        info!(
            "Archived {} new mails, {} already present",
            report.archived, report.skipped
        );
        if !report.unprocessable.is_empty() {
            warn!("Ignored {} unprocessable mails:", report.unprocessable.len());
            for record in &report.unprocessable {
                warn!("  {}", record);
            }
        }
        Ok(report)
    }

    /// Ensure every message of one mailbox has a local artifact
    pub async fn archive_mailbox(
        &self,
        session: &mut dyn MailSession,
        descriptor: &MailboxDescriptor,
    ) -> Result<MailboxReport> {
        let mailbox = descriptor.name.as_str();
        self.store.write_metadata(&MailboxMetadata {
            name: mailbox.to_string(),
            server: self.server.clone(),
            login: self.login.clone(),
            count: descriptor.message_count,
        })?;

        let mut report = MailboxReport {
            mailbox: mailbox.to_string(),
            ..Default::default()
        };
        if descriptor.is_empty() {
            return Ok(report);
        }

        let summaries = session
            .fetch_summaries(mailbox, 1, descriptor.message_count)
            .await?;

        for summary in summaries {
            let id = summary.id();
            if self.store.contains(mailbox, &id) {
                report.skipped += 1;
                continue;
            }

            let raw = match session.fetch_message(mailbox, summary.reference).await {
                Ok(raw) => raw,
                Err(e) if e.is_recoverable_fetch() => {
                    let title = summary.envelope.title();
                    warn!(
                        "Ignoring broken mail {} in {}: {} Reason: {}",
                        summary.reference, mailbox, title, e
                    );
                    report.unprocessable.push(UnprocessableRecord {
                        mailbox: mailbox.to_string(),
                        reference: summary.reference,
                        title,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    error!("Cannot read full mail {} in {}: {}", summary.reference, mailbox, e);
                    return Err(e);
                }
            };

            self.store.write_artifact(mailbox, &id, &raw)?;
            report.archived += 1;
            info!(
                "Saved {}/{}: {}",
                mailbox,
                summary.reference.seq,
                summary.envelope.title()
            );
        }

        Ok(report)
    }
}

fn warn_on_collisions(mailboxes: &[MailboxDescriptor]) {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for descriptor in mailboxes {
        if let Some(other) = seen.insert(sanitize(&descriptor.name), &descriptor.name) {
            warn!(
                "Mailboxes '{}' and '{}' share the directory '{}'",
                other,
                descriptor.name,
                sanitize(&descriptor.name)
            );
        }
    }
}

/// Connect, archive one account into `root`, and always log out
pub async fn archive_account(
    account: &AccountConfig,
    root: &Path,
    config: &SyncConfig,
) -> Result<ArchiveReport> {
    account.validate()?;
    let client = ImapClient::new(account.clone(), config);
    let mut session = client.connect_with_retry().await?;

    let archiver = Archiver::new(Store::new(root), account);
    let result = archiver.archive(&mut *session).await;

    if let Err(e) = session.logout().await {
        warn!("Logout from {} failed: {}", account.server, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{ArchivedMessageId, Envelope};
    use std::collections::BTreeMap;

    struct FakeMessage {
        header: Vec<u8>,
        raw: Vec<u8>,
        malformed: bool,
    }

    #[derive(Default)]
    struct FakeSession {
        mailboxes: BTreeMap<String, Vec<FakeMessage>>,
        summary_fetches: usize,
        body_fetches: usize,
        fail_bodies_with_protocol_error: bool,
    }

    impl FakeSession {
        fn with_mailbox(mut self, name: &str, subjects: &[&str]) -> Self {
            let messages = subjects
                .iter()
                .map(|subject| {
                    let header = format!("From: a@example.com\r\nSubject: {}\r\n\r\n", subject);
                    FakeMessage {
                        raw: format!("{}body of {}\r\n", header, subject).into_bytes(),
                        header: header.into_bytes(),
                        malformed: subject.starts_with("BROKEN"),
                    }
                })
                .collect();
            self.mailboxes.insert(name.to_string(), messages);
            self
        }
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn list_mailboxes(&mut self) -> Result<Vec<String>> {
            Ok(self.mailboxes.keys().cloned().collect())
        }

        async fn status(&mut self, mailbox: &str) -> Result<MailboxDescriptor> {
            Ok(MailboxDescriptor::new(mailbox, self.mailboxes[mailbox].len() as u32))
        }

        async fn fetch_summaries(
            &mut self,
            mailbox: &str,
            from: u32,
            to: u32,
        ) -> Result<Vec<MessageSummary>> {
            self.summary_fetches += 1;
            Ok(self.mailboxes[mailbox][(from - 1) as usize..to as usize]
                .iter()
                .enumerate()
                .map(|(i, m)| MessageSummary {
                    reference: MessageRef::new(from + i as u32, Some(1000 + from + i as u32)),
                    envelope: Envelope {
                        subject: Some(String::from_utf8_lossy(&m.header).into_owned()),
                        ..Default::default()
                    },
                    header: m.header.clone(),
                    size: Some(m.raw.len() as u32),
                })
                .collect())
        }

        async fn fetch_message(&mut self, mailbox: &str, reference: MessageRef) -> Result<Vec<u8>> {
            self.body_fetches += 1;
            if self.fail_bodies_with_protocol_error {
                return Err(Error::Protocol("BAD command".into()));
            }
            let uid = reference.uid.expect("fake always returns uids");
            let message = &self.mailboxes[mailbox][(uid - 1001) as usize];
            if message.malformed {
                return Err(Error::MalformedMessage("Missing type-specific fields".into()));
            }
            Ok(message.raw.clone())
        }

        async fn logout(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn account() -> AccountConfig {
        AccountConfig {
            name: "test".into(),
            server: "imap.example.com".into(),
            port: 993,
            login: "alice".into(),
            password: "secret".into(),
            tls: true,
        }
    }

    fn artifact_count(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .flatten()
            .filter(|e| e.path().is_dir())
            .flat_map(|dir| std::fs::read_dir(dir.path()).unwrap().flatten())
            .filter(|f| f.path().extension().is_some_and(|ext| ext == "eml"))
            .count()
    }

    #[tokio::test]
    async fn test_second_run_issues_no_body_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(Store::new(dir.path()), &account());
        let mut session = FakeSession::default()
            .with_mailbox("INBOX", &["Invoice March", "Invoice April"])
            .with_mailbox("Travel", &["Travel receipt"]);

        let first = archiver.archive(&mut session).await.unwrap();
        assert_eq!(first.archived, 3);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.total_messages, 3);
        assert_eq!(session.body_fetches, 3);
        assert_eq!(artifact_count(dir.path()), 3);

        let second = archiver.archive(&mut session).await.unwrap();
        assert_eq!(second.archived, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(session.body_fetches, 3);
        assert_eq!(session.summary_fetches, 4);
        assert_eq!(artifact_count(dir.path()), 3);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(Store::new(dir.path()), &account());
        let mut session = FakeSession::default().with_mailbox(
            "INBOX",
            &["one", "BROKEN two", "three", "BROKEN four", "five"],
        );

        let report = archiver.archive(&mut session).await.unwrap();
        assert_eq!(report.archived, 3);
        assert_eq!(report.unprocessable.len(), 2);
        assert_eq!(artifact_count(dir.path()), 3);
        assert!(report.unprocessable[0].title.contains("BROKEN two"));
        assert!(report.unprocessable[1].title.contains("BROKEN four"));
        assert_eq!(report.unprocessable[0].reference.uid, Some(1002));
    }

    #[tokio::test]
    async fn test_other_fetch_errors_abort_the_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(Store::new(dir.path()), &account());
        let mut session = FakeSession::default().with_mailbox("INBOX", &["one", "two"]);
        session.fail_bodies_with_protocol_error = true;

        let err = archiver.archive(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(session.body_fetches, 1);
    }

    #[tokio::test]
    async fn test_empty_mailbox_gets_directory_and_sidecar_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let archiver = Archiver::new(store.clone(), &account());
        let mut session = FakeSession::default().with_mailbox("Drafts/Old", &[]);

        let report = archiver.archive(&mut session).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(session.summary_fetches, 0);
        assert!(store.mailbox_dir("Drafts/Old").is_dir());

        let meta = store.read_metadata("Drafts/Old").unwrap().unwrap();
        assert_eq!(meta.count, 0);
        assert_eq!(meta.server, "imap.example.com");
        assert_eq!(meta.login, "alice");
    }

    #[tokio::test]
    async fn test_same_headers_in_two_mailboxes_share_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let archiver = Archiver::new(store.clone(), &account());
        let mut session = FakeSession::default()
            .with_mailbox("INBOX", &["shared"])
            .with_mailbox("Archive", &["shared"]);

        archiver.archive(&mut session).await.unwrap();
        let id = ArchivedMessageId::from_header(b"From: a@example.com\r\nSubject: shared\r\n\r\n");
        assert!(store.contains("INBOX", &id));
        assert!(store.contains("Archive", &id));
    }
}
