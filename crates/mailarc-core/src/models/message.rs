//! Archived message identity and envelope data

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

/// Content address of an archived message.
///
/// Lowercase hex SHA-224 of the raw header bytes. The same header bytes always
/// map to the same id, whatever mailbox or sequence number they came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchivedMessageId(String);

impl ArchivedMessageId {
    /// Length of the hex digest
    pub const LEN: usize = 56;

    /// Compute the id from a message's header bytes
    pub fn from_header(header: &[u8]) -> Self {
        Self(hex::encode(Sha224::digest(header)))
    }

    /// Accept an existing id (e.g. a file stem or download reference)
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == Self::LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArchivedMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchivedMessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Position of a message in the selected mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Sequence number (unstable across expunges)
    pub seq: u32,

    /// IMAP UID, when the server returned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
}

impl MessageRef {
    pub fn new(seq: u32, uid: Option<u32>) -> Self {
        Self { seq, uid }
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.uid {
            Some(uid) => write!(f, "{} (uid {})", self.seq, uid),
            None => write!(f, "{}", self.seq),
        }
    }
}

/// Sender as reported in the IMAP envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeAddress {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

/// Subset of the IMAP envelope used for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub from: Vec<EnvelopeAddress>,
    pub subject: Option<String>,
    pub date: Option<String>,
}

impl Envelope {
    /// Best-effort one-line title: `Name<mailbox@host> subject date`
    pub fn title(&self) -> String {
        let mut title = String::new();
        for addr in &self.from {
            title.push_str(addr.name.as_deref().unwrap_or_default());
            title.push('<');
            title.push_str(addr.mailbox.as_deref().unwrap_or_default());
            title.push('@');
            title.push_str(addr.host.as_deref().unwrap_or_default());
            title.push('>');
        }
        title.push(' ');
        title.push_str(self.subject.as_deref().unwrap_or_default());
        title.push(' ');
        title.push_str(self.date.as_deref().unwrap_or_default());
        title
    }
}

/// Result of the batched metadata fetch for one message
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub reference: MessageRef,
    pub envelope: Envelope,
    /// Raw RFC 822 header bytes
    pub header: Vec<u8>,
    /// RFC822.SIZE
    pub size: Option<u32>,
}

impl MessageSummary {
    pub fn id(&self) -> ArchivedMessageId {
        ArchivedMessageId::from_header(&self.header)
    }
}

/// A message whose full body could not be retrieved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnprocessableRecord {
    pub mailbox: String,
    pub reference: MessageRef,
    pub title: String,
    pub reason: String,
}

impl std::fmt::Display for UnprocessableRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.title)
    }
}
