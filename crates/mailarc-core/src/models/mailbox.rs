//! Mailbox data structures

use serde::{Deserialize, Serialize};

/// A remote mailbox and its message count, refreshed on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxDescriptor {
    /// Server-side mailbox name (e.g., "INBOX", "Archive/2023")
    pub name: String,

    /// Number of messages reported by the server
    pub message_count: u32,
}

impl MailboxDescriptor {
    pub fn new(name: impl Into<String>, message_count: u32) -> Self {
        Self {
            name: name.into(),
            message_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }
}

/// Descriptive sidecar written next to a mailbox's artifacts.
///
/// Rewritten unconditionally on every run (last write wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMetadata {
    pub name: String,
    pub server: String,
    pub login: String,
    pub count: u32,
}
