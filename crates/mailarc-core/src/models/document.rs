//! Search index document derived from an archived artifact

use std::path::{Path, PathBuf};

use mail_parser::{Address, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

use super::ArchivedMessageId;
use crate::error::{Error, Result};

/// Structured fields extracted from one archived message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: ArchivedMessageId,

    /// Location of the artifact this document was built from
    pub path: PathBuf,

    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,

    /// Plain-text body
    pub body: String,

    /// Attachment file names, space separated
    pub attachments: String,

    pub attachment_count: u64,

    /// Raw message size in bytes
    pub size: u64,
}

impl IndexDocument {
    /// Parse raw artifact bytes into an index document
    pub fn from_artifact(id: ArchivedMessageId, path: &Path, raw: &[u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Parse {
                path: path.to_path_buf(),
                reason: "not an RFC 5322 message".to_string(),
            })?;

        let mut attachments = String::new();
        let mut attachment_count = 0u64;
        for part in message.attachments() {
            attachments.push(' ');
            attachments.push_str(part.attachment_name().unwrap_or_default());
            attachment_count += 1;
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            subject: message.subject().unwrap_or_default().to_string(),
            from: format_addresses(message.from()),
            to: format_addresses(message.to()),
            cc: format_addresses(message.cc()),
            body: message
                .body_text(0)
                .map(|body| body.into_owned())
                .unwrap_or_default(),
            attachments,
            attachment_count,
            size: raw.len() as u64,
        })
    }
}

/// Render an address header as `Name <addr>, addr, ...`
fn format_addresses(addresses: Option<&Address<'_>>) -> String {
    addresses
        .map(|addrs| {
            addrs
                .iter()
                .map(|addr| match (addr.name(), addr.address()) {
                    (Some(name), Some(email)) => format!("{} <{}>", name, email),
                    (None, Some(email)) => email.to_string(),
                    (Some(name), None) => name.to_string(),
                    (None, None) => String::new(),
                })
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}
