//! Content-addressed artifact store
//!
//! Layout: `<root>/<sanitized mailbox>/<id>.eml` plus one `mailbox.json`
//! sidecar per mailbox directory. Existence of an artifact is a plain path
//! probe; stored bytes are never re-verified, so a truncated write is not
//! repaired by later runs.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{ArchivedMessageId, MailboxMetadata};

/// File extension of archived artifacts
pub const ARTIFACT_EXTENSION: &str = "eml";

/// Name of the per-mailbox metadata sidecar
pub const METADATA_FILE: &str = "mailbox.json";

/// Replacement for every character outside `[A-Za-z0-9]`
pub const PLACEHOLDER: char = '_';

/// Map a mailbox name to a directory name.
///
/// Distinct names can sanitize identically ("a.b" and "a/b"); such mailboxes
/// share a directory.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { PLACEHOLDER })
        .collect()
}

/// Filesystem store rooted at one account directory
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one mailbox's artifacts
    pub fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        self.root.join(sanitize(mailbox))
    }

    pub fn artifact_path(&self, mailbox: &str, id: &ArchivedMessageId) -> PathBuf {
        self.mailbox_dir(mailbox)
            .join(format!("{}.{}", id, ARTIFACT_EXTENSION))
    }

    /// Whether an artifact for `id` already exists in `mailbox`
    pub fn contains(&self, mailbox: &str, id: &ArchivedMessageId) -> bool {
        self.artifact_path(mailbox, id).exists()
    }

    /// Create the mailbox directory if needed
    pub fn ensure_mailbox_dir(&self, mailbox: &str) -> Result<PathBuf> {
        let dir = self.mailbox_dir(mailbox);
        std::fs::create_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;
        Ok(dir)
    }

    /// Write the full raw message; returns the artifact path
    pub fn write_artifact(
        &self,
        mailbox: &str,
        id: &ArchivedMessageId,
        raw: &[u8],
    ) -> Result<PathBuf> {
        self.ensure_mailbox_dir(mailbox)?;
        let path = self.artifact_path(mailbox, id);
        std::fs::write(&path, raw).map_err(|e| Error::storage(&path, e))?;
        debug!("Wrote {} bytes to {:?}", raw.len(), path);
        Ok(path)
    }

    /// Rewrite the mailbox sidecar unconditionally
    pub fn write_metadata(&self, meta: &MailboxMetadata) -> Result<PathBuf> {
        let dir = self.ensure_mailbox_dir(&meta.name)?;
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(&path, json).map_err(|e| Error::storage(&path, e))?;
        Ok(path)
    }

    /// Read a mailbox sidecar back
    pub fn read_metadata(&self, mailbox: &str) -> Result<Option<MailboxMetadata>> {
        let path = self.mailbox_dir(mailbox).join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| Error::storage(&path, e))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// Read an artifact's raw bytes
pub fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::storage(path, e))
}
