//! Search over the message index
//!
//! Turns ranked index hits into display entries: subject as title, a short
//! single-line body preview, a human readable size and a download link.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::error::Result;
use crate::index::IndexEngine;
use crate::models::{ArchivedMessageId, IndexDocument};
use crate::store::read_artifact;

/// Route prefix of artifact downloads
pub const DOWNLOAD_PREFIX: &str = "/download/";

/// One displayed hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchEntry {
    pub title: String,
    pub body_preview: String,
    pub download_link: String,
    pub size_label: String,
    pub attachment_count: u64,
}

/// Result page for one query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchPage {
    pub query: String,
    /// All matches, including those beyond the hit limit
    pub total_count: usize,
    pub shown_count: usize,
    pub entries: Vec<SearchEntry>,
}

/// Read-only query front end
pub struct SearchService {
    engine: Arc<IndexEngine>,
    max_hits: usize,
    preview_chars: usize,
}

impl SearchService {
    pub fn new(engine: Arc<IndexEngine>, config: &SearchConfig) -> Self {
        Self {
            engine,
            max_hits: config.max_hits,
            preview_chars: config.preview_chars,
        }
    }

    /// Run a free-text query; an empty query yields an empty page
    pub fn search(&self, query: &str) -> Result<SearchPage> {
        let mut page = SearchPage {
            query: query.to_string(),
            ..Default::default()
        };
        if query.trim().is_empty() {
            return Ok(page);
        }

        let hits = self.engine.query(query, self.max_hits)?;
        debug!("Query {:?} matched {} documents", query, hits.total);

        page.total_count = hits.total;
        page.entries = hits
            .documents
            .iter()
            .map(|document| self.entry(document))
            .collect();
        page.shown_count = page.entries.len();
        Ok(page)
    }

    /// Raw bytes of an archived message, or `None` for unknown ids
    pub fn download(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(id) = ArchivedMessageId::parse(id) else {
            warn!("Rejected download of invalid id {:?}", id);
            return Ok(None);
        };
        match self.engine.get_document(&id)? {
            Some(document) => Ok(Some(read_artifact(&document.path)?)),
            None => Ok(None),
        }
    }

    fn entry(&self, document: &IndexDocument) -> SearchEntry {
        SearchEntry {
            title: document.subject.clone(),
            body_preview: body_preview(&document.body, self.preview_chars),
            download_link: format!("{}{}", DOWNLOAD_PREFIX, document.id),
            size_label: format_size(document.size),
            attachment_count: document.attachment_count,
        }
    }
}

/// First `max_chars` characters on a single line, `...` marking truncation
pub fn body_preview(body: &str, max_chars: usize) -> String {
    let mut preview: String = body.chars().take(max_chars).collect();
    if body.chars().nth(max_chars).is_some() {
        preview.push_str("...");
    }
    preview.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// `"<n> Byte"`, `"<n> KiB"` or `"<n> MiB"` with integer truncation
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes;
    let mut unit = "Byte";
    if value > 1024 {
        value /= 1024;
        unit = "KiB";
    }
    if value > 1024 {
        value /= 1024;
        unit = "MiB";
    }
    format!("{} {}", value, unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::path::Path;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 Byte");
        assert_eq!(format_size(1024), "1024 Byte");
        assert_eq!(format_size(2048), "2 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MiB");
        assert_eq!(format_size(1024 * 1024), "1024 KiB");
    }

    #[test]
    fn test_body_preview() {
        assert_eq!(body_preview("line one\r\nline two\nend\r", 200), "line one line two end ");
        let long = "x".repeat(250);
        let preview = body_preview(&long, 200);
        assert_eq!(preview.len(), 203);
        assert!(preview.ends_with("..."));
        assert_eq!(body_preview(&"é".repeat(200), 200).chars().count(), 200);
    }

    fn archive_and_index(root: &Path, engine: &IndexEngine, subject: &str, body: &str) -> ArchivedMessageId {
        let store = Store::new(root);
        let header = format!("From: shop@example.com\r\nSubject: {}\r\n\r\n", subject);
        let id = ArchivedMessageId::from_header(header.as_bytes());
        let raw = format!("{}{}\r\n", header, body);
        let path = store.write_artifact("INBOX", &id, raw.as_bytes()).unwrap();

        let mut batch = engine.new_batch();
        batch.push(IndexDocument::from_artifact(id.clone(), &path, raw.as_bytes()).unwrap());
        engine.apply_batch(batch).unwrap();
        id
    }

    fn service(dir: &Path) -> (SearchService, Arc<IndexEngine>) {
        let engine =
            Arc::new(IndexEngine::open_or_create(&dir.join("index"), 50_000_000).unwrap());
        (
            SearchService::new(Arc::clone(&engine), &SearchConfig::default()),
            engine,
        )
    }

    #[test]
    fn test_query_returns_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service(dir.path());
        let root = dir.path().join("archive");
        let march = archive_and_index(&root, &engine, "Invoice March", "Total due:\r\n42 EUR");
        archive_and_index(&root, &engine, "Invoice April", "Total due: 17 EUR");
        archive_and_index(&root, &engine, "Lunch on Friday", "See you there");

        let page = service.search("Invoice").unwrap();
        assert_eq!(page.query, "Invoice");
        assert_eq!(page.total_count, 2);
        assert_eq!(page.shown_count, 2);
        assert!(page.entries.iter().all(|e| e.title.starts_with("Invoice")));

        let entry = page
            .entries
            .iter()
            .find(|e| e.title == "Invoice March")
            .unwrap();
        assert_eq!(entry.download_link, format!("/download/{}", march));
        assert!(entry.body_preview.starts_with("Total due: 42 EUR"));
        assert!(!entry.body_preview.contains(['\r', '\n']));
        assert!(entry.size_label.ends_with(" Byte"));
        assert_eq!(entry.attachment_count, 0);
    }

    #[test]
    fn test_subject_style_query_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service(dir.path());
        let root = dir.path().join("archive");
        archive_and_index(&root, &engine, "Re: invoice", "Paid yesterday");
        archive_and_index(&root, &engine, "Lunch on Friday", "See you there");

        let page = service.search("Re: invoice").unwrap();
        assert_eq!(page.query, "Re: invoice");
        assert!(page.total_count <= 1);
        assert!(page.entries.iter().all(|e| e.title == "Re: invoice"));

        assert!(service.search("Invoice AND").is_ok());
    }

    #[test]
    fn test_empty_query_is_an_empty_page() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service(dir.path());
        archive_and_index(&dir.path().join("archive"), &engine, "Anything", "at all");

        let page = service.search("   ").unwrap();
        assert_eq!(page.total_count, 0);
        assert!(page.entries.is_empty());
    }

    #[test]
    fn test_download_resolves_indexed_artifacts_only() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service(dir.path());
        let id = archive_and_index(&dir.path().join("archive"), &engine, "Receipt", "paid");

        let raw = service.download(id.as_str()).unwrap().unwrap();
        assert!(raw.starts_with(b"From: shop@example.com"));
        assert_eq!(service.download("../../etc/passwd").unwrap(), None);
        let unknown = ArchivedMessageId::from_header(b"Subject: unknown\r\n\r\n");
        assert_eq!(service.download(unknown.as_str()).unwrap(), None);
    }
}
