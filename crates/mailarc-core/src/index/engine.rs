//! Full-text index engine over tantivy
//!
//! Opening the engine never takes the index writer lock: the writer is created
//! on the first applied batch and then kept for the engine's lifetime, so any
//! number of read-only engines (search, download) can share an index with one
//! indexing process. Every batch is a single commit; the reader follows commits
//! made by this engine immediately and commits of other processes shortly
//! after.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, error, info};

use super::schema::MessageSchema;
use crate::error::{Error, Result};
use crate::models::{ArchivedMessageId, IndexDocument};

/// Buffered, uncommitted index writes
#[derive(Debug, Default)]
pub struct PendingBatch {
    documents: Vec<IndexDocument>,
}

impl PendingBatch {
    pub fn push(&mut self, document: IndexDocument) {
        self.documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[IndexDocument] {
        &self.documents
    }
}

/// Ranked query result
#[derive(Debug, Clone, Default)]
pub struct SearchHits {
    /// Number of matching documents, independent of the hit limit
    pub total: usize,
    /// Best matches first
    pub documents: Vec<IndexDocument>,
}

/// Persistent message index keyed by [`ArchivedMessageId`]
pub struct IndexEngine {
    index: Index,
    schema: MessageSchema,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    writer_memory_bytes: usize,
    query_parser: QueryParser,
    path: PathBuf,
}

impl IndexEngine {
    /// Open the index at `path`, creating it if it does not exist
    pub fn open_or_create(path: &Path, writer_memory_bytes: usize) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| Error::storage(path, e))?;

        let schema = MessageSchema::new();
        let directory = MmapDirectory::open(path).map_err(tantivy::TantivyError::from)?;
        let index = Index::open_or_create(directory, schema.schema.clone())?;

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let query_parser = QueryParser::for_index(&index, schema.default_search_fields());

        let engine = Self {
            index,
            schema,
            reader,
            writer: Mutex::new(None),
            writer_memory_bytes,
            query_parser,
            path: path.to_path_buf(),
        };
        info!(
            "Opened message index at {:?} ({} documents)",
            engine.path,
            engine.num_docs()
        );
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn new_batch(&self) -> PendingBatch {
        PendingBatch::default()
    }

    /// Upsert every document of the batch in one commit.
    ///
    /// The first call acquires the index writer lock and fails while another
    /// engine holds it. On failure the writer is rolled back and nothing of the
    /// batch becomes visible.
    pub fn apply_batch(&self, batch: PendingBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let writer: IndexWriter = self.index.writer(self.writer_memory_bytes)?;
            debug!("Acquired index writer for {:?}", self.path);
            *guard = Some(writer);
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::IndexApply("index writer unavailable".to_string()))?;

        let result = (|| -> tantivy::Result<()> {
            for document in &batch.documents {
                writer.delete_term(Term::from_field_text(self.schema.id, document.id.as_str()));
                writer.add_document(self.build_document(document))?;
            }
            writer.commit()?;
            Ok(())
        })();

        if let Err(e) = result {
            error!("Index batch of {} documents failed: {}", count, e);
            if let Err(rollback_err) = writer.rollback() {
                error!("Index rollback failed: {}", rollback_err);
            }
            return Err(Error::IndexApply(e.to_string()));
        }
        drop(guard);

        self.reader.reload()?;
        debug!("Committed {} documents to the index", count);
        Ok(count)
    }

    /// Indexed document for `id`, if any
    pub fn get_document(&self, id: &ArchivedMessageId) -> Result<Option<IndexDocument>> {
        let searcher = self.reader.searcher();
        let top = searcher.search(&self.id_query(id), &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(self.read_document(&doc))
            }
            None => Ok(None),
        }
    }

    /// Whether `id` is represented in the committed index
    pub fn contains(&self, id: &ArchivedMessageId) -> Result<bool> {
        let searcher = self.reader.searcher();
        Ok(searcher.search(&self.id_query(id), &Count)? > 0)
    }

    /// Number of committed documents
    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Free-text query over subject, addresses, body and attachment names.
    ///
    /// Parsing is lenient: mail subjects are full of colons ("Re: ...",
    /// "10:30") that the strict grammar would reject, so unparseable parts are
    /// dropped instead of failing the whole query.
    pub fn query(&self, text: &str, max_hits: usize) -> Result<SearchHits> {
        let (query, errors) = self.query_parser.parse_query_lenient(text);
        for e in &errors {
            debug!("Ignoring part of query {:?}: {}", text, e);
        }
        let searcher = self.reader.searcher();

        let total = searcher.search(&query, &Count)?;
        let top = searcher.search(&query, &TopDocs::with_limit(max_hits.max(1)))?;

        let mut documents = Vec::with_capacity(top.len());
        for (_score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(document) = self.read_document(&doc) {
                documents.push(document);
            }
        }
        Ok(SearchHits { total, documents })
    }

    fn id_query(&self, id: &ArchivedMessageId) -> TermQuery {
        TermQuery::new(
            Term::from_field_text(self.schema.id, id.as_str()),
            IndexRecordOption::Basic,
        )
    }

    fn build_document(&self, document: &IndexDocument) -> TantivyDocument {
        let schema = &self.schema;
        let mut doc = TantivyDocument::default();
        doc.add_text(schema.id, document.id.as_str());
        doc.add_text(schema.path, document.path.to_string_lossy());
        doc.add_text(schema.subject, &document.subject);
        doc.add_text(schema.from, &document.from);
        doc.add_text(schema.to, &document.to);
        doc.add_text(schema.cc, &document.cc);
        doc.add_text(schema.body, &document.body);
        doc.add_text(schema.attachments, &document.attachments);
        doc.add_u64(schema.attachment_count, document.attachment_count);
        doc.add_u64(schema.size, document.size);
        doc
    }

    fn read_document(&self, doc: &TantivyDocument) -> Option<IndexDocument> {
        let schema = &self.schema;
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let number = |field: Field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0);

        Some(IndexDocument {
            id: ArchivedMessageId::parse(&text(schema.id))?,
            path: PathBuf::from(text(schema.path)),
            subject: text(schema.subject),
            from: text(schema.from),
            to: text(schema.to),
            cc: text(schema.cc),
            body: text(schema.body),
            attachments: text(schema.attachments),
            attachment_count: number(schema.attachment_count),
            size: number(schema.size),
        })
    }
}
