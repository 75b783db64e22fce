//! Incremental full-text indexing of the archive
//!
//! At startup the store root is scanned for artifacts the index does not know
//! yet, and those candidates are fed through the [`IndexingPipeline`] in the
//! background so queries are served while indexing catches up.

mod engine;
mod pipeline;
mod scanner;
mod schema;

pub use engine::*;
pub use pipeline::*;
pub use scanner::*;
pub use schema::MessageSchema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::IndexConfig;
use crate::error::{Error, Result};

/// Name of the index directory inside the archive root
pub const INDEX_DIR_NAME: &str = "index.tantivy";

/// Open (or create) the index belonging to an archive root
pub fn open_index(root: &Path, config: &IndexConfig) -> Result<Arc<IndexEngine>> {
    let engine = IndexEngine::open_or_create(&root.join(INDEX_DIR_NAME), config.writer_memory_bytes)?;
    Ok(Arc::new(engine))
}

/// Summary of one incremental indexing run
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexRunReport {
    pub candidates: usize,
    pub already_indexed: usize,
    pub duplicates: usize,
    pub walk_errors: usize,
    pub pipeline: PipelineReport,
}

/// Scan `root` and index every pending artifact on a background task
pub fn spawn_incremental_index(
    root: PathBuf,
    engine: Arc<IndexEngine>,
    config: IndexConfig,
) -> JoinHandle<Result<IndexRunReport>> {
    tokio::spawn(async move {
        let scan_engine = Arc::clone(&engine);
        let scan_root = root.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&scan_root, &scan_engine))
            .await
            .map_err(|e| Error::Other(format!("index scan panicked: {}", e)))??;

        let mut report = IndexRunReport {
            candidates: scanned.pending.len(),
            already_indexed: scanned.already_indexed,
            duplicates: scanned.duplicates,
            walk_errors: scanned.walk_errors,
            pipeline: PipelineReport::default(),
        };
        if scanned.pending.is_empty() {
            info!("Index of {:?} is up to date", root);
            return Ok(report);
        }

        let pipeline = IndexingPipeline::start(engine, &config);
        let fed = pipeline.feed(scanned.pending).await;
        report.pipeline = pipeline.stop().await?;
        fed?;
        Ok(report)
    })
}
