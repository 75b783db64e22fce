//! Concurrent indexing pipeline
//!
//! One producer feeds candidates into a bounded queue; N blocking workers read
//! and parse artifacts and append the resulting documents to a shared batch.
//! The batch lock is the only point where workers synchronize, and every
//! apply to the engine happens while holding it, so at most one apply is in
//! flight at any time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Candidate, IndexEngine, PendingBatch};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::models::IndexDocument;
use crate::store::read_artifact;

/// Counters of one pipeline lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    /// Candidates handed to the queue
    pub submitted: usize,
    /// Documents committed to the index
    pub indexed: usize,
    /// Candidates that could not be read or parsed
    pub failed: usize,
    /// Successful batch applies
    pub flushes: usize,
    /// Batches dropped after a failed apply
    pub discarded_batches: usize,
    pub discarded_documents: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    indexed: AtomicUsize,
    failed: AtomicUsize,
    flushes: AtomicUsize,
    discarded_batches: AtomicUsize,
    discarded_documents: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> PipelineReport {
        PipelineReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            discarded_batches: self.discarded_batches.load(Ordering::Relaxed),
            discarded_documents: self.discarded_documents.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the producer and the workers
struct Shared {
    engine: Arc<IndexEngine>,
    batch: Mutex<PendingBatch>,
    counters: Counters,
}

impl Shared {
    /// Hand the current batch to the engine and start a new one
    fn flush(&self) -> usize {
        let mut batch = self.batch.lock();
        if batch.is_empty() {
            return 0;
        }
        let pending = std::mem::replace(&mut *batch, self.engine.new_batch());
        let count = pending.len();

        match self.engine.apply_batch(pending) {
            Ok(applied) => {
                self.counters.indexed.fetch_add(applied, Ordering::Relaxed);
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                applied
            }
            Err(e) => {
                error!("Discarding batch of {} documents: {}", count, e);
                self.counters.discarded_batches.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .discarded_documents
                    .fetch_add(count, Ordering::Relaxed);
                0
            }
        }
    }

    fn process(&self, candidate: Candidate) {
        let document = read_artifact(&candidate.path)
            .and_then(|raw| IndexDocument::from_artifact(candidate.id, &candidate.path, &raw));
        match document {
            Ok(document) => {
                #[cfg(test)]
                tests::worker_jitter(&document);
                self.batch.lock().push(document)
            }
            Err(e) => {
                warn!("Cannot index {:?}: {}", candidate.path, e);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Owned indexing pipeline with an explicit start/stop lifecycle
pub struct IndexingPipeline {
    shared: Arc<Shared>,
    sender: Option<flume::Sender<Candidate>>,
    workers: Vec<JoinHandle<()>>,
}

impl IndexingPipeline {
    /// Spawn the worker pool; must be called inside a tokio runtime
    pub fn start(engine: Arc<IndexEngine>, config: &IndexConfig) -> Self {
        let worker_count = config.worker_count();
        let (sender, receiver) = flume::bounded::<Candidate>(config.queue_capacity());
        let shared = Arc::new(Shared {
            batch: Mutex::new(engine.new_batch()),
            engine,
            counters: Counters::default(),
        });

        let workers = (0..worker_count)
            .map(|worker| {
                let receiver = receiver.clone();
                let shared = Arc::clone(&shared);
                tokio::task::spawn_blocking(move || {
                    while let Ok(candidate) = receiver.recv() {
                        shared.process(candidate);
                    }
                    debug!("Index worker {} finished", worker);
                })
            })
            .collect();

        info!(
            "Indexing pipeline started with {} workers (queue capacity {})",
            worker_count,
            config.queue_capacity()
        );
        Self {
            shared,
            sender: Some(sender),
            workers,
        }
    }

    /// Queue one candidate, waiting while the queue is full
    pub async fn submit(&self, candidate: Candidate) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Other("indexing pipeline is stopped".to_string()))?;
        sender
            .send_async(candidate)
            .await
            .map_err(|_| Error::Other("indexing workers are gone".to_string()))?;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submit all candidates, flushing each time another whole percent of
    /// them has been handed off
    pub async fn feed(&self, candidates: Vec<Candidate>) -> Result<()> {
        let total = candidates.len();
        let mut last_percent = 0;

        for (handed_off, candidate) in (1..).zip(candidates) {
            self.submit(candidate).await?;

            let percent = handed_off * 100 / total;
            if percent > last_percent {
                last_percent = percent;
                info!("Indexing {}% ({}/{})", percent, handed_off, total);
                self.flush_in_background().await?;
            }
        }
        Ok(())
    }

    /// Apply whatever the workers have produced so far; returns the number of
    /// documents committed
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Counters so far
    pub fn report(&self) -> PipelineReport {
        self.shared.counters.snapshot()
    }

    async fn flush_in_background(&self) -> Result<usize> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.flush())
            .await
            .map_err(|e| Error::Other(format!("index flush panicked: {}", e)))
    }

    /// Close the queue, wait for the workers to drain it and flush the rest
    pub async fn stop(mut self) -> Result<PipelineReport> {
        self.sender.take();
        for worker in self.workers.drain(..) {
            worker
                .await
                .map_err(|e| Error::Other(format!("index worker panicked: {}", e)))?;
        }
        self.flush_in_background().await?;

        let report = self.report();
        info!(
            "Indexing finished: {} indexed, {} failed, {} batches discarded",
            report.indexed, report.failed, report.discarded_batches
        );
        Ok(report)
    }
}
