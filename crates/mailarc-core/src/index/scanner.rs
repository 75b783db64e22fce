//! Candidate discovery: artifacts on disk that the index does not know yet

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use jwalk::WalkDir;
use tracing::{debug, info, warn};

use super::IndexEngine;
use crate::error::Result;
use crate::models::ArchivedMessageId;
use crate::store::ARTIFACT_EXTENSION;

/// An artifact waiting to be indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: ArchivedMessageId,
    pub path: PathBuf,
}

/// Outcome of one scan over the store root
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Artifacts not yet in the index, one per id
    pub pending: Vec<Candidate>,
    pub already_indexed: usize,
    /// Artifacts whose id was already seen in another mailbox
    pub duplicates: usize,
    /// Entries the walk could not read
    pub walk_errors: usize,
}

/// Walk `root` and partition artifacts into indexed and pending
pub fn scan(root: &Path, engine: &IndexEngine) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut seen = HashSet::new();

    for entry in WalkDir::new(root).sort(true).skip_hidden(true).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", root, e);
                report.walk_errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION) {
            continue;
        }
        let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(ArchivedMessageId::parse)
        else {
            debug!("Ignoring {:?}: file name is not a message id", path);
            continue;
        };

        if !seen.insert(id.clone()) {
            report.duplicates += 1;
            continue;
        }
        if engine.contains(&id)? {
            report.already_indexed += 1;
        } else {
            report.pending.push(Candidate { id, path });
        }
    }

    info!(
        "Scanned {:?}: {} to index, {} already indexed, {} duplicates",
        root,
        report.pending.len(),
        report.already_indexed,
        report.duplicates
    );
    Ok(report)
}
