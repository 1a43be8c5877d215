//! Optional operation-table snapshot.
//!
//! On graceful shutdown the hub serializes `{ version, operations }` to a
//! single JSON file; on startup it reloads best-effort. The write is atomic
//! (temp file + rename) so a crash mid-write never corrupts the previous
//! snapshot. A version mismatch discards the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::operations::{Operation, OperationManager};

/// Bump when the snapshot layout changes; older files are discarded.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    operations: Vec<Operation>,
}

/// Serialize the operation table atomically.
pub fn save(manager: &OperationManager, path: &Path) -> Result<usize, SnapshotError> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        operations: manager.export(),
    };
    let count = snapshot.operations.len();
    let encoded = serde_json::to_vec_pretty(&snapshot)?;

    let tmp = path.with_extension("json.tmp");
    let io = |source| SnapshotError::Write {
        path: path.display().to_string(),
        source,
    };
    std::fs::write(&tmp, &encoded).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)?;

    info!(path = %path.display(), operations = count, "operation snapshot written");
    Ok(count)
}

/// Best-effort reload. Missing file, parse failure, and version mismatch all
/// come back as zero operations loaded; only the mismatch is worth a warning.
pub fn load(manager: &OperationManager, path: &Path) -> usize {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return 0,
    };

    let snapshot: Snapshot = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable snapshot");
            return 0;
        }
    };

    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            found = snapshot.version,
            expected = SNAPSHOT_VERSION,
            "discarding snapshot with mismatched version"
        );
        return 0;
    }

    let count = snapshot.operations.len();
    manager.import(snapshot.operations);
    info!(path = %path.display(), operations = count, "operation snapshot loaded");
    count
}
