//! Polling change detection over a directory tree.
//!
//! [`ChangeScanner`] walks its root on every call to [`ChangeScanner::scan`],
//! fingerprints each file, and reports `New`/`Modified`/`Deleted` events.
//! Two fingerprint tables are kept per scanner: `last` holds the most recent
//! observation of every path, `reported` holds what was last reported to the
//! caller. A file is reported only when its new fingerprint matches the
//! previous observation (it has settled since the last scan) and differs
//! from what was last reported, unless the caller forces immediate
//! reporting. The settle requirement exists to avoid reporting a file while
//! it is still being written; it can still misfire for writers slower than
//! the scan interval or for coarse mtime clocks, an accepted approximation.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::{Result, WatchworkError};
use watchwork_model::{ChangeEvent, ChangeKind, FileFingerprint};

/// Configuration for fingerprint capture.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Number of leading bytes hashed into the content digest. `0` disables
    /// content sampling entirely, relying on size and mtime only; keeping
    /// the prefix bounded keeps large-file scans cheap.
    pub checksum_prefix: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            checksum_prefix: 64 * 1024,
        }
    }
}

/// Stateful polling scanner for one directory tree.
#[derive(Debug)]
pub struct ChangeScanner {
    root: PathBuf,
    config: ScannerConfig,
    /// Fingerprint observed on the previous scan, per path.
    last: HashMap<PathBuf, FileFingerprint>,
    /// Fingerprint last reported to the caller, per path.
    reported: HashMap<PathBuf, FileFingerprint>,
}

impl ChangeScanner {
    pub fn new(root: impl Into<PathBuf>, config: ScannerConfig) -> Self {
        Self {
            root: root.into(),
            config,
            last: HashMap::new(),
            reported: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree and report confirmed changes, at most one event per
    /// path per cycle, sorted by path.
    ///
    /// With `force_immediate` set every difference from the reported state
    /// is emitted right away, skipping the settle heuristic.
    pub async fn scan(&mut self, force_immediate: bool) -> Result<Vec<ChangeEvent>> {
        let mut files = Vec::new();
        collect_files(&self.root, &mut files).await?;

        let mut current: HashMap<PathBuf, FileFingerprint> = HashMap::with_capacity(files.len());
        for path in files {
            match capture_fingerprint(&path, self.config.checksum_prefix).await {
                Ok(fingerprint) => {
                    current.insert(path, fingerprint);
                }
                // The file may have vanished between the walk and the
                // capture; treat it as absent from this cycle.
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        let mut events = Vec::new();

        for (path, fingerprint) in &current {
            let settled = force_immediate || self.last.get(path) == Some(fingerprint);
            let differs = self.reported.get(path) != Some(fingerprint);
            if settled && differs {
                let kind = if self.reported.contains_key(path) {
                    ChangeKind::Modified
                } else {
                    ChangeKind::New
                };
                events.push(ChangeEvent::new(path.clone(), kind));
                self.reported.insert(path.clone(), fingerprint.clone());
            }
        }

        // Any previously tracked path absent from this walk is gone, even
        // if its first report was still settling.
        let mut vanished: Vec<PathBuf> = self
            .last
            .keys()
            .chain(self.reported.keys())
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();
        vanished.sort();
        vanished.dedup();
        for path in vanished {
            self.last.remove(&path);
            self.reported.remove(&path);
            events.push(ChangeEvent::deleted(path));
        }

        self.last = current;

        events.sort_by(|a, b| a.path.cmp(&b.path));
        if !events.is_empty() {
            debug!(
                "Scan of {} reported {} change(s)",
                self.root.display(),
                events.len()
            );
        }
        Ok(events)
    }
}

/// Capture a fingerprint for one file: size, mtime, and (when
/// `checksum_prefix > 0`) a SHA-256 digest over the leading bytes.
pub async fn capture_fingerprint(path: &Path, checksum_prefix: usize) -> Result<FileFingerprint> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(WatchworkError::Internal(format!(
            "Not a regular file: {}",
            path.display()
        )));
    }

    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let prefix_digest = if checksum_prefix > 0 {
        Some(digest_prefix(path, checksum_prefix).await?)
    } else {
        None
    };

    Ok(FileFingerprint::new(metadata.len(), mtime_ms, prefix_digest))
}

async fn digest_prefix(path: &Path, limit: usize) -> Result<String> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = file.take(limit as u64);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files<'a>(
    dir: &'a Path,
    out: &'a mut Vec<PathBuf>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read directory {}: {}", dir.display(), e);
                return Ok(());
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                collect_files(&path, out).await?;
            } else if file_type.is_file() {
                out.push(path);
            }
        }

        Ok(())
    })
}
