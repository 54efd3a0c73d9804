use serde::{Deserialize, Serialize};

/// A cheap summary of one file's observable state.
///
/// Structural equality of two fingerprints for the same path means "no
/// observed change", not "no change": writes landing within the mtime
/// clock's resolution without changing size or the sampled prefix are
/// invisible, a known limitation of the scheme.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
    /// Hex SHA-256 digest of a bounded content prefix, when sampling is
    /// enabled.
    pub prefix_digest: Option<String>,
}

impl FileFingerprint {
    pub fn new(size: u64, mtime_ms: i64, prefix_digest: Option<String>) -> Self {
        Self {
            size,
            mtime_ms,
            prefix_digest,
        }
    }
}
