//! Core data model definitions shared across Watchwork crates.
//!
//! Everything here is a plain, serializable data shape: change events
//! produced by the scanners and watchers, file fingerprints used for change
//! detection, the status snapshots exposed by progress reporters, and the
//! action-document payloads consumed by the decoder. No I/O, no async.
#![allow(missing_docs)]

pub mod doc;
pub mod event;
pub mod fingerprint;
pub mod status;

// Intentionally curated re-exports for downstream consumers.
pub use doc::{ActionDoc, ComponentRef, ScriptArgs};
pub use event::{ChangeEvent, ChangeKind};
pub use fingerprint::FileFingerprint;
pub use status::{ExecutionStatus, ProgressMessage, RunState, StatusSnapshot};
