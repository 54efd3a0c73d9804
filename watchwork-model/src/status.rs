use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one reporter: `Waiting` until dispatch, `Running` while the
/// body executes, `Terminated` once a terminal state is reached. There are
/// no further transitions out of `Terminated`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunState {
    Waiting,
    Running,
    Terminated,
}

/// One timestamped entry in a reporter's append-only message log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub at: DateTime<Utc>,
    pub text: String,
}

impl ProgressMessage {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            text: text.into(),
        }
    }
}

/// Point-in-time view of a reporter, suitable for a polling client.
///
/// `progress` is an informative hint in the range 0..=100, not load-bearing
/// for correctness. `succeeded` is meaningful once `state` is `Terminated`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub progress: u8,
    pub succeeded: bool,
    pub message_count: usize,
}

/// Status of one action execution as tracked by the task runner.
///
/// The core defines this data shape, not the transport; embedders expose it
/// over whatever polling surface they like.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub id: String,
    pub action: String,
    pub snapshot: StatusSnapshot,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
