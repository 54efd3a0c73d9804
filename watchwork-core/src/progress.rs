//! Progress reporting for action executions.
//!
//! A [`ProgressReporter`] accumulates timestamped messages and tracks a
//! three-state lifecycle (waiting, running, terminated) plus a success flag.
//! Termination is idempotent: the first terminal transition wins and every
//! later attempt is an observable no-op, which is what lets a timeout race a
//! natural completion without double-firing continuation chains.
//!
//! A nested reporter ([`ProgressReporter::nested`]) shares the parent's
//! message log, so the top-level caller sees one flat log, but keeps its own
//! lifecycle and success state so an inner action's termination can be
//! observed locally without being confused with the outer reporter's
//! eventual terminal state.

use std::fmt;
use std::sync::{Arc, Mutex};

use watchwork_model::{ProgressMessage, RunState, StatusSnapshot};

struct ReporterState {
    state: RunState,
    progress: u8,
    succeeded: bool,
    failure: Option<String>,
}

/// Thread-safe progress monitor passed through the whole action call graph.
pub struct ProgressReporter {
    log: Arc<Mutex<Vec<ProgressMessage>>>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(ReporterState {
                state: RunState::Waiting,
                progress: 0,
                succeeded: false,
                failure: None,
            }),
        })
    }

    /// A reporter sharing this reporter's message log with fresh,
    /// independent lifecycle state.
    pub fn nested(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::clone(&self.log),
            state: Mutex::new(ReporterState {
                state: RunState::Waiting,
                progress: 0,
                succeeded: false,
                failure: None,
            }),
        })
    }

    /// Waiting -> Running. A no-op once running or terminated.
    pub fn begin(&self) {
        let mut state = self.state.lock().expect("reporter state poisoned");
        if state.state == RunState::Waiting {
            state.state = RunState::Running;
        }
    }

    /// Append a message to the shared log.
    pub fn message(&self, text: impl Into<String>) {
        let mut log = self.log.lock().expect("reporter log poisoned");
        log.push(ProgressMessage::now(text));
    }

    /// Update the progress hint. Ignored once terminated.
    pub fn set_progress(&self, progress: u8) {
        let mut state = self.state.lock().expect("reporter state poisoned");
        if state.state != RunState::Terminated {
            state.progress = progress.min(100);
        }
    }

    /// Terminate successfully. Returns whether this call performed the
    /// transition; `false` means the reporter was already terminated and
    /// nothing changed.
    pub fn terminate_success(&self) -> bool {
        let mut state = self.state.lock().expect("reporter state poisoned");
        if state.state == RunState::Terminated {
            return false;
        }
        state.state = RunState::Terminated;
        state.succeeded = true;
        state.progress = 100;
        true
    }

    /// Terminate with a failure message. Returns whether this call
    /// performed the transition; a losing transition records nothing.
    pub fn terminate_failure(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        {
            let mut state = self.state.lock().expect("reporter state poisoned");
            if state.state == RunState::Terminated {
                return false;
            }
            state.state = RunState::Terminated;
            state.succeeded = false;
            state.failure = Some(message.clone());
        }
        self.message(message);
        true
    }

    pub fn state(&self) -> RunState {
        self.state.lock().expect("reporter state poisoned").state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == RunState::Terminated
    }

    pub fn succeeded(&self) -> bool {
        self.state.lock().expect("reporter state poisoned").succeeded
    }

    pub fn progress(&self) -> u8 {
        self.state.lock().expect("reporter state poisoned").progress
    }

    /// The message recorded by the winning `terminate_failure`, if any.
    pub fn failure_message(&self) -> Option<String> {
        self.state
            .lock()
            .expect("reporter state poisoned")
            .failure
            .clone()
    }

    pub fn message_count(&self) -> usize {
        self.log.lock().expect("reporter log poisoned").len()
    }

    /// Messages appended at or after `offset`, for polling clients that
    /// only want what is new since their last poll.
    pub fn messages_since(&self, offset: usize) -> Vec<ProgressMessage> {
        let log = self.log.lock().expect("reporter log poisoned");
        log.get(offset..).unwrap_or_default().to_vec()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().expect("reporter state poisoned");
        StatusSnapshot {
            state: state.state,
            progress: state.progress,
            succeeded: state.succeeded,
            message_count: self.log.lock().expect("reporter log poisoned").len(),
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ProgressReporter")
            .field("state", &snapshot.state)
            .field("progress", &snapshot.progress)
            .field("succeeded", &snapshot.succeeded)
            .field("message_count", &snapshot.message_count)
            .finish()
    }
}
