//! The composable action model.
//!
//! An [`Action`] is a named, asynchronously runnable unit of work with
//! optional success/error continuations, an optional timeout, and an
//! optional trigger pattern. Actions form a directed acyclic graph via
//! continuation and component edges; compound variants reference their
//! members either directly or by name through an [`ActionRef`].
//!
//! Name binding is a two-phase construct-then-resolve protocol: the graph
//! is built first and name references are bound second, so forward
//! references within one document are legal. Resolution is idempotent and
//! an unresolvable name is a fatal configuration error raised eagerly at
//! resolve time, never at run time.

pub mod catalog;
pub mod decode;
mod parallel;
mod script;
mod sequence;
mod simple;
mod wrapped;

pub use parallel::ParallelAction;
pub use script::ScriptAction;
pub use sequence::SequenceAction;
pub use simple::{FnWork, SimpleAction, Work};
pub use wrapped::WrappedAction;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;
use crate::runner::TaskRunner;
use crate::{Result, WatchworkError};

/// Call parameters and static bindings: a flat JSON object.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Name resolution surface offered to [`Action::resolve`].
pub trait ActionLookup: Send + Sync {
    fn find(&self, name: &str) -> Option<Arc<dyn Action>>;
}

/// Everything an action run may need beyond its parameters.
#[derive(Clone)]
pub struct ActionContext {
    /// The runner that owns this execution; compound actions use it for
    /// component submissions.
    pub runner: TaskRunner,
    /// Working directory and resolution root for script actions.
    pub scripts_root: PathBuf,
    /// Trips when this execution is cancelled.
    pub cancel: CancellationToken,
    pub(crate) cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
}

impl ActionContext {
    pub(crate) fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason
            .lock()
            .expect("cancel reason poisoned")
            .clone()
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("scripts_root", &self.scripts_root)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// The uniform action capability set.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Per-execution timeout; `None` means unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Pattern matched against fired trigger events. Returned by value so
    /// delegating variants can surface a pattern owned by their target;
    /// `Regex` clones share the compiled program.
    fn trigger(&self) -> Option<Regex> {
        None
    }

    fn on_success(&self) -> Option<Arc<dyn Action>> {
        None
    }

    fn on_error(&self) -> Option<Arc<dyn Action>> {
        None
    }

    /// Bind name references against `lookup`. Idempotent: re-resolving an
    /// already-resolved graph is a no-op, since the same action object is
    /// reused across reloads.
    fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        let _ = lookup;
        Ok(())
    }

    /// Execute the action body. Failures are reported as errors here and
    /// converted into monitor state at the runner boundary; they are never
    /// raised to the submitter.
    async fn run(
        &self,
        ctx: &ActionContext,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> anyhow::Result<Params>;
}

/// A lazily bound edge to another action: either a name to be resolved
/// against a catalogue or a direct (inline) child.
pub struct ActionRef {
    name: Option<String>,
    slot: OnceLock<Arc<dyn Action>>,
    /// Guards the one recursive resolve pass per reference; also breaks
    /// reference cycles, which are a caller error and not otherwise
    /// detected.
    visited: AtomicBool,
}

impl ActionRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            slot: OnceLock::new(),
            visited: AtomicBool::new(false),
        }
    }

    pub fn direct(action: Arc<dyn Action>) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(action);
        Self {
            name: None,
            slot,
            visited: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Bind this reference and recurse into the target exactly once.
    pub fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        if self.visited.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let action = match self.slot.get() {
            Some(action) => Arc::clone(action),
            None => {
                let name = self.name.as_deref().unwrap_or_default();
                match lookup.find(name) {
                    Some(action) => {
                        let _ = self.slot.set(Arc::clone(&action));
                        action
                    }
                    None => {
                        // Allow a retry after the catalogue gains the name.
                        self.visited.store(false, Ordering::SeqCst);
                        return Err(WatchworkError::UnresolvedReference(name.to_string()));
                    }
                }
            }
        };
        action.resolve(lookup)
    }

    /// The bound target, if resolution has happened.
    pub fn resolved(&self) -> Option<Arc<dyn Action>> {
        self.slot.get().cloned()
    }

    /// The bound target, failing loudly when the graph was run before
    /// being resolved.
    pub(crate) fn require(&self) -> anyhow::Result<Arc<dyn Action>> {
        self.resolved().ok_or_else(|| {
            anyhow::anyhow!(
                "action reference '{}' was never resolved",
                self.name.as_deref().unwrap_or("<inline>")
            )
        })
    }
}

impl fmt::Debug for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRef")
            .field("name", &self.name)
            .field("bound", &self.slot.get().is_some())
            .finish()
    }
}

/// Static configuration shared by every action variant.
#[derive(Debug)]
pub struct ActionCommon {
    pub name: String,
    pub timeout: Option<Duration>,
    pub trigger: Option<Regex>,
    pub on_success: Option<ActionRef>,
    pub on_error: Option<ActionRef>,
    /// Static bindings merged beneath call parameters; the call wins.
    pub bindings: Params,
}

impl ActionCommon {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            trigger: None,
            on_success: None,
            on_error: None,
            bindings: Params::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trigger(mut self, trigger: Regex) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_on_success(mut self, target: ActionRef) -> Self {
        self.on_success = Some(target);
        self
    }

    pub fn with_on_error(mut self, target: ActionRef) -> Self {
        self.on_error = Some(target);
        self
    }

    pub fn with_bindings(mut self, bindings: Params) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        if let Some(target) = &self.on_success {
            target.resolve(lookup)?;
        }
        if let Some(target) = &self.on_error {
            target.resolve(lookup)?;
        }
        Ok(())
    }

    /// Static bindings overlaid with call parameters.
    pub fn merged(&self, call: &Params) -> Params {
        let mut out = self.bindings.clone();
        for (key, value) in call {
            out.insert(key.clone(), value.clone());
        }
        out
    }

    pub fn success_chain(&self) -> Option<Arc<dyn Action>> {
        self.on_success.as_ref().and_then(ActionRef::resolved)
    }

    pub fn error_chain(&self) -> Option<Arc<dyn Action>> {
        self.on_error.as_ref().and_then(ActionRef::resolved)
    }
}
