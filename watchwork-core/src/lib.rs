//! Directory-driven hot reload and asynchronous task orchestration.
//!
//! The crate has two halves that meet in the action catalogue:
//!
//! - **Change detection**: [`scan::ChangeScanner`] turns directory scans
//!   into confirmed [`watchwork_model::ChangeEvent`]s, [`watch::WatchService`]
//!   feeds filesystem notifications through a [`watch::StabilityTracker`],
//!   and [`registry::ConfigRegistry`] keeps a named map of live objects in
//!   sync with the files that define them.
//! - **Task orchestration**: [`runner::TaskRunner`] executes composable
//!   [`actions::Action`] graphs on a bounded worker pool, observed through
//!   [`progress::ProgressReporter`] monitors.
//!
//! [`actions::catalog::ActionRegistry`] ties them together: a directory of
//! action documents, hot-reloaded, with trigger fan-out into the runner.

pub mod actions;
pub mod error;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod scan;
pub mod watch;

pub use error::{Result, WatchworkError};

pub use actions::{Action, ActionContext, ActionRef, Params};
pub use progress::ProgressReporter;
pub use registry::{ConfigRegistry, Configure, Configured, RegistryConfig, RegistryMode};
pub use runner::{ExecutionHandle, ExecutionId, RunnerConfig, TaskRunner};
pub use scan::{ChangeScanner, ScannerConfig};
pub use watch::{ChangeHandler, StabilityConfig, StabilityTracker, WatchService};
