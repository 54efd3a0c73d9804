//! Parameter override over a named base action.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Action, ActionCommon, ActionContext, ActionLookup, ActionRef, Params};
use crate::Result;
use crate::progress::ProgressReporter;

/// Overlays additional static bindings (and optionally its own timeout,
/// trigger, and continuation chains) over a base action, delegating the run
/// behavior to the base. The wrapper's bindings sit beneath the call
/// parameters, so the call still wins, but they shadow the base's own
/// bindings.
pub struct WrappedAction {
    common: ActionCommon,
    base: ActionRef,
}

impl WrappedAction {
    pub fn new(common: ActionCommon, base: ActionRef) -> Self {
        Self { common, base }
    }
}

impl fmt::Debug for WrappedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedAction")
            .field("name", &self.common.name)
            .field("base", &self.base)
            .finish()
    }
}

#[async_trait]
impl Action for WrappedAction {
    fn name(&self) -> &str {
        &self.common.name
    }

    /// The wrapper's own timeout when set, otherwise the base's.
    fn timeout(&self) -> Option<Duration> {
        self.common
            .timeout
            .or_else(|| self.base.resolved().and_then(|base| base.timeout()))
    }

    fn trigger(&self) -> Option<Regex> {
        self.common
            .trigger
            .clone()
            .or_else(|| self.base.resolved().and_then(|base| base.trigger()))
    }

    fn on_success(&self) -> Option<Arc<dyn Action>> {
        self.common
            .success_chain()
            .or_else(|| self.base.resolved().and_then(|base| base.on_success()))
    }

    fn on_error(&self) -> Option<Arc<dyn Action>> {
        self.common
            .error_chain()
            .or_else(|| self.base.resolved().and_then(|base| base.on_error()))
    }

    fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        self.common.resolve(lookup)?;
        self.base.resolve(lookup)
    }

    async fn run(
        &self,
        ctx: &ActionContext,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> anyhow::Result<Params> {
        let base = self.base.require()?;
        let merged = self.common.merged(&params);
        base.run(ctx, merged, reporter).await
    }
}
