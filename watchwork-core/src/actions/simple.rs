//! The leaf action variant: one caller-supplied unit of work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Action, ActionCommon, ActionContext, ActionLookup, Params};
use crate::Result;
use crate::progress::ProgressReporter;

/// The work performed by a [`SimpleAction`].
///
/// Success or failure is whatever the work reports: returning `Ok` without
/// touching the reporter defaults to success, returning `Err` fails, and
/// explicitly terminating the reporter pins the verdict either way.
#[async_trait]
pub trait Work: Send + Sync {
    async fn perform(
        &self,
        params: &Params,
        reporter: &Arc<ProgressReporter>,
    ) -> anyhow::Result<Params>;
}

/// Adapter turning an async closure into [`Work`].
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnWork<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork").finish()
    }
}

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn(Params, Arc<ProgressReporter>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Params>> + Send,
{
    async fn perform(
        &self,
        params: &Params,
        reporter: &Arc<ProgressReporter>,
    ) -> anyhow::Result<Params> {
        (self.f)(params.clone(), Arc::clone(reporter)).await
    }
}

/// Leaf action running one piece of work with its static bindings merged
/// beneath the call parameters.
pub struct SimpleAction {
    common: ActionCommon,
    work: Arc<dyn Work>,
}

impl SimpleAction {
    pub fn new(common: ActionCommon, work: Arc<dyn Work>) -> Self {
        Self { common, work }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Params, Arc<ProgressReporter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Params>> + Send + 'static,
    {
        Self::new(ActionCommon::new(name), Arc::new(FnWork::new(f)))
    }

    pub fn common_mut(&mut self) -> &mut ActionCommon {
        &mut self.common
    }
}

impl fmt::Debug for SimpleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleAction")
            .field("name", &self.common.name)
            .finish()
    }
}

#[async_trait]
impl Action for SimpleAction {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.common.timeout
    }

    fn trigger(&self) -> Option<Regex> {
        self.common.trigger.clone()
    }

    fn on_success(&self) -> Option<Arc<dyn Action>> {
        self.common.success_chain()
    }

    fn on_error(&self) -> Option<Arc<dyn Action>> {
        self.common.error_chain()
    }

    fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        self.common.resolve(lookup)
    }

    async fn run(
        &self,
        _ctx: &ActionContext,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> anyhow::Result<Params> {
        let merged = self.common.merged(&params);
        self.work.perform(&merged, &reporter).await
    }
}
