//! Unordered composition: one runner submission per component, wait for
//! all.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{Action, ActionCommon, ActionContext, ActionLookup, ActionRef, Params};
use crate::Result;
use crate::progress::ProgressReporter;

/// Submits every component to the task runner concurrently, each under its
/// own nested reporter, then waits for all of them. Overall failure if any
/// component failed; progress advances in arbitrary completion order.
///
/// The wait-for-all consumes the owning worker's pool slot, so deeply
/// nested parallel actions can exhaust the pool under high fan-out. That is
/// a resource-sizing concern for the embedder, not a correctness bug.
pub struct ParallelAction {
    common: ActionCommon,
    components: Vec<ActionRef>,
}

impl ParallelAction {
    pub fn new(common: ActionCommon, components: Vec<ActionRef>) -> Self {
        Self { common, components }
    }
}

impl fmt::Debug for ParallelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelAction")
            .field("name", &self.common.name)
            .field("components", &self.components.len())
            .finish()
    }
}

#[async_trait]
impl Action for ParallelAction {
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
        self.common.resolve(lookup)?;
        for component in &self.components {
            component.resolve(lookup)?;
        }
        Ok(())
    }

    async fn run(
        &self,
        ctx: &ActionContext,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> anyhow::Result<Params> {
        let merged = self.common.merged(&params);
        let total = self.components.len();

        let mut submissions = Vec::with_capacity(total);
        for component in &self.components {
            let action = component.require()?;
            let nested = reporter.nested();
            let handle = ctx
                .runner
                .submit_with_reporter(
                    Arc::clone(&action),
                    merged.clone(),
                    Arc::clone(&nested),
                )
                .await?;
            debug!(
                "Parallel '{}' submitted component '{}' as {}",
                self.common.name,
                action.name(),
                handle.id
            );
            submissions.push((action.name().to_string(), nested, handle));
        }

        let mut failures = Vec::new();
        for (completed, (name, nested, mut handle)) in submissions.into_iter().enumerate() {
            handle.wait().await;
            reporter.set_progress((((completed + 1) * 100) / total.max(1)) as u8);
            if !nested.succeeded() {
                failures.push(name);
            }
        }

        if failures.is_empty() {
            Ok(merged)
        } else {
            Err(anyhow::anyhow!(
                "{} of {} parallel component(s) failed: {}",
                failures.len(),
                total,
                failures.join(", ")
            ))
        }
    }
}
