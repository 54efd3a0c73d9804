//! Ordered composition: components run one at a time, each observing the
//! merged result of all prior components.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{Action, ActionCommon, ActionContext, ActionLookup, ActionRef, Params};
use crate::Result;
use crate::progress::ProgressReporter;
use crate::runner::drive;

/// Runs its components strictly in declaration order, each under its own
/// nested reporter, threading the previous component's output forward as
/// input to the next. Stops at the first failing component and fails with
/// exactly that component's failure message; overall success requires every
/// component to succeed. Progress is the fraction of components completed.
pub struct SequenceAction {
    common: ActionCommon,
    components: Vec<ActionRef>,
}

impl SequenceAction {
    pub fn new(common: ActionCommon, components: Vec<ActionRef>) -> Self {
        Self { common, components }
    }
}

impl fmt::Debug for SequenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceAction")
            .field("name", &self.common.name)
            .field("components", &self.components.len())
            .finish()
    }
}

#[async_trait]
impl Action for SequenceAction {
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
        let total = self.components.len();
        let mut accumulated = self.common.merged(&params);

        for (index, component) in self.components.iter().enumerate() {
            let action = component.require()?;
            let nested = reporter.nested();
            debug!(
                "Sequence '{}' running component {}/{}: '{}'",
                self.common.name,
                index + 1,
                total,
                action.name()
            );

            let output = drive(
                ctx.clone(),
                Arc::clone(&action),
                accumulated.clone(),
                Arc::clone(&nested),
            )
            .await;

            if !nested.succeeded() {
                // Later components never run; the sequence fails with the
                // failing component's own message.
                let message = nested.failure_message().unwrap_or_else(|| {
                    format!("component '{}' failed", action.name())
                });
                return Err(anyhow::anyhow!(message));
            }

            accumulated = output;
            reporter.set_progress((((index + 1) * 100) / total.max(1)) as u8);
        }

        Ok(accumulated)
    }
}
