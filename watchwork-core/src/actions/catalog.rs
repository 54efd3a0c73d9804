//! Directory-backed action catalogue.
//!
//! Each file under the catalogue root is one [`ActionSet`]: a decoded
//! action document (or array of documents) named after the file stem.
//! Sets hot-reload through a [`ConfigRegistry`]; every reload resolves the
//! new set's references against the union of the new batch and the already
//! installed catalogue, so a broken edit fails eagerly and leaves the
//! previous set in place.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Action, ActionLookup, Params};
use crate::Result;
use crate::actions::decode::ActionDecoder;
use crate::registry::{ConfigRegistry, Configure, Configured, RegistryConfig, RegistryMode};
use crate::runner::{ExecutionHandle, TaskRunner};
use crate::watch::{StabilityConfig, WatchService};

/// One decoded document file: the file stem names the set.
pub struct ActionSet {
    name: String,
    path: PathBuf,
    actions: Vec<Arc<dyn Action>>,
}

impl ActionSet {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions
            .iter()
            .find(|action| action.name() == name)
            .cloned()
    }
}

impl Configured for ActionSet {
    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSet")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// Reads, decodes, and resolves one document file into an [`ActionSet`].
///
/// Holds a back-reference to its own registry so resolution can see the
/// already installed sets; the reference is filled in right after the
/// registry is constructed.
struct SetConfigurator {
    decoder: ActionDecoder,
    registry: OnceLock<ConfigRegistry<ActionSet>>,
}

impl SetConfigurator {
    fn installed_sets(&self) -> Option<&ConfigRegistry<ActionSet>> {
        self.registry.get()
    }
}

#[async_trait]
impl Configure<ActionSet> for SetConfigurator {
    async fn configure(&self, file: &Path) -> anyhow::Result<Option<ActionSet>> {
        let name = match file.file_stem().and_then(|stem| stem.to_str()) {
            Some(stem) => stem.to_string(),
            None => return Ok(None),
        };
        let text = tokio::fs::read_to_string(file).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let actions = self.decoder.decode_value(&value)?;

        let mut existing: Vec<Arc<ActionSet>> = match self.installed_sets() {
            Some(registry) => registry.peek_all().await,
            None => Vec::new(),
        };
        // Drop the set this file previously defined; the new batch
        // replaces it, and references must not bind into the stale copy.
        existing.retain(|set| set.path != file);
        existing.sort_by(|a, b| a.name.cmp(&b.name));

        for action in &actions {
            for other in existing.iter().filter(|set| set.find(action.name()).is_some()) {
                warn!(
                    "Action '{}' in {} shadows or is shadowed by set '{}'",
                    action.name(),
                    file.display(),
                    other.name
                );
            }
        }

        let lookup = UnionLookup {
            batch: &actions,
            existing: &existing,
        };
        for action in &actions {
            action.resolve(&lookup)?;
        }

        debug!(
            "Decoded {} action(s) from {}",
            actions.len(),
            file.display()
        );
        Ok(Some(ActionSet {
            name,
            path: file.to_path_buf(),
            actions,
        }))
    }
}

/// Resolution surface during one reload: the new batch first, then the
/// installed sets in sorted set-name order.
struct UnionLookup<'a> {
    batch: &'a [Arc<dyn Action>],
    existing: &'a [Arc<ActionSet>],
}

impl ActionLookup for UnionLookup<'_> {
    fn find(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.batch
            .iter()
            .find(|action| action.name() == name)
            .cloned()
            .or_else(|| self.existing.iter().find_map(|set| set.find(name)))
    }
}

/// The directory-defined action catalogue with trigger fan-out.
#[derive(Clone, Debug)]
pub struct ActionRegistry {
    sets: ConfigRegistry<ActionSet>,
}

impl ActionRegistry {
    pub fn new(root: impl Into<PathBuf>, config: RegistryConfig, decoder: ActionDecoder) -> Self {
        let configurator = Arc::new(SetConfigurator {
            decoder,
            registry: OnceLock::new(),
        });
        let configurator_hook: Arc<dyn Configure<ActionSet>> = configurator.clone();
        let sets = ConfigRegistry::new(root, config, configurator_hook);
        configurator
            .registry
            .set(sets.clone())
            .expect("configurator registry set twice");
        Self { sets }
    }

    /// Sets in sorted set-name order, the order lookups scan.
    async fn sorted_sets(&self) -> Vec<Arc<ActionSet>> {
        let mut sets = self.sets.get_all().await;
        sets.sort_by(|a, b| a.name().cmp(b.name()));
        sets
    }

    /// Look up a catalogued action by name. With duplicate names across
    /// sets, the set earliest in sorted set-name order wins.
    pub async fn action(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.sorted_sets()
            .await
            .iter()
            .find_map(|set| set.find(name))
    }

    /// All catalogued action names, sorted and deduplicated.
    pub async fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sorted_sets()
            .await
            .iter()
            .flat_map(|set| set.actions().iter().map(|action| action.name().to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Submit every catalogued action whose trigger pattern matches the
    /// fired event, each as an independent submission carrying the event in
    /// its parameters.
    pub async fn fire(
        &self,
        runner: &TaskRunner,
        event: &str,
        params: Params,
    ) -> Result<Vec<ExecutionHandle>> {
        let mut handles = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for set in self.sorted_sets().await {
            for action in set.actions() {
                if !seen.insert(action.name().to_string()) {
                    continue;
                }
                let Some(trigger) = action.trigger() else {
                    continue;
                };
                if !trigger.is_match(event) {
                    continue;
                }
                info!("Trigger '{}' matched action '{}'", event, action.name());
                let mut fired = params.clone();
                fired.insert(
                    "trigger_event".to_string(),
                    serde_json::Value::String(event.to_string()),
                );
                handles.push(runner.submit(Arc::clone(action), fired).await?);
            }
        }
        Ok(handles)
    }

    pub async fn refresh(&self) -> Result<usize> {
        self.sets.refresh().await
    }

    pub async fn set_mode(&self, mode: RegistryMode) {
        self.sets.set_mode(mode).await;
    }

    pub async fn bind_watch(&self, service: &WatchService, settle: StabilityConfig) -> Result<()> {
        self.sets.bind_watch(service, settle).await
    }

    /// Number of installed sets.
    pub async fn len(&self) -> usize {
        self.sets.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.sets.is_empty().await
    }

    pub async fn shutdown(&self) {
        self.sets.shutdown().await;
    }
}
