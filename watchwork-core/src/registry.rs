//! Generic hot-reload container for directory-defined objects.
//!
//! A [`ConfigRegistry`] owns a named map of live objects, each derived from
//! one file under its root by an embedder-supplied [`Configure`] hook. Change
//! events install, replace, or remove entries; the hook runs outside the
//! registry's lock and the swap happens under it, so a reader never observes
//! a half-applied reload and a `Modified` never exposes a missing gap.
//!
//! Failure semantics: an error from the hook is caught and logged and the
//! previous entry, if any, is left in place. A broken edit must not delete a
//! working configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::scan::{ChangeScanner, ScannerConfig};
use crate::watch::{ChangeHandler, StabilityConfig, StabilityTracker, WatchService};
use watchwork_model::{ChangeEvent, ChangeKind};

/// A configured object living in a registry. The name indexes the object
/// logically, alongside its defining file.
pub trait Configured: Send + Sync + 'static {
    fn name(&self) -> &str;
}

/// Factory hook turning one file into one configured object.
///
/// `Ok(None)` means "nothing to install" and leaves any previous entry in
/// place; an `Err` must be side-effect-free (no partial object published).
#[async_trait]
pub trait Configure<T>: Send + Sync {
    async fn configure(&self, file: &Path) -> anyhow::Result<Option<T>>;
}

/// Rescan policy after the initial load.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryMode {
    /// Scan exactly once on first access; afterwards only an explicit
    /// [`ConfigRegistry::refresh`] rescans.
    Production,
    /// Periodic rescans after first access (and/or watch events via
    /// [`ConfigRegistry::bind_watch`]).
    Live,
}

/// Configuration for one registry instance.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub mode: RegistryMode,
    /// Interval between rescans in `Live` mode.
    pub scan_interval: Duration,
    pub scanner: ScannerConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mode: RegistryMode::Production,
            scan_interval: Duration::from_secs(30),
            scanner: ScannerConfig::default(),
        }
    }
}

struct RegistryState<T> {
    by_path: HashMap<PathBuf, Arc<T>>,
    by_name: HashMap<String, Arc<T>>,
}

struct LiveTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

struct RegistryInner<T: Configured> {
    root: PathBuf,
    configurator: Arc<dyn Configure<T>>,
    scan_interval: Duration,
    mode: std::sync::Mutex<RegistryMode>,
    /// The single lock serializing all index mutation for this instance.
    state: RwLock<RegistryState<T>>,
    scanner: tokio::sync::Mutex<ChangeScanner>,
    /// First-access guard: the initial scan runs exactly once.
    initialized: tokio::sync::Mutex<bool>,
    live: tokio::sync::Mutex<Option<LiveTask>>,
}

/// Generic hot-reload container. Cheap to clone; clones share state.
pub struct ConfigRegistry<T: Configured> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: Configured> Clone for ConfigRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Configured> fmt::Debug for ConfigRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("root", &self.inner.root)
            .finish()
    }
}

impl<T: Configured> ConfigRegistry<T> {
    pub fn new(
        root: impl Into<PathBuf>,
        config: RegistryConfig,
        configurator: Arc<dyn Configure<T>>,
    ) -> Self {
        let root = root.into();
        let scanner = ChangeScanner::new(&root, config.scanner.clone());
        Self {
            inner: Arc::new(RegistryInner {
                root,
                configurator,
                scan_interval: config.scan_interval,
                mode: std::sync::Mutex::new(config.mode),
                state: RwLock::new(RegistryState {
                    by_path: HashMap::new(),
                    by_name: HashMap::new(),
                }),
                scanner: tokio::sync::Mutex::new(scanner),
                initialized: tokio::sync::Mutex::new(false),
                live: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn mode(&self) -> RegistryMode {
        *self.inner.mode.lock().expect("registry mode poisoned")
    }

    /// Look up an entry by its logical name.
    pub async fn get(&self, name: &str) -> Option<Arc<T>> {
        self.ensure_initialized().await.ok()?;
        self.inner.state.read().await.by_name.get(name).cloned()
    }

    /// Look up an entry by its defining file.
    pub async fn get_by_path(&self, path: &Path) -> Option<Arc<T>> {
        self.ensure_initialized().await.ok()?;
        self.inner.state.read().await.by_path.get(path).cloned()
    }

    pub async fn get_all(&self) -> Vec<Arc<T>> {
        if self.ensure_initialized().await.is_err() {
            return Vec::new();
        }
        self.inner
            .state
            .read()
            .await
            .by_name
            .values()
            .cloned()
            .collect()
    }

    pub async fn names(&self) -> Vec<String> {
        if self.ensure_initialized().await.is_err() {
            return Vec::new();
        }
        let state = self.inner.state.read().await;
        let mut names: Vec<String> = state.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        if self.ensure_initialized().await.is_err() {
            return 0;
        }
        self.inner.state.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current contents without triggering initialization or a scan. Used
    /// by callers that must read state from inside a `configure` hook.
    pub async fn peek_all(&self) -> Vec<Arc<T>> {
        self.inner
            .state
            .read()
            .await
            .by_name
            .values()
            .cloned()
            .collect()
    }

    /// Force a scan now, applying every resulting event. Returns the number
    /// of events applied by this call.
    pub async fn refresh(&self) -> Result<usize> {
        if let Some(initial) = self.ensure_initialized().await? {
            return Ok(initial);
        }
        self.rescan(true).await
    }

    /// Switch rescan policy at runtime, starting or stopping the periodic
    /// task if the registry is already initialized.
    pub async fn set_mode(&self, mode: RegistryMode) {
        *self.inner.mode.lock().expect("registry mode poisoned") = mode;
        if *self.inner.initialized.lock().await {
            match mode {
                RegistryMode::Live => self.start_live().await,
                RegistryMode::Production => self.stop_live().await,
            }
        }
    }

    /// Subscribe this registry to a watch service for event-driven reloads,
    /// debounced through a [`StabilityTracker`] with the given settle
    /// configuration.
    pub async fn bind_watch(
        &self,
        service: &WatchService,
        settle: StabilityConfig,
    ) -> Result<()> {
        self.ensure_initialized().await?;
        let handler = Arc::new(RegistryHandler {
            registry: self.clone(),
        });
        let tracker = Arc::new(StabilityTracker::new(handler, settle));
        service.watch(&self.inner.root, tracker).await
    }

    /// Stop the periodic rescan task, if running.
    pub async fn shutdown(&self) {
        self.stop_live().await;
    }

    /// First-access hook: runs the initial forced scan exactly once and, in
    /// `Live` mode, starts the periodic task. Returns the number of events
    /// applied when this call performed the initialization.
    async fn ensure_initialized(&self) -> Result<Option<usize>> {
        let mut initialized = self.inner.initialized.lock().await;
        if *initialized {
            return Ok(None);
        }

        let events = {
            let mut scanner = self.inner.scanner.lock().await;
            scanner.scan(true).await?
        };
        let applied = events.len();
        for event in events {
            self.apply_event(event).await;
        }
        *initialized = true;
        drop(initialized);

        info!(
            "Registry at {} initialized with {} event(s)",
            self.inner.root.display(),
            applied
        );

        if self.mode() == RegistryMode::Live {
            self.start_live().await;
        }
        Ok(Some(applied))
    }

    async fn rescan(&self, force_immediate: bool) -> Result<usize> {
        let events = {
            let mut scanner = self.inner.scanner.lock().await;
            scanner.scan(force_immediate).await?
        };
        let applied = events.len();
        for event in events {
            self.apply_event(event).await;
        }
        Ok(applied)
    }

    /// Resolve one change event into an index mutation. The configure hook
    /// runs outside the state lock; the swap happens under it.
    pub(crate) async fn apply_event(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::New | ChangeKind::Modified => {
                match self.inner.configurator.configure(&event.path).await {
                    Ok(Some(object)) => {
                        let object = Arc::new(object);
                        let name = object.name().to_string();
                        let mut state = self.inner.state.write().await;
                        if let Some(old) = state.by_path.insert(event.path.clone(), object.clone())
                        {
                            // Re-index when the name changed across the
                            // reload, but never evict a same-named entry
                            // owned by a different file.
                            let old_name = old.name().to_string();
                            if old_name != name
                                && state
                                    .by_name
                                    .get(&old_name)
                                    .is_some_and(|current| Arc::ptr_eq(current, &old))
                            {
                                state.by_name.remove(&old_name);
                            }
                        }
                        state.by_name.insert(name.clone(), object);
                        drop(state);
                        info!("Configured '{}' from {}", name, event.path.display());
                    }
                    Ok(None) => {
                        debug!(
                            "No object configured from {}; previous entry left in place",
                            event.path.display()
                        );
                    }
                    Err(e) => {
                        warn!(
                            "Failed to configure from {}: {:#}; previous entry retained",
                            event.path.display(),
                            e
                        );
                    }
                }
            }
            ChangeKind::Deleted => {
                let mut state = self.inner.state.write().await;
                if let Some(old) = state.by_path.remove(&event.path) {
                    if state
                        .by_name
                        .get(old.name())
                        .is_some_and(|current| Arc::ptr_eq(current, &old))
                    {
                        state.by_name.remove(old.name());
                    }
                    drop(state);
                    info!(
                        "Removed '{}' defined by {}",
                        old.name(),
                        event.path.display()
                    );
                }
            }
        }
    }

    async fn start_live(&self) {
        let mut live = self.inner.live.lock().await;
        if live.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(registry.inner.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Unforced: the two-scan settle heuristic applies
                        // to unattended rescans.
                        if let Err(e) = registry.rescan(false).await {
                            error!(
                                "Live rescan of {} failed: {}",
                                registry.inner.root.display(),
                                e
                            );
                        }
                    }
                }
            }
            debug!("Live rescan task stopped");
        });

        *live = Some(LiveTask { token, handle });
        info!("Live rescans started for {}", self.inner.root.display());
    }

    async fn stop_live(&self) {
        let task = self.inner.live.lock().await.take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

struct RegistryHandler<T: Configured> {
    registry: ConfigRegistry<T>,
}

#[async_trait]
impl<T: Configured> ChangeHandler for RegistryHandler<T> {
    async fn handle(&self, event: ChangeEvent) {
        self.registry.apply_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Named {
        name: String,
        body: String,
    }

    impl Configured for Named {
        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Reads `name=body` files; errors on files containing `broken`.
    struct LineConfigurator;

    #[async_trait]
    impl Configure<Named> for LineConfigurator {
        async fn configure(&self, file: &Path) -> anyhow::Result<Option<Named>> {
            let text = tokio::fs::read_to_string(file).await?;
            if text.contains("broken") {
                anyhow::bail!("broken configuration in {}", file.display());
            }
            let (name, body) = text
                .trim()
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("missing delimiter"))?;
            Ok(Some(Named {
                name: name.to_string(),
                body: body.to_string(),
            }))
        }
    }

    fn registry_at(dir: &TempDir) -> ConfigRegistry<Named> {
        ConfigRegistry::new(dir.path(), RegistryConfig::default(), Arc::new(LineConfigurator))
    }

    #[tokio::test]
    async fn first_access_scans_once() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("a.conf"), "alpha=1")?;
        let registry = registry_at(&dir);

        let entry = registry.get("alpha").await.expect("entry should exist");
        assert_eq!(entry.body, "1");

        // Production mode: a file added later is invisible until refresh.
        std::fs::write(dir.path().join("b.conf"), "beta=2")?;
        assert!(registry.get("beta").await.is_none());
        registry.refresh().await?;
        assert!(registry.get("beta").await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn broken_edit_retains_previous_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("a.conf");
        std::fs::write(&file, "alpha=1")?;
        let registry = registry_at(&dir);
        assert!(registry.get("alpha").await.is_some());

        std::fs::write(&file, "broken")?;
        registry.refresh().await?;
        let entry = registry.get("alpha").await.expect("previous entry retained");
        assert_eq!(entry.body, "1");
        Ok(())
    }

    #[tokio::test]
    async fn rename_across_reload_reindexes() -> Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("a.conf");
        std::fs::write(&file, "alpha=1")?;
        let registry = registry_at(&dir);
        assert!(registry.get("alpha").await.is_some());

        std::fs::write(&file, "renamed=1")?;
        registry.refresh().await?;
        assert!(registry.get("alpha").await.is_none());
        assert!(registry.get("renamed").await.is_some());
        assert_eq!(registry.len().await, 1);
        Ok(())
    }
}
