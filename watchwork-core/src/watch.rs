//! OS-level directory watching and write-settle debouncing.
//!
//! [`WatchService`] owns one `notify` watcher and a single dispatch task.
//! OS create/modify/delete notifications are converted into the same
//! [`ChangeEvent`] vocabulary the polling scanner produces and dispatched to
//! every handler whose watched root is an ancestor of the event path.
//! Handlers run on the dispatch task and must not block it.
//!
//! OS watches are low-latency but fire mid-write. [`StabilityTracker`]
//! decorates a handler with a per-path quiet-period timer: the tracked file
//! is declared settled, and the downstream handler fires once, only after a
//! checksum taken at time T equals the checksum at T plus the quiet period
//! with no intervening raw event.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scan::capture_fingerprint;
use crate::{Result, WatchworkError};
use watchwork_model::{ChangeEvent, ChangeKind, FileFingerprint};

/// Receiver of converted change events.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent);
}

struct Subscription {
    root: PathBuf,
    handler: Arc<dyn ChangeHandler>,
}

/// Shared OS watch service: one watcher, one dispatch task, many
/// independent subscribers.
pub struct WatchService {
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
    /// Reference counts per watched root; the OS watch is dropped when the
    /// last subscriber for a root goes away.
    roots: std::sync::Mutex<HashMap<PathBuf, usize>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    shutdown: CancellationToken,
    dispatch: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WatchService {
    pub fn new() -> Result<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChangeEvent>();

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for converted in convert_notify_event(event) {
                        debug!("Watch event: {:?}", converted);
                        if event_tx.send(converted).is_err() {
                            // Dispatch task is gone; the service is
                            // shutting down.
                            break;
                        }
                    }
                }
                Err(e) => error!("Watch error: {:?}", e),
            },
            notify::Config::default(),
        )?;

        let subscriptions = Arc::new(RwLock::new(Vec::<Subscription>::new()));
        let shutdown = CancellationToken::new();

        let dispatch_subs = Arc::clone(&subscriptions);
        let dispatch_token = shutdown.clone();
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        let subs = dispatch_subs.read().await;
                        for sub in subs.iter() {
                            if event.path.starts_with(&sub.root) {
                                sub.handler.handle(event.clone()).await;
                            }
                        }
                    }
                }
            }
            debug!("Watch dispatch task stopped");
        });

        Ok(Self {
            watcher: std::sync::Mutex::new(Some(watcher)),
            roots: std::sync::Mutex::new(HashMap::new()),
            subscriptions,
            shutdown,
            dispatch: std::sync::Mutex::new(Some(dispatch)),
        })
    }

    /// Register `handler` for every event under `dir` (recursively,
    /// including subdirectories created later).
    pub async fn watch(&self, dir: impl AsRef<Path>, handler: Arc<dyn ChangeHandler>) -> Result<()> {
        let root = dir.as_ref().to_path_buf();

        {
            let mut roots = self.roots.lock().expect("watch roots poisoned");
            let count = roots.entry(root.clone()).or_insert(0);
            if *count == 0 {
                let mut watcher = self.watcher.lock().expect("watcher poisoned");
                let watcher = watcher
                    .as_mut()
                    .ok_or_else(|| WatchworkError::Internal("Watch service is shut down".into()))?;
                watcher.watch(&root, RecursiveMode::Recursive)?;
                info!("Watching path: {}", root.display());
            }
            *count += 1;
        }

        self.subscriptions
            .write()
            .await
            .push(Subscription { root, handler });
        Ok(())
    }

    /// Drop every subscription rooted at `dir`.
    pub async fn unwatch(&self, dir: impl AsRef<Path>) -> Result<()> {
        let root = dir.as_ref().to_path_buf();

        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|sub| sub.root != root);
        let removed = before - subs.len();
        drop(subs);

        if removed > 0 {
            let mut roots = self.roots.lock().expect("watch roots poisoned");
            if let Some(count) = roots.get_mut(&root) {
                *count = count.saturating_sub(removed);
                if *count == 0 {
                    roots.remove(&root);
                    if let Some(watcher) =
                        self.watcher.lock().expect("watcher poisoned").as_mut()
                    {
                        if let Err(e) = watcher.unwatch(&root) {
                            warn!("Failed to unwatch {}: {}", root.display(), e);
                        }
                    }
                    info!("Stopped watching path: {}", root.display());
                }
            }
        }
        Ok(())
    }

    /// Stop the dispatch task and drop the OS watcher. Pending undelivered
    /// notifications are discarded.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.watcher.lock().expect("watcher poisoned").take();
        let handle = self.dispatch.lock().expect("dispatch handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for WatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roots = self.roots.lock().expect("watch roots poisoned");
        f.debug_struct("WatchService")
            .field("watched_roots", &roots.len())
            .finish()
    }
}

/// Convert a raw notify event into our vocabulary. Rename notifications are
/// mapped per path by existence: a path that still exists is `New`, a
/// vanished one is `Deleted`. Access and other event kinds are skipped, as
/// are events for directories themselves.
fn convert_notify_event(event: Event) -> Vec<ChangeEvent> {
    let kind = event.kind;
    event
        .paths
        .into_iter()
        .filter_map(|path| {
            let converted = match kind {
                EventKind::Create(_) => ChangeKind::New,
                EventKind::Remove(_) => ChangeKind::Deleted,
                EventKind::Modify(ModifyKind::Name(_)) => {
                    if path.exists() {
                        ChangeKind::New
                    } else {
                        ChangeKind::Deleted
                    }
                }
                EventKind::Modify(_) => ChangeKind::Modified,
                EventKind::Any | EventKind::Access(_) | EventKind::Other => return None,
            };
            if converted != ChangeKind::Deleted && path.is_dir() {
                return None;
            }
            Some(ChangeEvent::new(path, converted))
        })
        .collect()
}

/// Configuration for write-settle tracking.
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// How long a file's checksum must hold still before it is settled.
    pub quiet_period: Duration,
    /// Content prefix length for the verification checksum.
    pub checksum_prefix: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(500),
            checksum_prefix: 64 * 1024,
        }
    }
}

struct PendingFile {
    /// Invalidates in-flight timers when a newer raw event arrives.
    generation: u64,
    /// Kind of the first raw event of the episode; the settled event
    /// carries this kind.
    kind: ChangeKind,
    fingerprint: Option<FileFingerprint>,
}

/// A [`ChangeHandler`] decorator that forwards `New`/`Modified` only once
/// the file has stopped changing for the quiet period. `Deleted` cancels
/// tracking and forwards immediately.
pub struct StabilityTracker {
    config: StabilityConfig,
    downstream: Arc<dyn ChangeHandler>,
    pending: Arc<tokio::sync::Mutex<HashMap<PathBuf, PendingFile>>>,
}

impl StabilityTracker {
    pub fn new(downstream: Arc<dyn ChangeHandler>, config: StabilityConfig) -> Self {
        Self {
            config,
            downstream,
            pending: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Number of files currently awaiting settlement.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl fmt::Debug for StabilityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StabilityTracker")
            .field("quiet_period", &self.config.quiet_period)
            .finish()
    }
}

#[async_trait]
impl ChangeHandler for StabilityTracker {
    async fn handle(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Deleted => {
                self.pending.lock().await.remove(&event.path);
                self.downstream.handle(event).await;
            }
            ChangeKind::New | ChangeKind::Modified => {
                let fingerprint =
                    capture_fingerprint(&event.path, self.config.checksum_prefix)
                        .await
                        .ok();

                let generation = {
                    let mut pending = self.pending.lock().await;
                    let entry = pending.entry(event.path.clone()).or_insert(PendingFile {
                        generation: 0,
                        kind: event.kind,
                        fingerprint: None,
                    });
                    entry.generation += 1;
                    entry.fingerprint = fingerprint;
                    entry.generation
                };

                tokio::spawn(settle_after_quiet(
                    Arc::clone(&self.pending),
                    Arc::clone(&self.downstream),
                    self.config.clone(),
                    event.path,
                    generation,
                ));
            }
        }
    }
}

async fn settle_after_quiet(
    pending: Arc<tokio::sync::Mutex<HashMap<PathBuf, PendingFile>>>,
    downstream: Arc<dyn ChangeHandler>,
    config: StabilityConfig,
    path: PathBuf,
    mut generation: u64,
) {
    loop {
        tokio::time::sleep(config.quiet_period).await;

        let recaptured = capture_fingerprint(&path, config.checksum_prefix).await.ok();

        let mut map = pending.lock().await;
        let Some(entry) = map.get_mut(&path) else {
            // Deleted in the meantime; tracking was cancelled.
            return;
        };
        if entry.generation != generation {
            // A newer raw event restarted the clock; its own timer owns
            // the episode now.
            return;
        }

        if recaptured.is_some() && recaptured == entry.fingerprint {
            let kind = entry.kind;
            map.remove(&path);
            drop(map);
            debug!("File settled: {}", path.display());
            downstream.handle(ChangeEvent::new(path, kind)).await;
            return;
        }

        // Still being written: re-arm with the fingerprint just taken.
        entry.fingerprint = recaptured;
        entry.generation += 1;
        generation = entry.generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeHandler for Recorder {
        async fn handle(&self, event: ChangeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<ChangeEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn settles_after_quiet_period() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.conf");
        std::fs::write(&file, b"content").unwrap();

        let recorder = Arc::new(Recorder::default());
        let tracker = StabilityTracker::new(
            recorder.clone(),
            StabilityConfig {
                quiet_period: Duration::from_millis(50),
                checksum_prefix: 1024,
            },
        );

        tracker.handle(ChangeEvent::created(&file)).await;
        assert_eq!(tracker.pending_count().await, 1);
        assert!(recorder.events().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::New);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn raw_event_during_quiet_period_restarts_the_clock() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.conf");
        std::fs::write(&file, b"first").unwrap();

        let recorder = Arc::new(Recorder::default());
        let tracker = StabilityTracker::new(
            recorder.clone(),
            StabilityConfig {
                quiet_period: Duration::from_millis(100),
                checksum_prefix: 1024,
            },
        );

        tracker.handle(ChangeEvent::created(&file)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&file, b"second").unwrap();
        tracker.handle(ChangeEvent::modified(&file)).await;

        // The settled event keeps the kind of the first raw event.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::New);
    }

    #[tokio::test]
    async fn delete_cancels_tracking_and_forwards() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.conf");
        std::fs::write(&file, b"content").unwrap();

        let recorder = Arc::new(Recorder::default());
        let tracker = StabilityTracker::new(
            recorder.clone(),
            StabilityConfig {
                quiet_period: Duration::from_millis(100),
                checksum_prefix: 1024,
            },
        );

        tracker.handle(ChangeEvent::created(&file)).await;
        std::fs::remove_file(&file).unwrap();
        tracker.handle(ChangeEvent::deleted(&file)).await;

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
        assert_eq!(tracker.pending_count().await, 0);

        // The orphaned timer must not resurrect the episode.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn conversion_skips_access_events() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Read));
        assert!(convert_notify_event(event).is_empty());
    }
}
