//! Tamper detection and auto-remediation
//!
//! A watcher thread observes the directory holding the shared resource
//! (editors and atomic writers replace the file, so its inode is not
//! stable) and forwards debounced change notifications. Each notification
//! is checked against the policy under the enforcement mutex; a managed
//! region that no longer matches while enforcing is counted and reapplied.

use crate::blocker::{LayerReport, LayeredBlocker};
use crate::error::{FocusError, Result};
use crate::events::EventKind;
use crate::policy::BlockPolicy;
use crate::store::StateHandle;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default debounce between handled notifications
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Where a tamper check came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperSource {
    /// Filesystem notification
    Watcher,
    /// Periodic integrity sweep from the tick loop
    Sweep,
}

/// A change notification for the shared resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperEvent {
    pub detected_at: DateTime<Utc>,
    pub resource_path: PathBuf,
    pub source: TamperSource,
}

impl TamperEvent {
    pub fn new(resource_path: impl Into<PathBuf>, source: TamperSource) -> Self {
        Self {
            detected_at: Utc::now(),
            resource_path: resource_path.into(),
            source,
        }
    }
}

/// Monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Watching,
    Remediating,
}

/// What handling one event amounted to
#[derive(Debug)]
pub enum TamperVerdict {
    /// Not enforcing; edits are the operator's business
    Ignored,
    /// Region still matches; the change was outside it or our own write
    Intact,
    /// Region was wrong, the attempt was counted, and the policy reapplied
    Remediated(LayerReport),
}

impl TamperVerdict {
    pub fn is_remediated(&self) -> bool {
        matches!(self, TamperVerdict::Remediated(_))
    }
}

/// Detects out-of-band edits of the managed region and heals them
pub struct TamperMonitor {
    state: Arc<StateHandle>,
    blocker: Arc<LayeredBlocker>,
    policy: Arc<BlockPolicy>,
    status: Mutex<MonitorState>,
}

impl TamperMonitor {
    pub fn new(state: Arc<StateHandle>, blocker: Arc<LayeredBlocker>, policy: Arc<BlockPolicy>) -> Self {
        Self {
            state,
            blocker,
            policy,
            status: Mutex::new(MonitorState::Idle),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(MonitorState::Idle)
    }

    fn set_state(&self, next: MonitorState) {
        if let Ok(mut status) = self.status.lock() {
            *status = next;
        }
    }

    /// Start watching the resource's directory; events go to `tx`
    ///
    /// The returned sender stops the watcher thread when dropped or sent to.
    pub fn watch(
        &self,
        debounce: Duration,
        tx: mpsc::Sender<TamperEvent>,
    ) -> Result<std_mpsc::SyncSender<()>> {
        let stop = spawn_watcher(self.blocker.resource_path(), debounce, tx)?;
        self.set_state(MonitorState::Watching);
        Ok(stop)
    }

    /// Check one notification and remediate if the region was tampered with
    pub async fn handle(&self, event: TamperEvent) -> Result<TamperVerdict> {
        let guard = self.blocker.exclusive().await;
        let snapshot = self.state.snapshot().await;

        if !snapshot.is_guarded() {
            tracing::debug!(
                path = %event.resource_path.display(),
                focus = snapshot.focus_mode_enabled,
                blocked = snapshot.blocked,
                "Resource changed outside enforcement, ignoring"
            );
            return Ok(TamperVerdict::Ignored);
        }

        match guard.region_matches(&self.policy) {
            Ok(true) => {
                tracing::debug!(source = ?event.source, "Managed region intact");
                return Ok(TamperVerdict::Intact);
            }
            Ok(false) => {}
            // Unreadable counts as tampered; reapply reports the real cause
            Err(e) => tracing::warn!(error = %e, "Cannot verify managed region"),
        }

        let previous = self.state();
        self.set_state(MonitorState::Remediating);

        let (count, after) = self
            .state
            .update(|s| {
                s.bypass_attempt_count += 1;
                s.bypass_attempt_count
            })
            .await;
        tracing::warn!(
            path = %event.resource_path.display(),
            source = ?event.source,
            bypass_attempts = count,
            "Tampering detected, reapplying policy"
        );
        self.state.emit(
            EventKind::TamperDetected {
                resource_path: event.resource_path.clone(),
            },
            &after,
        );

        let report = guard.reapply(&self.policy).await;
        self.set_state(if previous == MonitorState::Idle {
            MonitorState::Idle
        } else {
            MonitorState::Watching
        });

        if report.resource_ok() {
            tracing::info!(bypass_attempts = count, "Managed region restored");
        }
        Ok(TamperVerdict::Remediated(report.into_result()?))
    }

    /// Re-verify the region without a filesystem notification
    pub async fn sweep(&self) -> Result<TamperVerdict> {
        self.handle(TamperEvent::new(
            self.blocker.resource_path(),
            TamperSource::Sweep,
        ))
        .await
    }

    /// Consume watcher events until the channel closes
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TamperEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(event).await {
                tracing::error!(error = %e, "Tamper remediation failed");
            }
        }
        self.set_state(MonitorState::Idle);
    }
}

fn is_relevant(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    let kind_matters = matches!(
        event.kind,
        FsEventKind::Any | FsEventKind::Create(_) | FsEventKind::Modify(_) | FsEventKind::Remove(_)
    );
    kind_matters
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Watch the directory containing `path` and send a [`TamperEvent`] for
/// changes to that file
///
/// The first change after a quiet period is sent immediately; further
/// changes inside the debounce window collapse into one trailing event
/// once the window has passed.
pub fn spawn_watcher(
    path: &Path,
    debounce: Duration,
    tx: mpsc::Sender<TamperEvent>,
) -> Result<std_mpsc::SyncSender<()>> {
    // Follow a symlinked resource to the directory its content lives in
    let watched = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let file_name = watched
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| FocusError::Config(format!("{} has no file name", path.display())))?;
    let dir = watched
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(raw_tx, notify::Config::default())
        .map_err(|e| FocusError::Config(format!("watcher init failed: {e}")))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| FocusError::Config(format!("cannot watch {}: {e}", dir.display())))?;

    let (stop_tx, stop_rx) = std_mpsc::sync_channel::<()>(1);
    let resource = path.to_path_buf();

    std::thread::spawn(move || {
        // Owned by the thread so the OS watch lives as long as the loop
        let _watcher = watcher;
        let mut last_sent: Option<Instant> = None;
        let mut pending = false;

        tracing::debug!(dir = %dir.display(), "Watching resource directory");

        let send = |last_sent: &mut Option<Instant>| -> bool {
            *last_sent = Some(Instant::now());
            tx.blocking_send(TamperEvent::new(&resource, TamperSource::Watcher))
                .is_ok()
        };

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(std_mpsc::TryRecvError::Disconnected) => break,
                Err(std_mpsc::TryRecvError::Empty) => {}
            }

            match raw_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(event)) => {
                    if !is_relevant(&event, &file_name) {
                        continue;
                    }
                    let quiet = last_sent.map_or(true, |t| t.elapsed() >= debounce);
                    if quiet {
                        pending = false;
                        if !send(&mut last_sent) {
                            break;
                        }
                    } else {
                        tracing::debug!(kind = ?event.kind, "Change debounced");
                        pending = true;
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Watch error"),
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if pending && last_sent.is_some_and(|t| t.elapsed() >= debounce) {
                pending = false;
                if !send(&mut last_sent) {
                    break;
                }
            }
        }

        tracing::debug!(dir = %dir.display(), "Watcher stopped");
    });

    Ok(stop_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocker::testing::{blocker, journal, policy, MemoryResource};
    use crate::events::EventBus;
    use crate::state::EnforcementState;
    use crate::store::MemoryStateStore;

    struct Fixture {
        monitor: TamperMonitor,
        resource: Arc<MemoryResource>,
        store: Arc<MemoryStateStore>,
        state: Arc<StateHandle>,
        journal: Arc<std::sync::Mutex<Vec<String>>>,
    }

    async fn fixture(focus: bool, blocked: bool) -> Fixture {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        let blocker = Arc::new(blocker);
        let policy = Arc::new(policy());
        if blocked {
            blocker.enforce(&policy).await;
        }
        journal.lock().unwrap().clear();

        let store = Arc::new(MemoryStateStore::with_state(EnforcementState {
            focus_mode_enabled: focus,
            blocked,
            ..Default::default()
        }));
        let state = Arc::new(StateHandle::restore(store.clone(), EventBus::default()));
        Fixture {
            monitor: TamperMonitor::new(state.clone(), blocker, policy),
            resource,
            store,
            state,
            journal,
        }
    }

    fn event() -> TamperEvent {
        TamperEvent::new("/mem/hosts", TamperSource::Watcher)
    }

    #[tokio::test]
    async fn test_deleted_region_is_counted_and_restored() {
        let fx = fixture(true, true).await;
        let mut events = fx.state.events().subscribe();
        fx.resource.set_content("127.0.0.1 localhost\n");

        let verdict = fx.monitor.handle(event()).await.unwrap();
        assert!(verdict.is_remediated());
        assert!(crate::hosts::content_matches(&fx.resource.content(), &policy()));
        assert_eq!(fx.state.snapshot().await.bypass_attempt_count, 1);
        assert_eq!(fx.store.snapshot().unwrap().bypass_attempt_count, 1);

        let emitted = events.recv().await.unwrap();
        assert_eq!(emitted.kind.name(), "tamper_detected");
        assert_eq!(emitted.counters.bypass_attempt_count, 1);

        // Escalation forced the disabled restart layer
        assert!(fx
            .journal
            .lock()
            .unwrap()
            .contains(&"restart:enforce!".to_string()));
        assert_eq!(fx.monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_edit_outside_region_is_not_counted() {
        let fx = fixture(true, true).await;
        let content = format!("10.0.0.5 nas.local\n{}", fx.resource.content());
        fx.resource.set_content(&content);

        let verdict = fx.monitor.handle(event()).await.unwrap();
        assert!(matches!(verdict, TamperVerdict::Intact));
        assert_eq!(fx.state.snapshot().await.bypass_attempt_count, 0);
        assert!(fx.journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_enforcing_is_ignored() {
        for (focus, blocked) in [(false, false), (true, false), (false, true)] {
            let fx = fixture(focus, blocked).await;
            fx.resource.set_content("");
            let verdict = fx.monitor.handle(event()).await.unwrap();
            assert!(matches!(verdict, TamperVerdict::Ignored));
            assert_eq!(fx.state.snapshot().await.bypass_attempt_count, 0);
        }
    }

    #[tokio::test]
    async fn test_each_tamper_counts_once() {
        let fx = fixture(true, true).await;
        for expected in 1..=3 {
            fx.resource.set_content("");
            fx.monitor.handle(event()).await.unwrap();
            // The remediation write itself is not a second tamper
            fx.monitor.handle(event()).await.unwrap();
            assert_eq!(fx.state.snapshot().await.bypass_attempt_count, expected);
        }
    }

    #[tokio::test]
    async fn test_failed_reapply_still_counts() {
        let fx = fixture(true, true).await;
        fx.resource.set_content("");
        *fx.resource.fail.lock().unwrap() = true;

        let err = fx.monitor.handle(event()).await.unwrap_err();
        assert!(matches!(err, FocusError::PermissionDenied { .. }));
        assert_eq!(fx.state.snapshot().await.bypass_attempt_count, 1);
    }

    #[tokio::test]
    async fn test_sweep_detects_drift() {
        let fx = fixture(true, true).await;
        let tampered = fx.resource.content().replace("127.0.0.1 youtube.com\n", "");
        fx.resource.set_content(&tampered);

        assert!(fx.monitor.sweep().await.unwrap().is_remediated());
        assert!(matches!(
            fx.monitor.sweep().await.unwrap(),
            TamperVerdict::Intact
        ));
        assert_eq!(fx.state.snapshot().await.bypass_attempt_count, 1);
    }

    #[tokio::test]
    async fn test_watcher_reports_changes_to_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let stop = spawn_watcher(&path, Duration::from_millis(50), tx).unwrap();
        // Give the OS watch a moment to register
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, "127.0.0.1 localhost\n# edited\n").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watcher event")
            .unwrap();
        assert_eq!(event.resource_path, path);
        assert_eq!(event.source, TamperSource::Watcher);

        drop(stop);
    }

    #[tokio::test]
    async fn test_watcher_collapses_a_burst() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let debounce = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::channel(16);
        let stop = spawn_watcher(&path, debounce, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        for i in 0..5 {
            std::fs::write(&path, format!("127.0.0.1 localhost\n# edit {i}\n")).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no leading event")
            .unwrap();
        let mut received = 1;
        let deadline = tokio::time::Instant::now() + debounce * 3;
        while let Ok(Some(_)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            received += 1;
        }
        // One leading edge, at most one trailing flush
        assert!((1..=2).contains(&received), "received {received} events");

        tokio::time::sleep(debounce * 2).await;
        assert!(rx.try_recv().is_err());

        drop(stop);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watcher_follows_symlinked_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let real_dir = dir.path().join("static");
        std::fs::create_dir(&real_dir).unwrap();
        let real = real_dir.join("hosts");
        std::fs::write(&real, "127.0.0.1 localhost\n").unwrap();
        let link = dir.path().join("hosts");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let stop = spawn_watcher(&link, Duration::from_millis(50), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&real, "127.0.0.1 localhost\n# edited\n").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watcher event")
            .unwrap();
        assert_eq!(event.resource_path, link);

        drop(stop);
    }

    #[test]
    fn test_watcher_requires_file_name() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(spawn_watcher(Path::new("/"), DEFAULT_DEBOUNCE, tx).is_err());
    }
}
