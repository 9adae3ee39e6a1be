//! Focus engine
//!
//! Wires the session state machine, tamper monitor, and challenge
//! gatekeeper around one shared state and one layered blocker, and exposes
//! the operations a presentation layer may call.

use crate::blocker::{LayerReport, LayeredBlocker};
use crate::challenge::{
    AnswerSource, ChallengeGatekeeper, ChallengeGenerator, Escalation, RoundOutcome,
    DEFAULT_MAX_ATTEMPTS,
};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::hosts::{HostsFile, PermissionGuard};
use crate::layers::{
    BrowserCacheLayer, BrowserRestartLayer, BrowserSpec, CommandRunner, PacketFilterLayer,
    Platform, ResolverFlushLayer, SystemRunner,
};
use crate::monitor::{TamperMonitor, DEFAULT_DEBOUNCE};
use crate::policy::BlockPolicy;
use crate::session::{SessionStateMachine, Transition};
use crate::state::{EnforcementState, TimeWindow};
use crate::store::{StateHandle, StateStore};
use chrono::{DateTime, NaiveTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

/// Time browsers get to quit before they are killed
const RESTART_GRACE: Duration = Duration::from_secs(3);

/// Engine switches; one engine serves every deployment flavour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub dns_flush_enabled: bool,
    pub firewall_layer_enabled: bool,
    pub browser_cache_enabled: bool,
    pub browser_restart_enabled: bool,
    pub notifications_enabled: bool,
    pub ipc_enabled: bool,
    pub tick_interval: Duration,
    pub debounce: Duration,
    pub max_attempts: u32,
    /// Make the resource read-only while enforcing
    pub lock_resource: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dns_flush_enabled: true,
            firewall_layer_enabled: false,
            browser_cache_enabled: true,
            browser_restart_enabled: false,
            notifications_enabled: true,
            ipc_enabled: true,
            tick_interval: Duration::from_secs(60),
            debounce: DEFAULT_DEBOUNCE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_resource: true,
        }
    }
}

/// Blocker over the real hosts file with the OS command layers
pub fn system_blocker(hosts_path: &Path, browsers: &[String], options: &EngineOptions) -> LayeredBlocker {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::default());
    let platform = Platform::current();
    let specs = BrowserSpec::resolve_all(browsers, platform);
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    let pf_rules = std::env::temp_dir().join("focus-guard.pf.conf");

    let blocker = LayeredBlocker::new(Arc::new(HostsFile::new(hosts_path)))
        .with_layer(
            Arc::new(ResolverFlushLayer::new(runner.clone(), platform)),
            options.dns_flush_enabled,
        )
        .with_layer(
            Arc::new(PacketFilterLayer::new(runner.clone(), platform, pf_rules)),
            options.firewall_layer_enabled,
        )
        .with_layer(
            Arc::new(BrowserCacheLayer::new(runner.clone(), specs.clone(), home)),
            options.browser_cache_enabled,
        )
        .with_layer(
            Arc::new(BrowserRestartLayer::new(runner, specs, platform, RESTART_GRACE)),
            options.browser_restart_enabled,
        );

    if options.lock_resource {
        blocker.with_permission_guard(PermissionGuard::new(hosts_path))
    } else {
        blocker
    }
}

/// Source of the local time of day
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

/// Wall clock in the local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        chrono::Local::now().time()
    }
}

/// Where a termination request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitSource {
    /// OS signal, by name (`SIGINT`, `SIGTERM`, ...)
    Signal(String),
    /// Control surface request
    Control,
}

/// A request to terminate the engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub source: ExitSource,
    pub received_at: DateTime<Utc>,
}

impl ExitRequest {
    pub fn new(source: ExitSource) -> Self {
        Self {
            source,
            received_at: Utc::now(),
        }
    }
}

/// Whether the process may exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Granted,
    Denied { escalation: Option<Escalation> },
}

impl ExitDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, ExitDecision::Granted)
    }
}

/// The focus enforcement engine
pub struct FocusEngine {
    state: Arc<StateHandle>,
    blocker: Arc<LayeredBlocker>,
    session: SessionStateMachine,
    monitor: Arc<TamperMonitor>,
    gatekeeper: ChallengeGatekeeper,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
}

impl FocusEngine {
    /// Build an engine, restoring state from `store`
    pub fn new(
        policy: BlockPolicy,
        blocker: LayeredBlocker,
        store: Arc<dyn StateStore>,
        generator: Arc<dyn ChallengeGenerator>,
        options: EngineOptions,
    ) -> Self {
        let policy = Arc::new(policy);
        let blocker = Arc::new(blocker);
        let state = Arc::new(StateHandle::restore(store, EventBus::default()));
        Self {
            session: SessionStateMachine::new(state.clone(), blocker.clone(), policy.clone()),
            monitor: Arc::new(TamperMonitor::new(state.clone(), blocker.clone(), policy)),
            gatekeeper: ChallengeGatekeeper::new(generator, options.max_attempts),
            clock: Arc::new(SystemClock),
            state,
            blocker,
            options,
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn monitor(&self) -> &Arc<TamperMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        self.state.events()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events().subscribe()
    }

    /// Snapshot of the current state; never waits on an enforcement
    pub async fn status(&self) -> EnforcementState {
        self.state.snapshot().await
    }

    /// Enable focus mode for a daily window and evaluate it immediately
    pub async fn start_focus_mode(
        &self,
        window_start: NaiveTime,
        window_end: NaiveTime,
        difficulty: u8,
    ) -> Result<EnforcementState> {
        let window = TimeWindow::new(window_start, window_end)?;
        self.session.start_focus(window, difficulty).await?;
        self.session.tick(self.clock.now()).await?;
        Ok(self.status().await)
    }

    /// Disable focus mode and lift the policy
    pub async fn stop_focus_mode(&self) -> Result<EnforcementState> {
        self.session.stop_focus().await
    }

    pub async fn manual_block(&self) -> Result<LayerReport> {
        self.session.manual_block().await
    }

    pub async fn manual_unblock(&self) -> Result<LayerReport> {
        self.session.manual_unblock().await
    }

    /// Re-enforce a snapshot that was blocked when the last process ended
    pub async fn resume(&self) -> Result<()> {
        self.session.resume().await
    }

    /// Run one tick at the clock's current time
    pub async fn tick(&self) -> Result<Option<Transition>> {
        self.tick_at(self.clock.now()).await
    }

    /// Evaluate the window at `now`, then sweep the region if enforcing
    pub async fn tick_at(&self, now: NaiveTime) -> Result<Option<Transition>> {
        let transition = self.session.tick(now).await?;
        if self.status().await.is_guarded() {
            if let Err(e) = self.monitor.sweep().await {
                tracing::error!(error = %e, "Integrity sweep failed");
            }
        }
        Ok(transition)
    }

    /// Gate a termination request
    ///
    /// While blocked the operator must pass a challenge round; otherwise the
    /// exit is granted after a best-effort lift.
    pub async fn handle_exit_request(&self, request: ExitRequest, answers: &mut dyn AnswerSource) -> ExitDecision {
        let snapshot = self.status().await;
        tracing::info!(source = ?request.source, blocked = snapshot.blocked, "Exit requested");

        if !snapshot.blocked {
            let after = match self.session.release().await {
                Ok(after) => after,
                Err(e) => {
                    tracing::warn!(error = %e, "Lift on exit failed");
                    self.status().await
                }
            };
            self.state.emit(EventKind::ExitGranted, &after);
            return ExitDecision::Granted;
        }

        let outcome = self
            .gatekeeper
            .run_round(snapshot.difficulty_level, answers)
            .await;
        let (escalation, after) = self
            .state
            .update(|s| self.gatekeeper.record_outcome(s, outcome))
            .await;

        match outcome {
            RoundOutcome::Passed { attempts } => {
                tracing::info!(attempts, "Exit challenge passed");
                let after = match self.session.deactivate().await {
                    Ok(after) => after,
                    Err(e) => {
                        tracing::error!(error = %e, "Lift after passed challenge failed");
                        self.status().await
                    }
                };
                self.state.emit(EventKind::ExitGranted, &after);
                ExitDecision::Granted
            }
            RoundOutcome::Exhausted => {
                tracing::warn!(
                    failures = after.consecutive_challenge_failures,
                    difficulty = after.difficulty_level,
                    "Exit challenge failed, staying up"
                );
                self.state.emit(EventKind::ChallengeFailed, &after);
                if let Some(Escalation { from, to }) = escalation {
                    self.state
                        .emit(EventKind::DifficultyEscalated { from, to }, &after);
                }
                self.state.emit(EventKind::ExitDenied, &after);
                ExitDecision::Denied { escalation }
            }
        }
    }

    /// Run until an exit request is granted
    ///
    /// Spawns the tick loop and the tamper monitor; exit requests are
    /// handled here, one at a time.
    pub async fn run(self: Arc<Self>, mut exit_rx: mpsc::Receiver<ExitRequest>, mut answers: Box<dyn AnswerSource>) {
        if let Err(e) = self.resume().await {
            tracing::error!(error = %e, "Failed to restore enforcement");
        }

        let (tamper_tx, tamper_rx) = mpsc::channel(16);
        let _watch = match self.monitor.watch(self.options.debounce, tamper_tx) {
            Ok(stop) => Some(stop),
            Err(e) => {
                tracing::warn!(error = %e, "File watcher unavailable, relying on tick sweeps");
                None
            }
        };
        let monitor_task = tokio::spawn(self.monitor.clone().run(tamper_rx));

        let engine = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.options.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.tick().await {
                    tracing::error!(error = %e, "Tick failed");
                }
            }
        });

        tracing::info!(
            resource = %self.blocker.resource_path().display(),
            layers = ?self.blocker.layer_names(),
            "Focus engine running"
        );

        loop {
            let Some(request) = exit_rx.recv().await else {
                tracing::warn!("Exit channel closed");
                break;
            };
            if self
                .handle_exit_request(request, answers.as_mut())
                .await
                .is_granted()
            {
                break;
            }
        }

        tick_task.abort();
        monitor_task.abort();
        tracing::info!("Focus engine stopped");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::blocker::testing::{blocker, journal, policy, MemoryResource};
    use crate::challenge::testing::FixedGenerator;
    use crate::state::parse_time_of_day;
    use crate::store::MemoryStateStore;

    pub struct FixedClock(pub NaiveTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveTime {
            self.0
        }
    }

    pub fn t(s: &str) -> NaiveTime {
        parse_time_of_day(s).unwrap()
    }

    /// Engine over an in-memory resource with its clock stopped at `now`
    pub fn engine(now: &str) -> (FocusEngine, Arc<MemoryResource>, Arc<MemoryStateStore>) {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        let store = Arc::new(MemoryStateStore::default());
        let engine = FocusEngine::new(
            policy(),
            blocker,
            store.clone(),
            Arc::new(FixedGenerator),
            EngineOptions::default(),
        )
        .with_clock(Arc::new(FixedClock(t(now))));
        (engine, resource, store)
    }
}
