//! Session state machine
//!
//! `Inactive -> Armed` and back are operator actions. `Armed <-> Enforcing`
//! follows the wall clock on every tick. Each transition runs the blocker
//! and updates state while the enforcement mutex is held, so the state never
//! disagrees with the resource once the mutex is released.

use crate::blocker::{Enforcement, LayerReport, LayeredBlocker};
use crate::error::{FocusError, Result};
use crate::events::EventKind;
use crate::policy::BlockPolicy;
use crate::state::{EnforcementState, SessionPhase, TimeWindow, MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::store::StateHandle;
use chrono::NaiveTime;
use std::sync::Arc;

/// A time-driven change of phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Armed -> Enforcing`
    Enforced,
    /// `Enforcing -> Armed`
    Lifted,
}

/// Whether the policy should be applied at `now`
pub fn should_block(state: &EnforcementState, now: NaiveTime) -> bool {
    state.focus_mode_enabled && state.window.is_some_and(|w| w.contains(now))
}

/// Decide the tick transition, if any
///
/// Only sessions in focus mode are driven by the clock; a manual block
/// outside focus mode stays until manually lifted.
pub fn plan_transition(state: &EnforcementState, now: NaiveTime) -> Option<Transition> {
    if !state.focus_mode_enabled {
        return None;
    }
    match (state.blocked, should_block(state, now)) {
        (false, true) => Some(Transition::Enforced),
        (true, false) => Some(Transition::Lifted),
        _ => None,
    }
}

/// Owns focus/blocked transitions and their counters
pub struct SessionStateMachine {
    state: Arc<StateHandle>,
    blocker: Arc<LayeredBlocker>,
    policy: Arc<BlockPolicy>,
}

impl SessionStateMachine {
    pub fn new(state: Arc<StateHandle>, blocker: Arc<LayeredBlocker>, policy: Arc<BlockPolicy>) -> Self {
        Self {
            state,
            blocker,
            policy,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.snapshot().await.phase()
    }

    /// Evaluate the window at `now` and transition if needed
    pub async fn tick(&self, now: NaiveTime) -> Result<Option<Transition>> {
        let guard = self.blocker.exclusive().await;
        let snapshot = self.state.snapshot().await;
        let Some(transition) = plan_transition(&snapshot, now) else {
            return Ok(None);
        };

        tracing::info!(?transition, now = %now.format("%H:%M:%S"), "Window transition");
        match transition {
            Transition::Enforced => self.block_locked(&guard).await?,
            Transition::Lifted => self.unblock_locked(&guard).await?,
        };
        Ok(Some(transition))
    }

    /// Turn focus mode on for a daily window
    pub async fn start_focus(&self, window: TimeWindow, difficulty: u8) -> Result<EnforcementState> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
            return Err(FocusError::Config(format!(
                "difficulty must be between {MIN_DIFFICULTY} and {MAX_DIFFICULTY}, got {difficulty}"
            )));
        }
        let (_, after) = self
            .state
            .update(|s| {
                s.focus_mode_enabled = true;
                s.window = Some(window);
                s.difficulty_level = difficulty;
            })
            .await;
        tracing::info!(%window, difficulty, "Focus mode started");
        self.state.emit(EventKind::FocusStarted, &after);
        Ok(after)
    }

    /// Turn focus mode off, lifting the policy if it is applied
    ///
    /// If the lift fails on the resource, focus mode stays on.
    pub async fn stop_focus(&self) -> Result<EnforcementState> {
        let guard = self.blocker.exclusive().await;
        if self.state.snapshot().await.blocked {
            self.unblock_locked(&guard).await?;
        }
        let (_, after) = self.state.update(|s| s.focus_mode_enabled = false).await;
        tracing::info!("Focus mode stopped");
        self.state.emit(EventKind::FocusStopped, &after);
        Ok(after)
    }

    /// Apply the policy now, regardless of the window
    pub async fn manual_block(&self) -> Result<LayerReport> {
        let guard = self.blocker.exclusive().await;
        self.block_locked(&guard).await
    }

    /// Lift the policy now, regardless of the window
    pub async fn manual_unblock(&self) -> Result<LayerReport> {
        let guard = self.blocker.exclusive().await;
        self.unblock_locked(&guard).await
    }

    /// Bring the resource back in line with a restored snapshot
    ///
    /// A snapshot that says `blocked` is re-enforced; like any other
    /// enforce attempt it counts as an application.
    pub async fn resume(&self) -> Result<()> {
        let guard = self.blocker.exclusive().await;
        if !self.state.snapshot().await.blocked {
            return Ok(());
        }
        tracing::info!("Restoring enforcement from snapshot");
        let report = guard.enforce(&self.policy).await;
        let (count, _) = self
            .state
            .update(|s| {
                s.block_application_count += 1;
                s.block_application_count
            })
            .await;
        tracing::debug!(block_applications = count, "Snapshot enforcement re-applied");
        report.into_result()?;
        Ok(())
    }

    /// Lift and leave focus mode, used when an exit is granted
    ///
    /// Focus mode is cleared even if the lift fails so the next start does
    /// not resume a session the operator has paid to leave.
    pub async fn deactivate(&self) -> Result<EnforcementState> {
        let guard = self.blocker.exclusive().await;
        let lifted = self.unblock_locked(&guard).await;
        let (_, after) = self.state.update(|s| s.focus_mode_enabled = false).await;
        self.state.emit(EventKind::FocusStopped, &after);
        lifted.map(|_| after)
    }

    /// Best-effort lift that keeps focus mode as configured
    pub async fn release(&self) -> Result<EnforcementState> {
        let guard = self.blocker.exclusive().await;
        let lifted = self.unblock_locked(&guard).await;
        let after = self.state.update(|_| ()).await.1;
        lifted.map(|_| after)
    }

    async fn block_locked(&self, guard: &Enforcement<'_>) -> Result<LayerReport> {
        let report = guard.enforce(&self.policy).await;
        let applied = report.resource_ok();
        let (count, after) = self
            .state
            .update(|s| {
                // Counted per attempt, applied or not
                s.block_application_count += 1;
                if applied {
                    s.blocked = true;
                }
                s.block_application_count
            })
            .await;

        if applied {
            tracing::info!(block_applications = count, "Blocked");
            self.state.emit(EventKind::Blocked, &after);
        }
        report.into_result()
    }

    async fn unblock_locked(&self, guard: &Enforcement<'_>) -> Result<LayerReport> {
        let report = guard.lift(&self.policy).await;
        if report.resource_ok() {
            let (was_blocked, after) = self
                .state
                .update(|s| std::mem::replace(&mut s.blocked, false))
                .await;
            if was_blocked {
                tracing::info!("Unblocked");
                self.state.emit(EventKind::Unblocked, &after);
            }
        }
        report.into_result()
    }
}
