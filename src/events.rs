//! Structured engine events
//!
//! The engine broadcasts one `EngineEvent` per observable change. Loggers,
//! notifiers, and presentation layers subscribe without the engine knowing
//! how they format anything.

use crate::state::EnforcementState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Counter values attached to every event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub block_application_count: u64,
    pub bypass_attempt_count: u64,
    pub difficulty_level: u8,
    pub consecutive_challenge_failures: u32,
}

impl From<&EnforcementState> for Counters {
    fn from(state: &EnforcementState) -> Self {
        Self {
            block_application_count: state.block_application_count,
            bypass_attempt_count: state.bypass_attempt_count,
            difficulty_level: state.difficulty_level,
            consecutive_challenge_failures: state.consecutive_challenge_failures,
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Policy applied
    Blocked,
    /// Policy lifted
    Unblocked,
    /// External modification of the managed region while enforcing
    TamperDetected { resource_path: PathBuf },
    /// A challenge round was exhausted without a correct answer
    ChallengeFailed,
    /// Difficulty went up after repeated failed rounds
    DifficultyEscalated { from: u8, to: u8 },
    /// Focus mode switched on
    FocusStarted,
    /// Focus mode switched off
    FocusStopped,
    /// Termination granted
    ExitGranted,
    /// Termination denied
    ExitDenied,
}

impl EventKind {
    /// Stable short name, matching the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Blocked => "blocked",
            EventKind::Unblocked => "unblocked",
            EventKind::TamperDetected { .. } => "tamper_detected",
            EventKind::ChallengeFailed => "challenge_failed",
            EventKind::DifficultyEscalated { .. } => "difficulty_escalated",
            EventKind::FocusStarted => "focus_started",
            EventKind::FocusStopped => "focus_stopped",
            EventKind::ExitGranted => "exit_granted",
            EventKind::ExitDenied => "exit_denied",
        }
    }
}

/// A single engine event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    #[serde(flatten)]
    pub kind: EventKind,

    pub at: DateTime<Utc>,

    pub counters: Counters,
}

impl EngineEvent {
    /// Create an event stamped now
    pub fn new(kind: EventKind, counters: Counters) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            kind,
            at: Utc::now(),
            counters,
        }
    }
}

/// Broadcast fan-out for engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every future event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit(&self, kind: EventKind, counters: Counters) {
        let event = EngineEvent::new(kind, counters);
        tracing::debug!(event = event.kind.name(), id = %event.id, "Engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
