//! # focus-guard
//!
//! Tamper-resistant focus sessions for a single machine.
//!
//! ## Overview
//!
//! `focus-guard` blocks a set of hostnames by writing a marked region into
//! the system hosts file for a daily time window. While the block is in
//! force the engine watches the file and re-applies the region whenever it
//! is edited away, and it refuses to exit until the operator answers an
//! arithmetic challenge whose difficulty climbs with repeated failures.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use focus_guard::{
//!     ArithmeticLadder, BlockPolicy, EngineOptions, FileStateStore, FocusEngine,
//!     system_blocker,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> focus_guard::Result<()> {
//! let policy = BlockPolicy::new("127.0.0.1".parse().unwrap(), ["youtube.com"])?;
//! let options = EngineOptions::default();
//! let blocker = system_blocker(Path::new("/etc/hosts"), &[], &options);
//!
//! let engine = FocusEngine::new(
//!     policy,
//!     blocker,
//!     Arc::new(FileStateStore::new("/var/lib/focus-guard/state.json")),
//!     Arc::new(ArithmeticLadder),
//!     options,
//! );
//!
//! let start = chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap();
//! let end = chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap();
//! let state = engine.start_focus_mode(start, end, 1).await?;
//! println!("phase: {}", state.phase());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ResourceMutator**: idempotent insert/remove of the managed region
//! - **LayeredBlocker**: the mutator plus ordered best-effort auxiliary layers
//! - **TamperMonitor**: detects and reverts edits to the managed region
//! - **ChallengeGatekeeper**: gates process exit behind a challenge round
//! - **SessionStateMachine**: evaluates the focus window on every tick
//! - **FocusEngine**: wires them together around one persisted state

pub mod alert;
pub mod blocker;
pub mod challenge;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hosts;
pub mod ipc;
pub mod layers;
pub mod lock;
pub mod monitor;
pub mod policy;
pub mod session;
pub mod signals;
pub mod state;
pub mod store;

pub use blocker::{LayerOutcome, LayerReport, LayerStatus, LayeredBlocker};
pub use challenge::{
    AnswerSource, ArithmeticLadder, Challenge, ChallengeGatekeeper, ChallengeGenerator,
    Escalation, RoundOutcome, Verdict,
};
pub use config::FocusConfig;
pub use engine::{
    system_blocker, Clock, EngineOptions, ExitDecision, ExitRequest, ExitSource, FocusEngine,
    SystemClock,
};
pub use error::{FocusError, Result};
pub use events::{Counters, EngineEvent, EventBus, EventKind};
pub use hosts::{HostsFile, MutationOutcome, PermissionGuard, ResourceMutator};
pub use layers::{AuxiliaryLayer, LayerAction, LayerContext, LayerStage};
pub use lock::InstanceLock;
pub use monitor::{TamperEvent, TamperMonitor, TamperVerdict};
pub use policy::BlockPolicy;
pub use session::{SessionStateMachine, Transition};
pub use state::{EnforcementState, SessionPhase, TimeWindow};
pub use store::{FileStateStore, MemoryStateStore, StateHandle, StateStore};
