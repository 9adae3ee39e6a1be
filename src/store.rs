//! Enforcement state persistence
//!
//! Provides pluggable persistence for `EnforcementState` so a session
//! survives process restarts. The engine saves after every mutation and
//! loads once at startup; a missing snapshot means defaults.

use crate::error::{FocusError, Result};
use crate::events::{Counters, EventBus, EventKind};
use crate::state::EnforcementState;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for persisting enforcement state snapshots
pub trait StateStore: Send + Sync {
    /// Save a full snapshot
    fn save(&self, state: &EnforcementState) -> Result<()>;

    /// Load the last snapshot, or defaults if none was ever written
    fn load(&self) -> Result<EnforcementState>;

    /// Move an unreadable snapshot out of the way so the next save cannot
    /// destroy it; returns where it went, if anywhere
    fn quarantine(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// JSON file-based state store
///
/// Persists the snapshot as a pretty-printed JSON file on disk.
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a new file state store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &EnforcementState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;

        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FocusError::Persistence(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
            FocusError::Persistence(format!(
                "Failed to create state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                FocusError::Persistence(format!(
                    "Failed to write state file {}: {}",
                    tmp_path.display(),
                    e
                ))
            })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            FocusError::Persistence(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "State saved");
        Ok(())
    }

    fn load(&self) -> Result<EnforcementState> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "No state snapshot, using defaults");
            return Ok(EnforcementState::default());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            FocusError::Persistence(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let state: EnforcementState = serde_json::from_str(&json).map_err(|e| {
            FocusError::Persistence(format!(
                "Failed to parse state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            blocked = state.blocked,
            focus = state.focus_mode_enabled,
            "State loaded"
        );
        Ok(state.normalized())
    }

    fn quarantine(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{stamp}"));
        let aside = PathBuf::from(aside);

        std::fs::rename(&self.path, &aside).map_err(|e| {
            FocusError::Persistence(format!(
                "Failed to move corrupt state file {} → {}: {}",
                self.path.display(),
                aside.display(),
                e
            ))
        })?;
        Ok(Some(aside))
    }
}

/// In-memory state store for testing
///
/// Stores the snapshot in memory; lost on drop, but useful for tests.
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::RwLock<Option<EnforcementState>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryStateStore {
    /// Start from an existing snapshot, as if restored from disk
    pub fn with_state(state: EnforcementState) -> Self {
        Self {
            state: std::sync::RwLock::new(Some(state)),
            saves: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Last snapshot written, if any
    pub fn snapshot(&self) -> Option<EnforcementState> {
        self.state.read().ok().and_then(|s| s.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &EnforcementState) -> Result<()> {
        let mut slot = self.state.write().map_err(|e| {
            FocusError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        *slot = Some(state.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<EnforcementState> {
        let slot = self.state.read().map_err(|e| {
            FocusError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        Ok(slot.clone().unwrap_or_default())
    }
}

/// Authoritative in-memory state, persisted after every mutation
///
/// Readers take a cloned snapshot and never wait on a slow save. A failed
/// save is logged; the in-memory value stays authoritative until the next
/// successful write.
pub struct StateHandle {
    state: RwLock<EnforcementState>,
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl StateHandle {
    /// Restore from the store, falling back to defaults if the snapshot is unreadable
    ///
    /// An unreadable snapshot is moved aside first, so the counters it holds
    /// survive for the operator to recover.
    pub fn restore(store: Arc<dyn StateStore>, events: EventBus) -> Self {
        let state = match store.load() {
            Ok(state) => state,
            Err(e) => {
                match store.quarantine() {
                    Ok(Some(aside)) => tracing::error!(
                        error = %e,
                        moved_to = %aside.display(),
                        "Unreadable state snapshot moved aside, using defaults"
                    ),
                    Ok(None) => tracing::error!(error = %e, "Failed to load state snapshot, using defaults"),
                    Err(moved) => tracing::error!(
                        error = %e,
                        quarantine = %moved,
                        "Unreadable state snapshot could not be moved aside, using defaults"
                    ),
                }
                EnforcementState::default()
            }
        };
        Self {
            state: RwLock::new(state),
            store,
            events,
        }
    }

    /// Cloned point-in-time view
    pub async fn snapshot(&self) -> EnforcementState {
        self.state.read().await.clone()
    }

    /// Mutate, stamp `last_check`, and persist; returns the closure's value
    /// and the state as written
    pub async fn update<R>(&self, f: impl FnOnce(&mut EnforcementState) -> R) -> (R, EnforcementState) {
        let mut state = self.state.write().await;
        let out = f(&mut state);
        state.last_check = Some(Utc::now());
        if let Err(e) = self.store.save(&state) {
            tracing::warn!(error = %e, "State not persisted, keeping in-memory copy");
        }
        (out, state.clone())
    }

    /// Broadcast an event carrying the given state's counters
    pub fn emit(&self, kind: EventKind, state: &EnforcementState) {
        self.events.emit(kind, Counters::from(state));
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
