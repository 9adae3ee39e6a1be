//! Enforcement state, the single mutable source of truth
//!
//! All types use camelCase JSON serialization; window bounds are stored as
//! ISO-8601 times of day (`"09:00:00"`).

use crate::error::{FocusError, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest challenge difficulty
pub const MIN_DIFFICULTY: u8 = 1;

/// Highest challenge difficulty
pub const MAX_DIFFICULTY: u8 = 5;

/// Daily focus window `[start, end)`, possibly wrapping midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Create a window; `start == end` is rejected as it selects nothing
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self> {
        if start == end {
            return Err(FocusError::InvalidWindow(format!(
                "start and end are both {}",
                start.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `"HH:MM"` or `"HH:MM:SS"` bounds
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    /// Whether the window spans midnight
    pub fn wraps_midnight(&self) -> bool {
        self.end < self.start
    }

    /// Whether `now` falls inside the window
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.wraps_midnight() {
            now >= self.start || now < self.end
        } else {
            self.start <= now && now < self.end
        }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}–{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Parse a time of day in `HH:MM` or `HH:MM:SS` form
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| FocusError::InvalidWindow(format!("'{s}': {e}")))
}

/// Coarse session phase derived from the state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Focus mode off, nothing applied
    Inactive,
    /// Focus mode on, outside the window, nothing applied
    Armed,
    /// Policy applied
    Enforcing,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Inactive => write!(f, "inactive"),
            SessionPhase::Armed => write!(f, "armed"),
            SessionPhase::Enforcing => write!(f, "enforcing"),
        }
    }
}

/// Persisted enforcement state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementState {
    #[serde(default)]
    pub focus_mode_enabled: bool,

    /// Daily window; absent until focus mode has been started once
    #[serde(default)]
    pub window: Option<TimeWindow>,

    /// Whether the policy is currently applied
    #[serde(default)]
    pub blocked: bool,

    /// Monotonic, never reset
    #[serde(default)]
    pub block_application_count: u64,

    /// Incremented only on detected external tampering
    #[serde(default)]
    pub bypass_attempt_count: u64,

    #[serde(default = "default_difficulty")]
    pub difficulty_level: u8,

    #[serde(default)]
    pub consecutive_challenge_failures: u32,

    /// Last time the state was evaluated and written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

fn default_difficulty() -> u8 {
    MIN_DIFFICULTY
}

impl Default for EnforcementState {
    fn default() -> Self {
        Self {
            focus_mode_enabled: false,
            window: None,
            blocked: false,
            block_application_count: 0,
            bypass_attempt_count: 0,
            difficulty_level: MIN_DIFFICULTY,
            consecutive_challenge_failures: 0,
            last_check: None,
        }
    }
}

impl EnforcementState {
    /// Current phase of the session
    pub fn phase(&self) -> SessionPhase {
        if self.blocked {
            SessionPhase::Enforcing
        } else if self.focus_mode_enabled {
            SessionPhase::Armed
        } else {
            SessionPhase::Inactive
        }
    }

    /// Whether tampering should be remediated and counted right now
    pub fn is_guarded(&self) -> bool {
        self.focus_mode_enabled && self.blocked
    }

    /// Clamp values read from disk back into their valid ranges
    pub fn normalized(mut self) -> Self {
        self.difficulty_level = self.difficulty_level.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        parse_time_of_day(s).unwrap()
    }

    #[test]
    fn test_window_non_wrapping() {
        let w = TimeWindow::parse("09:00", "18:00").unwrap();
        assert!(!w.wraps_midnight());
        assert!(w.contains(t("09:00")));
        assert!(w.contains(t("10:00")));
        assert!(w.contains(t("17:59:59")));
        assert!(!w.contains(t("18:00")));
        assert!(!w.contains(t("08:59")));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let w = TimeWindow::parse("22:00", "06:00").unwrap();
        assert!(w.wraps_midnight());
        assert!(w.contains(t("23:30")));
        assert!(w.contains(t("02:00")));
        assert!(w.contains(t("22:00")));
        assert!(!w.contains(t("06:00")));
        assert!(!w.contains(t("12:00")));
    }

    #[test]
    fn test_degenerate_window_rejected() {
        assert!(TimeWindow::parse("09:00", "09:00").is_err());
        assert!(TimeWindow::parse("25:00", "09:00").is_err());
        assert!(TimeWindow::parse("nine", "18:00").is_err());
    }

    #[test]
    fn test_phase_derivation() {
        let mut s = EnforcementState::default();
        assert_eq!(s.phase(), SessionPhase::Inactive);
        s.focus_mode_enabled = true;
        assert_eq!(s.phase(), SessionPhase::Armed);
        assert!(!s.is_guarded());
        s.blocked = true;
        assert_eq!(s.phase(), SessionPhase::Enforcing);
        assert!(s.is_guarded());
    }

    #[test]
    fn test_json_shape() {
        let state = EnforcementState {
            focus_mode_enabled: true,
            window: Some(TimeWindow::parse("22:00", "06:00").unwrap()),
            blocked: true,
            block_application_count: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["focusModeEnabled"], true);
        assert_eq!(json["window"]["start"], "22:00:00");
        assert_eq!(json["window"]["end"], "06:00:00");
        assert_eq!(json["blockApplicationCount"], 3);
        assert_eq!(json["difficultyLevel"], 1);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let state: EnforcementState = serde_json::from_str(r#"{"blocked": true}"#).unwrap();
        assert!(state.blocked);
        assert_eq!(state.difficulty_level, 1);
        assert_eq!(state.bypass_attempt_count, 0);
    }

    #[test]
    fn test_normalized_clamps_difficulty() {
        let state = EnforcementState {
            difficulty_level: 9,
            ..Default::default()
        };
        assert_eq!(state.normalized().difficulty_level, MAX_DIFFICULTY);
    }
}
