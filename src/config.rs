//! HCL configuration (`focusguard.hcl`)

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::challenge::DEFAULT_MAX_ATTEMPTS;
use crate::engine::EngineOptions;
use crate::error::{FocusError, Result};
use crate::layers::browser::DEFAULT_BROWSERS;
use crate::policy::{BlockPolicy, DEFAULT_MARKER};
use crate::state::{TimeWindow, MAX_DIFFICULTY, MIN_DIFFICULTY};

/// Default config file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "focusguard.hcl";

#[derive(Debug, Default, Deserialize)]
pub struct FocusConfig {
    #[serde(default)]
    pub guard: GuardSettings,
    #[serde(default)]
    pub focus: FocusSettings,
    #[serde(default)]
    pub layers: LayerSettings,
    /// Blocked hostnames by category, in declaration order
    #[serde(default)]
    pub block: IndexMap<String, BlockCategory>,
}

#[derive(Debug, Deserialize)]
pub struct GuardSettings {
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,
    #[serde(default = "default_redirect_ip")]
    pub redirect_ip: String,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_tick_interval", with = "duration_serde")]
    pub tick_interval: Duration,
    #[serde(default = "default_debounce", with = "duration_serde")]
    pub debounce: Duration,
    #[serde(default = "default_true")]
    pub lock_hosts: bool,
    #[serde(default = "default_true")]
    pub ipc: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            hosts_file: default_hosts_file(),
            redirect_ip: default_redirect_ip(),
            state_file: None,
            lock_file: None,
            socket: None,
            marker: default_marker(),
            log_level: default_log_level(),
            tick_interval: default_tick_interval(),
            debounce: default_debounce(),
            lock_hosts: true,
            ipc: true,
        }
    }
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}
fn default_redirect_ip() -> String {
    "127.0.0.1".into()
}
fn default_marker() -> String {
    DEFAULT_MARKER.into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_debounce() -> Duration {
    Duration::from_secs(1)
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct FocusSettings {
    #[serde(default = "default_start")]
    pub default_start: String,
    #[serde(default = "default_end")]
    pub default_end: String,
    #[serde(default = "default_difficulty")]
    pub default_difficulty: u8,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            default_start: default_start(),
            default_end: default_end(),
            default_difficulty: default_difficulty(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_start() -> String {
    "09:00".into()
}
fn default_end() -> String {
    "18:00".into()
}
fn default_difficulty() -> u8 {
    MIN_DIFFICULTY
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Deserialize)]
pub struct LayerSettings {
    #[serde(default = "default_true")]
    pub dns_flush: bool,
    #[serde(default)]
    pub firewall: bool,
    #[serde(default = "default_true")]
    pub browser_cache: bool,
    #[serde(default)]
    pub browser_restart: bool,
    #[serde(default = "default_true")]
    pub notifications: bool,
    #[serde(default = "default_browsers")]
    pub browsers: Vec<String>,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            dns_flush: true,
            firewall: false,
            browser_cache: true,
            browser_restart: false,
            notifications: true,
            browsers: default_browsers(),
        }
    }
}

fn default_browsers() -> Vec<String> {
    DEFAULT_BROWSERS.iter().map(|b| b.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockCategory {
    #[serde(default)]
    pub domains: Vec<String>,
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, scale) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else {
            return Err(format!(
                "unknown duration format: '{s}' (use '500ms', '2s' or '1m')"
            ));
        };
        let value = value.trim().parse::<u64>().map_err(|e| e.to_string())?;
        value
            .checked_mul(scale)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }
}

/// Expand a leading `~/` against the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs_next::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("focus-guard")
}

impl FocusConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| FocusError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&src)
            .map_err(|e| FocusError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate HCL source
    pub fn parse(src: &str) -> Result<Self> {
        let cfg: FocusConfig =
            hcl::from_str(src).map_err(|e| FocusError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.redirect_ip()?;
        self.policy()?;
        self.default_window()?;

        let difficulty = self.focus.default_difficulty;
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
            return Err(FocusError::Config(format!(
                "focus.default_difficulty must be between {MIN_DIFFICULTY} and {MAX_DIFFICULTY}, got {difficulty}"
            )));
        }
        if self.focus.max_attempts == 0 {
            return Err(FocusError::Config("focus.max_attempts must be at least 1".into()));
        }
        if self.guard.tick_interval.is_zero() {
            return Err(FocusError::Config("guard.tick_interval must be positive".into()));
        }
        if self.guard.marker.trim().is_empty() {
            return Err(FocusError::Config("guard.marker must not be empty".into()));
        }
        Ok(())
    }

    pub fn redirect_ip(&self) -> Result<IpAddr> {
        self.guard.redirect_ip.parse().map_err(|e| {
            FocusError::Config(format!(
                "guard.redirect_ip '{}' is not an IP address: {e}",
                self.guard.redirect_ip
            ))
        })
    }

    /// Every category's domains, de-duplicated, in declaration order
    pub fn policy(&self) -> Result<BlockPolicy> {
        let domains = self
            .block
            .values()
            .flat_map(|category| category.domains.iter());
        BlockPolicy::with_marker(self.redirect_ip()?, domains, &self.guard.marker)
    }

    pub fn default_window(&self) -> Result<TimeWindow> {
        TimeWindow::parse(&self.focus.default_start, &self.focus.default_end)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            dns_flush_enabled: self.layers.dns_flush,
            firewall_layer_enabled: self.layers.firewall,
            browser_cache_enabled: self.layers.browser_cache,
            browser_restart_enabled: self.layers.browser_restart,
            notifications_enabled: self.layers.notifications,
            ipc_enabled: self.guard.ipc,
            tick_interval: self.guard.tick_interval,
            debounce: self.guard.debounce,
            max_attempts: self.focus.max_attempts,
            lock_resource: self.guard.lock_hosts,
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.guard
            .state_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| data_dir().join("state.json"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.guard
            .lock_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| data_dir().join("focus-guard.lock"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.guard
            .socket
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| std::env::temp_dir().join("focus-guard.sock"))
    }
}

/// Written by `focus-guard init`
pub const INIT_TEMPLATE: &str = r#"# focusguard.hcl, generated by `focus-guard init`
# Run `focus-guard validate` to check it, `sudo focus-guard run` to start the engine.

guard {
  hosts_file    = "/etc/hosts"
  redirect_ip   = "127.0.0.1"
  # state_file  = "~/.focus-guard/state.json"
  # lock_file   = "~/.focus-guard/focus-guard.lock"
  # socket      = "/tmp/focus-guard.sock"
  marker        = "FocusGuard"
  log_level     = "info"
  tick_interval = "60s"
  debounce      = "1s"
  lock_hosts    = true
}

focus {
  default_start      = "09:00"
  default_end        = "18:00"
  default_difficulty = 1
  max_attempts       = 3
}

layers {
  dns_flush       = true
  firewall        = false
  browser_cache   = true
  browser_restart = false
  notifications   = true
  browsers        = ["Google Chrome", "Safari", "Firefox", "Whale", "Microsoft Edge"]
}

block "video" {
  domains = ["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"]
}

block "social" {
  domains = ["instagram.com", "www.instagram.com", "facebook.com", "www.facebook.com", "x.com", "twitter.com"]
}
"#;
