//! Block policy: the immutable description of what gets blocked
//!
//! A policy is pure data: the redirect target, the ordered set of
//! hostnames, and the two sentinel lines that delimit the managed region
//! inside the shared resource.

use crate::error::{FocusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// Default product label used to build marker lines
pub const DEFAULT_MARKER: &str = "FocusGuard";

/// Immutable blocking policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPolicy {
    redirect_target: IpAddr,
    entries: Vec<String>,
    marker_begin: String,
    marker_end: String,
}

impl BlockPolicy {
    /// Build a policy from a redirect target and hostnames.
    ///
    /// Hostnames are lower-cased and de-duplicated keeping first occurrence.
    /// Fails if the resulting set is empty or a hostname is malformed.
    pub fn new(
        redirect_target: IpAddr,
        entries: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Self> {
        Self::with_marker(redirect_target, entries, DEFAULT_MARKER)
    }

    /// Build a policy whose markers carry a custom product label
    pub fn with_marker(
        redirect_target: IpAddr,
        entries: impl IntoIterator<Item = impl AsRef<str>>,
        label: &str,
    ) -> Result<Self> {
        let label = label.trim();
        if label.is_empty() || label.contains('\n') {
            return Err(FocusError::InvalidPolicy(
                "marker label must be a non-empty single line".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::new();
        for entry in entries {
            let host = entry.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
            if host.is_empty() {
                continue;
            }
            if !is_valid_hostname(&host) {
                return Err(FocusError::InvalidPolicy(format!(
                    "invalid hostname '{}'",
                    entry.as_ref()
                )));
            }
            if seen.insert(host.clone()) {
                normalized.push(host);
            }
        }

        if normalized.is_empty() {
            return Err(FocusError::InvalidPolicy(
                "policy must block at least one hostname".into(),
            ));
        }

        Ok(Self {
            redirect_target,
            entries: normalized,
            marker_begin: format!("# {label} Block Start"),
            marker_end: format!("# {label} Block End"),
        })
    }

    /// Address every blocked hostname resolves to
    pub fn redirect_target(&self) -> IpAddr {
        self.redirect_target
    }

    /// Blocked hostnames in declaration order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Sentinel line opening the managed region
    pub fn marker_begin(&self) -> &str {
        &self.marker_begin
    }

    /// Sentinel line closing the managed region
    pub fn marker_end(&self) -> &str {
        &self.marker_end
    }

    /// Render the managed region, markers included, one line per element
    pub fn render_region(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.entries.len() + 2);
        lines.push(self.marker_begin.clone());
        lines.extend(
            self.entries
                .iter()
                .map(|host| format!("{} {}", self.redirect_target, host)),
        );
        lines.push(self.marker_end.clone());
        lines
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
