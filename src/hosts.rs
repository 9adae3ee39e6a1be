//! Managed-region mutation of the hosts file
//!
//! The engine owns exactly one marker-delimited block of lines inside a
//! shared name-resolution file. Everything outside that block belongs to
//! the operator and is never rewritten, reordered, or re-terminated.

use crate::error::{FocusError, Result};
use crate::policy::BlockPolicy;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result of a mutation that may have been unnecessary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The managed region was written
    Applied,
    /// The managed region was deleted
    Removed,
    /// The resource already had the requested shape; nothing was written
    NoOp,
}

/// Idempotent insert/remove of the managed region in a shared resource
pub trait ResourceMutator: Send + Sync {
    /// Ensure the resource contains exactly the policy's managed region
    fn apply(&self, policy: &BlockPolicy) -> Result<MutationOutcome>;

    /// Delete every managed region delimited by the policy's markers
    fn remove(&self, policy: &BlockPolicy) -> Result<MutationOutcome>;

    /// Whether the resource currently holds exactly the policy's region
    fn region_matches(&self, policy: &BlockPolicy) -> Result<bool>;

    /// Location of the resource
    fn path(&self) -> &Path;
}

/// Line view of a text file that round-trips byte-for-byte
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lines {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Lines {
    fn parse(content: &str) -> Self {
        if content.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: false,
            };
        }
        let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
        let trailing_newline = content.ends_with('\n');
        if trailing_newline {
            lines.pop();
        }
        Self {
            lines,
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    /// Complete regions as inclusive `(begin, end)` line indices.
    ///
    /// A begin marker with no later end marker is not a region. When begin
    /// markers repeat before an end, the last one opens the region.
    fn regions(&self, policy: &BlockPolicy) -> Vec<(usize, usize)> {
        let mut found = Vec::new();
        let mut open = None;
        for (idx, line) in self.lines.iter().enumerate() {
            let line = line.trim_end_matches('\r');
            if line == policy.marker_begin() {
                open = Some(idx);
            } else if line == policy.marker_end() {
                if let Some(begin) = open.take() {
                    found.push((begin, idx));
                }
            }
        }
        found
    }

    fn region_is(&self, range: (usize, usize), expected: &[String]) -> bool {
        let (begin, end) = range;
        end - begin + 1 == expected.len()
            && self.lines[begin..=end]
                .iter()
                .zip(expected)
                .all(|(have, want)| have.trim_end_matches('\r') == want)
    }
}

/// Apply the policy to in-memory content, returning the new content if it changed
pub fn apply_to_content(content: &str, policy: &BlockPolicy) -> Option<String> {
    let mut doc = Lines::parse(content);
    let regions = doc.regions(policy);
    let rendered = policy.render_region();

    if regions.len() == 1 && doc.region_is(regions[0], &rendered) {
        return None;
    }

    match regions.first().copied() {
        Some((first_begin, first_end)) => {
            // Drop later duplicates back to front so indices stay valid
            for &(begin, end) in regions.iter().skip(1).rev() {
                doc.lines.drain(begin..=end);
            }
            doc.lines.splice(first_begin..=first_end, rendered);
        }
        None => {
            if doc.lines.is_empty() {
                doc.trailing_newline = true;
            }
            doc.lines.extend(rendered);
        }
    }
    Some(doc.render())
}

/// Remove every managed region from in-memory content, if any exists
pub fn remove_from_content(content: &str, policy: &BlockPolicy) -> Option<String> {
    let mut doc = Lines::parse(content);
    let regions = doc.regions(policy);
    if regions.is_empty() {
        return None;
    }
    for &(begin, end) in regions.iter().rev() {
        doc.lines.drain(begin..=end);
    }
    Some(doc.render())
}

/// Whether content holds exactly one region equal to the policy's rendering
pub fn content_matches(content: &str, policy: &BlockPolicy) -> bool {
    let doc = Lines::parse(content);
    let regions = doc.regions(policy);
    regions.len() == 1 && doc.region_is(regions[0], &policy.render_region())
}

/// Hosts-style name-resolution file
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    /// Manage the file at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            // First run on a machine without the file: start from empty
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(FocusError::resource(&self.path, e)),
        }
    }

    /// The file actually holding the content; symlinks are followed so the
    /// link itself is never replaced
    fn target(&self) -> PathBuf {
        std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone())
    }

    /// Write via temp file + fsync + rename so a kill mid-write never
    /// leaves a half-written resource behind.
    ///
    /// A target that cannot be renamed over (a bind mount) is truncated and
    /// rewritten in place instead.
    fn write_atomic(&self, content: &str) -> Result<()> {
        let target = self.target();
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hosts".into());
        let tmp_path = parent.join(format!(".{file_name}.focus-guard.tmp"));

        let permissions = std::fs::metadata(&target).ok().map(|m| m.permissions());

        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            if let Some(perms) = permissions {
                std::fs::set_permissions(&tmp_path, perms)?;
            }
            std::fs::rename(&tmp_path, &target)
        })();

        let result = match result {
            Err(e) if rename_unsupported(&e) => {
                tracing::debug!(path = %target.display(), error = %e, "Rename refused, rewriting in place");
                let _ = std::fs::remove_file(&tmp_path);
                write_in_place(&target, content)
            }
            other => other,
        };

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(FocusError::resource(&self.path, e));
        }

        tracing::debug!(path = %target.display(), bytes = content.len(), "Resource written");
        Ok(())
    }
}

/// Rename fails this way on mount points and across filesystems
#[cfg(unix)]
fn rename_unsupported(e: &std::io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EBUSY) | Some(Errno::EXDEV)
    )
}

#[cfg(not(unix))]
fn rename_unsupported(_e: &std::io::Error) -> bool {
    false
}

fn write_in_place(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

impl ResourceMutator for HostsFile {
    fn apply(&self, policy: &BlockPolicy) -> Result<MutationOutcome> {
        let content = self.read()?;
        match apply_to_content(&content, policy) {
            Some(updated) => {
                self.write_atomic(&updated)?;
                tracing::info!(
                    path = %self.path.display(),
                    entries = policy.entries().len(),
                    "Managed region applied"
                );
                Ok(MutationOutcome::Applied)
            }
            None => {
                tracing::debug!(path = %self.path.display(), "Managed region already present");
                Ok(MutationOutcome::NoOp)
            }
        }
    }

    fn remove(&self, policy: &BlockPolicy) -> Result<MutationOutcome> {
        let content = self.read()?;
        match remove_from_content(&content, policy) {
            Some(updated) => {
                self.write_atomic(&updated)?;
                tracing::info!(path = %self.path.display(), "Managed region removed");
                Ok(MutationOutcome::Removed)
            }
            None => {
                tracing::debug!(path = %self.path.display(), "No managed region to remove");
                Ok(MutationOutcome::NoOp)
            }
        }
    }

    fn region_matches(&self, policy: &BlockPolicy) -> Result<bool> {
        Ok(content_matches(&self.read()?, policy))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-only permission lock on the shared resource while enforcing
///
/// Captures the original mode the first time it locks and restores it on
/// unlock. Root can still write; the lock stops casual editors.
pub struct PermissionGuard {
    path: PathBuf,
    original_mode: Mutex<Option<u32>>,
}

const LOCKED_MODE: u32 = 0o444;
const FALLBACK_MODE: u32 = 0o644;

impl PermissionGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            original_mode: Mutex::new(None),
        }
    }

    /// Make the resource read-only
    #[cfg(unix)]
    pub fn lock(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let meta = std::fs::metadata(&self.path).map_err(|e| FocusError::resource(&self.path, e))?;
        let current = meta.permissions().mode() & 0o7777;
        {
            let mut original = self
                .original_mode
                .lock()
                .map_err(|e| FocusError::Lock(format!("permission guard poisoned: {e}")))?;
            if original.is_none() && current != LOCKED_MODE {
                *original = Some(current);
            }
        }
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(LOCKED_MODE))
            .map_err(|e| FocusError::resource(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), "Resource locked read-only");
        Ok(())
    }

    /// Restore the mode captured before locking
    #[cfg(unix)]
    pub fn unlock(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let current = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.permissions().mode() & 0o7777,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FocusError::resource(&self.path, e)),
        };
        let captured = *self
            .original_mode
            .lock()
            .map_err(|e| FocusError::Lock(format!("permission guard poisoned: {e}")))?;
        let mode = match captured {
            Some(mode) => mode,
            // Locked by an earlier run whose original mode is gone
            None if current == LOCKED_MODE => FALLBACK_MODE,
            None => return Ok(()),
        };
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| FocusError::resource(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), mode = format!("{mode:o}"), "Resource unlocked");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn lock(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn unlock(&self) -> Result<()> {
        Ok(())
    }
}
