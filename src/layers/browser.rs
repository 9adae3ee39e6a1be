//! Browser layers: cache invalidation and forced restart
//!
//! Browsers keep their own DNS and HTTP caches, so a freshly edited hosts
//! file does not reach a tab that is already open. Only browsers that are
//! currently running are touched.

use super::command::{applescript_quote, CommandRunner, Platform};
use super::{AuxiliaryLayer, LayerAction, LayerContext, LayerStage};
use crate::error::{FocusError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Browsers watched by default
pub const DEFAULT_BROWSERS: &[&str] = &[
    "Google Chrome",
    "Safari",
    "Firefox",
    "Whale",
    "Microsoft Edge",
];

/// A cache location relative to the user's home directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDir {
    /// Empty this directory
    Contents(PathBuf),
    /// Empty `<root>/<profile>/cache2` for every profile under root
    ProfileCache2(PathBuf),
}

/// How to find, clear, and relaunch one browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSpec {
    pub name: String,
    /// `pgrep -f` / `pkill -f` pattern
    pub process_pattern: String,
    pub caches: Vec<CacheDir>,
    /// Relaunch command; `None` means the browser is not restarted
    pub launch: Option<Vec<String>>,
}

impl BrowserSpec {
    /// Resolve a browser by display name for the given platform
    ///
    /// Unknown names still get process detection by name, with no cache
    /// paths.
    pub fn resolve(name: &str, platform: Platform) -> Self {
        let contents = |p: &str| CacheDir::Contents(PathBuf::from(p));
        let (pattern, caches, linux_bin): (&str, Vec<CacheDir>, Option<&str>) =
            match (name, platform) {
                ("Google Chrome", Platform::MacOs) => (
                    "Google Chrome",
                    vec![
                        contents("Library/Caches/Google/Chrome/Default/Cache"),
                        contents("Library/Application Support/Google/Chrome/Default/Cache"),
                        contents("Library/Application Support/Google/Chrome/Default/Code Cache"),
                        contents("Library/Application Support/Google/Chrome/Default/GPUCache"),
                    ],
                    None,
                ),
                ("Google Chrome", _) => (
                    "chrome",
                    vec![
                        contents(".cache/google-chrome/Default/Cache"),
                        contents(".cache/google-chrome/Default/Code Cache"),
                    ],
                    Some("google-chrome"),
                ),
                ("Safari", Platform::MacOs) => (
                    "Safari.app/Contents/MacOS/Safari",
                    vec![
                        contents("Library/Caches/com.apple.Safari"),
                        contents("Library/Safari/LocalStorage"),
                    ],
                    None,
                ),
                ("Firefox", Platform::MacOs) => (
                    "Firefox",
                    vec![
                        CacheDir::ProfileCache2("Library/Caches/Firefox/Profiles".into()),
                        CacheDir::ProfileCache2(
                            "Library/Application Support/Firefox/Profiles".into(),
                        ),
                    ],
                    None,
                ),
                ("Firefox", _) => (
                    "firefox",
                    vec![CacheDir::ProfileCache2(".cache/mozilla/firefox".into())],
                    Some("firefox"),
                ),
                ("Whale", Platform::MacOs) => (
                    "Whale",
                    vec![
                        contents("Library/Caches/com.naver.whale"),
                        contents("Library/Application Support/Naver/Whale/Default/Cache"),
                    ],
                    None,
                ),
                ("Whale", _) => (
                    "whale",
                    vec![contents(".cache/naver-whale/Default/Cache")],
                    Some("naver-whale"),
                ),
                ("Microsoft Edge", Platform::MacOs) => (
                    "Microsoft Edge",
                    vec![
                        contents("Library/Caches/com.microsoft.edgemac"),
                        contents("Library/Application Support/Microsoft Edge/Default/Cache"),
                    ],
                    None,
                ),
                ("Microsoft Edge", _) => (
                    "msedge",
                    vec![contents(".cache/microsoft-edge/Default/Cache")],
                    Some("microsoft-edge"),
                ),
                (other, _) => (other, Vec::new(), None),
            };

        let launch = match platform {
            Platform::MacOs => Some(vec!["open".into(), "-a".into(), name.to_string()]),
            Platform::Linux => linux_bin.map(|bin| vec![bin.to_string()]),
            Platform::Other => None,
        };

        Self {
            name: name.to_string(),
            process_pattern: pattern.to_string(),
            caches,
            launch,
        }
    }

    /// Resolve a list of display names
    pub fn resolve_all(names: &[String], platform: Platform) -> Vec<Self> {
        names.iter().map(|n| Self::resolve(n, platform)).collect()
    }
}

async fn is_running(runner: &dyn CommandRunner, spec: &BrowserSpec) -> bool {
    runner
        .run("pgrep", &["-f", &spec.process_pattern])
        .await
        .map(|out| out.success)
        .unwrap_or(false)
}

async fn running<'a>(runner: &dyn CommandRunner, specs: &'a [BrowserSpec]) -> Vec<&'a BrowserSpec> {
    let mut found = Vec::new();
    for spec in specs {
        if is_running(runner, spec).await {
            found.push(spec);
        }
    }
    found
}

fn clear_dir_contents(dir: &Path) -> std::io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

fn clear_cache(home: &Path, cache: &CacheDir) -> std::io::Result<usize> {
    match cache {
        CacheDir::Contents(rel) => clear_dir_contents(&home.join(rel)),
        CacheDir::ProfileCache2(rel) => {
            let root = home.join(rel);
            if !root.is_dir() {
                return Ok(0);
            }
            let mut removed = 0;
            for profile in std::fs::read_dir(&root)? {
                removed += clear_dir_contents(&profile?.path().join("cache2"))?;
            }
            Ok(removed)
        }
    }
}

/// Empties the on-disk caches of running browsers
pub struct BrowserCacheLayer {
    runner: Arc<dyn CommandRunner>,
    specs: Vec<BrowserSpec>,
    home: PathBuf,
}

impl BrowserCacheLayer {
    pub fn new(runner: Arc<dyn CommandRunner>, specs: Vec<BrowserSpec>, home: PathBuf) -> Self {
        Self {
            runner,
            specs,
            home,
        }
    }
}

#[async_trait]
impl AuxiliaryLayer for BrowserCacheLayer {
    fn name(&self) -> &str {
        "browser-cache"
    }

    fn stage(&self) -> LayerStage {
        LayerStage::ClientCache
    }

    async fn apply(&self, _ctx: &LayerContext<'_>) -> Result<()> {
        let mut failures = Vec::new();
        for spec in running(self.runner.as_ref(), &self.specs).await {
            let mut cleared = 0;
            for cache in &spec.caches {
                match clear_cache(&self.home, cache) {
                    Ok(n) => cleared += n,
                    Err(e) => failures.push(format!("{}: {e}", spec.name)),
                }
            }
            tracing::debug!(browser = %spec.name, entries = cleared, "Browser cache cleared");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FocusError::AuxiliaryLayer {
                layer: self.name().to_string(),
                reason: failures.join("; "),
            })
        }
    }
}

/// Quits and relaunches running browsers so they drop stale resolutions
pub struct BrowserRestartLayer {
    runner: Arc<dyn CommandRunner>,
    specs: Vec<BrowserSpec>,
    platform: Platform,
    grace: Duration,
}

impl BrowserRestartLayer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        specs: Vec<BrowserSpec>,
        platform: Platform,
        grace: Duration,
    ) -> Self {
        Self {
            runner,
            specs,
            platform,
            grace,
        }
    }

    async fn restart(&self, spec: &BrowserSpec) -> Result<()> {
        match self.platform {
            Platform::MacOs => {
                let script = format!("quit app {}", applescript_quote(&spec.name));
                self.runner.run("osascript", &["-e", &script]).await?;
            }
            _ => {
                self.runner
                    .run("pkill", &["-TERM", "-f", &spec.process_pattern])
                    .await?;
            }
        }
        tokio::time::sleep(self.grace).await;

        if is_running(self.runner.as_ref(), spec).await {
            tracing::debug!(browser = %spec.name, "Browser ignored quit, killing");
            self.runner
                .run("pkill", &["-KILL", "-f", &spec.process_pattern])
                .await?;
        }

        if let Some((program, rest)) = spec.launch.as_deref().and_then(<[String]>::split_first) {
            let args: Vec<&str> = rest.iter().map(String::as_str).collect();
            match self.platform {
                // `open` returns as soon as the app is launched
                Platform::MacOs => {
                    self.runner
                        .run(program, &args)
                        .await?
                        .check(self.name(), program)?;
                }
                _ => self.runner.spawn(program, &args).await?,
            }
        }
        tracing::info!(browser = %spec.name, "Browser restarted");
        Ok(())
    }
}

#[async_trait]
impl AuxiliaryLayer for BrowserRestartLayer {
    fn name(&self) -> &str {
        "browser-restart"
    }

    fn stage(&self) -> LayerStage {
        LayerStage::ClientRestart
    }

    async fn apply(&self, ctx: &LayerContext<'_>) -> Result<()> {
        // Lifting leaves nothing stale worth a restart
        if ctx.action == LayerAction::Lift {
            return Ok(());
        }

        let mut failures = Vec::new();
        for spec in running(self.runner.as_ref(), &self.specs).await {
            if let Err(e) = self.restart(spec).await {
                failures.push(format!("{}: {e}", spec.name));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FocusError::AuxiliaryLayer {
                layer: self.name().to_string(),
                reason: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::command::testing::RecordingRunner;
    use crate::policy::BlockPolicy;

    fn policy() -> BlockPolicy {
        BlockPolicy::new("127.0.0.1".parse().unwrap(), ["youtube.com"]).unwrap()
    }

    fn enforce(policy: &BlockPolicy) -> LayerContext<'_> {
        LayerContext {
            policy,
            action: LayerAction::Enforce,
            escalated: false,
        }
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let safari = BrowserSpec::resolve("Safari", Platform::MacOs);
        assert_eq!(safari.process_pattern, "Safari.app/Contents/MacOS/Safari");
        assert_eq!(
            safari.launch,
            Some(vec!["open".to_string(), "-a".into(), "Safari".into()])
        );

        let firefox = BrowserSpec::resolve("Firefox", Platform::Linux);
        assert_eq!(firefox.launch, Some(vec!["firefox".to_string()]));

        let custom = BrowserSpec::resolve("Vivaldi", Platform::Linux);
        assert_eq!(custom.process_pattern, "Vivaldi");
        assert!(custom.caches.is_empty());
        assert!(custom.launch.is_none());
    }

    #[tokio::test]
    async fn test_cache_layer_only_touches_running_browsers() {
        let home = tempfile::TempDir::new().unwrap();
        let chrome_cache = home.path().join(".cache/google-chrome/Default/Cache");
        std::fs::create_dir_all(chrome_cache.join("sub")).unwrap();
        std::fs::write(chrome_cache.join("entry"), "x").unwrap();
        let ff_cache = home.path().join(".cache/mozilla/firefox/abc.default/cache2");
        std::fs::create_dir_all(&ff_cache).unwrap();
        std::fs::write(ff_cache.join("entry"), "x").unwrap();

        let runner = Arc::new(RecordingRunner::default());
        // Firefox is not running
        runner.fail("pgrep -f firefox", 1);
        let specs = BrowserSpec::resolve_all(
            &["Google Chrome".to_string(), "Firefox".to_string()],
            Platform::Linux,
        );
        let layer = BrowserCacheLayer::new(runner.clone(), specs, home.path().to_path_buf());

        layer.apply(&enforce(&policy())).await.unwrap();

        assert!(chrome_cache.is_dir());
        assert_eq!(std::fs::read_dir(&chrome_cache).unwrap().count(), 0);
        assert!(ff_cache.join("entry").exists());
    }

    #[tokio::test]
    async fn test_profile_cache2_cleared() {
        let home = tempfile::TempDir::new().unwrap();
        let cache2 = home.path().join(".cache/mozilla/firefox/p1.default/cache2");
        std::fs::create_dir_all(cache2.join("entries")).unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let specs = BrowserSpec::resolve_all(&["Firefox".to_string()], Platform::Linux);
        let layer = BrowserCacheLayer::new(runner, specs, home.path().to_path_buf());
        layer.apply(&enforce(&policy())).await.unwrap();

        assert_eq!(std::fs::read_dir(&cache2).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restart_macos_sequence() {
        let runner = Arc::new(RecordingRunner::default());
        let specs = BrowserSpec::resolve_all(&["Safari".to_string()], Platform::MacOs);
        let layer =
            BrowserRestartLayer::new(runner.clone(), specs, Platform::MacOs, Duration::ZERO);

        layer.apply(&enforce(&policy())).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "pgrep -f Safari.app/Contents/MacOS/Safari",
                "osascript -e quit app \"Safari\"",
                "pgrep -f Safari.app/Contents/MacOS/Safari",
                "pkill -KILL -f Safari.app/Contents/MacOS/Safari",
                "open -a Safari",
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_linux_spawns_and_skips_lift() {
        let runner = Arc::new(RecordingRunner::default());
        let specs = BrowserSpec::resolve_all(&["Firefox".to_string()], Platform::Linux);
        let layer =
            BrowserRestartLayer::new(runner.clone(), specs, Platform::Linux, Duration::ZERO);
        let policy = policy();

        layer
            .apply(&LayerContext {
                policy: &policy,
                action: LayerAction::Lift,
                escalated: false,
            })
            .await
            .unwrap();
        assert!(runner.calls().is_empty());

        layer.apply(&enforce(&policy)).await.unwrap();
        assert!(runner.calls().contains(&"pkill -TERM -f firefox".to_string()));
        assert_eq!(runner.spawned(), vec!["firefox"]);
    }

    #[tokio::test]
    async fn test_no_running_browsers_is_noop() {
        let runner = Arc::new(RecordingRunner::default());
        runner.fail("pgrep -f chrome", 1);
        let specs = BrowserSpec::resolve_all(&["Google Chrome".to_string()], Platform::Linux);
        let layer =
            BrowserRestartLayer::new(runner.clone(), specs, Platform::Linux, Duration::ZERO);

        layer.apply(&enforce(&policy())).await.unwrap();
        assert_eq!(runner.calls(), vec!["pgrep -f chrome"]);
        assert!(runner.spawned().is_empty());
    }
}
