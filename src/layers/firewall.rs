//! Packet-filter layer (`pfctl`)
//!
//! Renders outbound drop rules for every blocked hostname on ports 80 and
//! 443, loads them, and enables the filter. Lifting disables the filter.
//! pf resolves hostnames when the ruleset loads, so this layer catches
//! clients that bypass the hosts file with their own resolver.

use super::command::{CommandRunner, Platform};
use super::{AuxiliaryLayer, LayerAction, LayerContext, LayerStage};
use crate::error::{FocusError, Result};
use crate::policy::BlockPolicy;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

const BLOCKED_PORTS: [u16; 2] = [80, 443];

pub struct PacketFilterLayer {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
    rules_path: PathBuf,
}

impl PacketFilterLayer {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform, rules_path: PathBuf) -> Self {
        Self {
            runner,
            platform,
            rules_path,
        }
    }

    /// Render the ruleset for a policy
    pub fn render_rules(policy: &BlockPolicy) -> String {
        let mut rules = String::new();
        for host in policy.entries() {
            for port in BLOCKED_PORTS {
                rules.push_str(&format!("block drop out proto tcp to {host} port {port}\n"));
            }
        }
        rules
    }

    /// Run pfctl; a failure whose stderr contains `tolerate` counts as success
    async fn pfctl(&self, args: &[&str], tolerate: Option<&str>) -> Result<()> {
        let out = self.runner.run("pfctl", args).await?;
        if !out.success && tolerate.is_some_and(|t| out.stderr.contains(t)) {
            return Ok(());
        }
        out.check(self.name(), "pfctl").map(|_| ())
    }
}

#[async_trait]
impl AuxiliaryLayer for PacketFilterLayer {
    fn name(&self) -> &str {
        "packet-filter"
    }

    fn stage(&self) -> LayerStage {
        LayerStage::PacketFilter
    }

    async fn apply(&self, ctx: &LayerContext<'_>) -> Result<()> {
        if self.platform != Platform::MacOs {
            return Err(FocusError::AuxiliaryLayer {
                layer: self.name().to_string(),
                reason: "pfctl is only available on macOS".into(),
            });
        }

        match ctx.action {
            LayerAction::Enforce => {
                tokio::fs::write(&self.rules_path, Self::render_rules(ctx.policy))
                    .await
                    .map_err(|e| FocusError::AuxiliaryLayer {
                        layer: self.name().to_string(),
                        reason: format!("cannot write {}: {e}", self.rules_path.display()),
                    })?;
                let rules = self.rules_path.to_string_lossy().into_owned();
                self.pfctl(&["-f", &rules], None).await?;
                self.pfctl(&["-e"], Some("already enabled")).await?;
                tracing::info!(
                    rules = ctx.policy.entries().len() * BLOCKED_PORTS.len(),
                    "Packet filter rules loaded"
                );
            }
            LayerAction::Lift => {
                self.pfctl(&["-d"], Some("not enabled")).await?;
                let _ = tokio::fs::remove_file(&self.rules_path).await;
                tracing::info!("Packet filter disabled");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::command::testing::RecordingRunner;

    fn policy() -> BlockPolicy {
        BlockPolicy::new("127.0.0.1".parse().unwrap(), ["youtube.com", "youtu.be"]).unwrap()
    }

    #[test]
    fn test_render_rules() {
        let rules = PacketFilterLayer::render_rules(&policy());
        assert_eq!(rules.lines().count(), 4);
        assert!(rules.contains("block drop out proto tcp to youtube.com port 443\n"));
        assert!(rules.contains("block drop out proto tcp to youtu.be port 80\n"));
    }

    #[tokio::test]
    async fn test_enforce_loads_and_enables() {
        let dir = tempfile::TempDir::new().unwrap();
        let rules_path = dir.path().join("pf.conf");
        let runner = Arc::new(RecordingRunner::default());
        let layer = PacketFilterLayer::new(runner.clone(), Platform::MacOs, rules_path.clone());
        let policy = policy();

        layer
            .apply(&LayerContext {
                policy: &policy,
                action: LayerAction::Enforce,
                escalated: false,
            })
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], format!("pfctl -f {}", rules_path.display()));
        assert_eq!(calls[1], "pfctl -e");
        assert!(std::fs::read_to_string(&rules_path)
            .unwrap()
            .contains("youtu.be"));

        layer
            .apply(&LayerContext {
                policy: &policy,
                action: LayerAction::Lift,
                escalated: false,
            })
            .await
            .unwrap();
        assert_eq!(runner.calls().last().unwrap(), "pfctl -d");
        assert!(!rules_path.exists());
    }

    #[tokio::test]
    async fn test_unsupported_platform_reports() {
        let runner = Arc::new(RecordingRunner::default());
        let layer = PacketFilterLayer::new(runner.clone(), Platform::Linux, "/tmp/x".into());
        let policy = policy();
        let err = layer
            .apply(&LayerContext {
                policy: &policy,
                action: LayerAction::Enforce,
                escalated: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FocusError::AuxiliaryLayer { .. }));
        assert!(runner.calls().is_empty());
    }
}
