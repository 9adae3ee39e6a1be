use super::command::{CommandRunner, Platform};
use super::{AuxiliaryLayer, LayerContext, LayerStage};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Flushes the system resolver cache in both directions
pub struct ResolverFlushLayer {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
}

impl ResolverFlushLayer {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        Self { runner, platform }
    }

    fn commands(&self) -> &'static [(&'static str, &'static [&'static str])] {
        match self.platform {
            Platform::MacOs => &[
                ("dscacheutil", &["-flushcache"]),
                ("killall", &["-HUP", "mDNSResponder"]),
            ],
            Platform::Linux => &[("resolvectl", &["flush-caches"])],
            Platform::Other => &[],
        }
    }
}

#[async_trait]
impl AuxiliaryLayer for ResolverFlushLayer {
    fn name(&self) -> &str {
        "resolver-flush"
    }

    fn stage(&self) -> LayerStage {
        LayerStage::ResolverFlush
    }

    async fn apply(&self, _ctx: &LayerContext<'_>) -> Result<()> {
        for (program, args) in self.commands() {
            self.runner
                .run(program, args)
                .await?
                .check(self.name(), program)?;
        }
        tracing::debug!(platform = ?self.platform, "Resolver cache flushed");
        Ok(())
    }
}
