//! Auxiliary enforcement layers
//!
//! Each layer is one best-effort action run after the hosts file has been
//! mutated: resolver flush, packet filter, browser cache wipe, browser
//! restart. A failing layer is reported, never fatal, and never stops the
//! layers after it.

use crate::error::Result;
use crate::policy::BlockPolicy;
use async_trait::async_trait;

pub mod browser;
pub mod command;
pub mod firewall;
pub mod resolver;

pub use browser::{BrowserCacheLayer, BrowserRestartLayer, BrowserSpec};
pub use command::{CommandOutput, CommandRunner, Platform, SystemRunner};
pub use firewall::PacketFilterLayer;
pub use resolver::ResolverFlushLayer;

/// Which direction the pipeline is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAction {
    Enforce,
    Lift,
}

/// Fixed position of a layer in the pipeline; lower runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerStage {
    /// Drop cached name resolutions so the edited resource takes effect
    ResolverFlush = 2,
    /// Connection-level blocking in the host packet filter
    PacketFilter = 3,
    /// Client-side (browser) cache invalidation
    ClientCache = 4,
    /// Restart clients holding stale cached entries
    ClientRestart = 5,
}

impl LayerStage {
    /// Stages forced on by the tamper-remediation escalation
    pub fn forced_on_escalation(self) -> bool {
        matches!(self, LayerStage::ClientRestart)
    }
}

/// Inputs every layer sees
#[derive(Debug, Clone, Copy)]
pub struct LayerContext<'a> {
    pub policy: &'a BlockPolicy,
    pub action: LayerAction,
    /// Set during tamper remediation
    pub escalated: bool,
}

/// One best-effort enforcement or remediation action
#[async_trait]
pub trait AuxiliaryLayer: Send + Sync {
    /// Short stable name used in reports and logs
    fn name(&self) -> &str;

    /// Pipeline position
    fn stage(&self) -> LayerStage;

    /// Run the layer for the given direction
    async fn apply(&self, ctx: &LayerContext<'_>) -> Result<()>;
}
