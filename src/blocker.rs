//! Layered blocking pipeline
//!
//! The resource mutation always runs first, then every auxiliary layer in
//! stage order. One enforcement mutex serializes every operation that
//! touches the shared resource; callers that also need to update state
//! atomically with the resource take the mutex through [`LayeredBlocker::exclusive`]
//! and keep it until their bookkeeping is done.

use crate::error::{FocusError, Result};
use crate::hosts::{MutationOutcome, PermissionGuard, ResourceMutator};
use crate::layers::{AuxiliaryLayer, LayerAction, LayerContext, LayerStage};
use crate::policy::BlockPolicy;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Outcome of one auxiliary layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    Succeeded,
    /// Disabled by configuration
    Skipped,
    Failed(String),
}

/// One row of a [`LayerReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOutcome {
    pub layer: String,
    pub stage: LayerStage,
    pub status: LayerStatus,
}

/// Per-layer result of one enforce or lift
///
/// A failed resource mutation is the only failure that means the
/// operation did not take effect; auxiliary failures are partial success.
#[derive(Debug)]
pub struct LayerReport {
    pub action: LayerAction,
    pub resource: Result<MutationOutcome>,
    pub layers: Vec<LayerOutcome>,
}

impl LayerReport {
    /// Whether the shared resource now has the requested shape
    pub fn resource_ok(&self) -> bool {
        self.resource.is_ok()
    }

    /// Auxiliary layers that failed
    pub fn failed_layers(&self) -> impl Iterator<Item = &LayerOutcome> {
        self.layers
            .iter()
            .filter(|o| matches!(o.status, LayerStatus::Failed(_)))
    }

    /// Every layer, resource included, succeeded or was skipped
    pub fn is_clean(&self) -> bool {
        self.resource_ok() && self.failed_layers().next().is_none()
    }

    /// Surface a resource failure as an error, keeping the report otherwise
    pub fn into_result(self) -> Result<Self> {
        match self.resource {
            Err(e) => Err(e),
            Ok(outcome) => Ok(Self {
                resource: Ok(outcome),
                ..self
            }),
        }
    }
}

struct RegisteredLayer {
    layer: Arc<dyn AuxiliaryLayer>,
    enabled: bool,
}

/// Resource mutator plus ordered best-effort auxiliary layers
pub struct LayeredBlocker {
    mutator: Arc<dyn ResourceMutator>,
    permissions: Option<PermissionGuard>,
    layers: Vec<RegisteredLayer>,
    op_lock: Mutex<()>,
}

impl LayeredBlocker {
    pub fn new(mutator: Arc<dyn ResourceMutator>) -> Self {
        Self {
            mutator,
            permissions: None,
            layers: Vec::new(),
            op_lock: Mutex::new(()),
        }
    }

    /// Make the resource read-only while enforcing
    pub fn with_permission_guard(mut self, guard: PermissionGuard) -> Self {
        self.permissions = Some(guard);
        self
    }

    /// Register a layer; disabled layers only run when forced by escalation
    pub fn with_layer(mut self, layer: Arc<dyn AuxiliaryLayer>, enabled: bool) -> Self {
        self.layers.push(RegisteredLayer { layer, enabled });
        // Stable: layers sharing a stage keep registration order
        self.layers.sort_by_key(|l| l.layer.stage());
        self
    }

    /// Path of the shared resource
    pub fn resource_path(&self) -> &Path {
        self.mutator.path()
    }

    /// Names of registered layers in run order
    pub fn layer_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .map(|l| l.layer.name().to_string())
            .collect()
    }

    /// Take the enforcement mutex
    pub async fn exclusive(&self) -> Enforcement<'_> {
        Enforcement {
            blocker: self,
            _guard: self.op_lock.lock().await,
        }
    }

    /// Apply the policy under the enforcement mutex
    pub async fn enforce(&self, policy: &BlockPolicy) -> LayerReport {
        self.exclusive().await.enforce(policy).await
    }

    /// Remove the policy under the enforcement mutex
    pub async fn lift(&self, policy: &BlockPolicy) -> LayerReport {
        self.exclusive().await.lift(policy).await
    }

    /// Lift then enforce with escalation, under the enforcement mutex
    pub async fn reapply(&self, policy: &BlockPolicy) -> LayerReport {
        self.exclusive().await.reapply(policy).await
    }

    async fn run_layers(&self, policy: &BlockPolicy, action: LayerAction, escalated: bool) -> Vec<LayerOutcome> {
        let ctx = LayerContext {
            policy,
            action,
            escalated,
        };
        let mut outcomes = Vec::with_capacity(self.layers.len());
        for registered in &self.layers {
            let layer = &registered.layer;
            let stage = layer.stage();
            let forced = escalated && stage.forced_on_escalation();
            if !registered.enabled && !forced {
                outcomes.push(LayerOutcome {
                    layer: layer.name().to_string(),
                    stage,
                    status: LayerStatus::Skipped,
                });
                continue;
            }

            let status = match layer.apply(&ctx).await {
                Ok(()) => {
                    tracing::debug!(layer = layer.name(), ?action, "Layer applied");
                    LayerStatus::Succeeded
                }
                Err(e) => {
                    tracing::warn!(layer = layer.name(), ?action, error = %e, "Layer failed");
                    LayerStatus::Failed(e.to_string())
                }
            };
            outcomes.push(LayerOutcome {
                layer: layer.name().to_string(),
                stage,
                status,
            });
        }
        outcomes
    }

    fn relock(&self) {
        if let Some(guard) = &self.permissions {
            if let Err(e) = guard.lock() {
                tracing::warn!(error = %e, "Failed to make resource read-only");
            }
        }
    }

    fn unlock(&self) {
        if let Some(guard) = &self.permissions {
            if let Err(e) = guard.unlock() {
                tracing::warn!(error = %e, "Failed to restore resource permissions");
            }
        }
    }
}

/// Exclusive access to the shared resource; dropping it releases the mutex
pub struct Enforcement<'a> {
    blocker: &'a LayeredBlocker,
    _guard: MutexGuard<'a, ()>,
}

impl Enforcement<'_> {
    /// Apply the policy and run every layer
    pub async fn enforce(&self, policy: &BlockPolicy) -> LayerReport {
        self.enforce_inner(policy, false).await
    }

    /// Remove the policy and run every layer
    pub async fn lift(&self, policy: &BlockPolicy) -> LayerReport {
        self.lift_inner(policy, false).await
    }

    /// Lift then enforce, forcing the escalation layers on
    ///
    /// Returns the enforce half; lift failures are logged.
    pub async fn reapply(&self, policy: &BlockPolicy) -> LayerReport {
        let lifted = self.lift_inner(policy, true).await;
        if let Err(e) = &lifted.resource {
            tracing::error!(error = %e, "Lift during reapply failed");
        }
        self.enforce_inner(policy, true).await
    }

    /// Whether the resource holds exactly the policy's region
    pub fn region_matches(&self, policy: &BlockPolicy) -> Result<bool> {
        self.blocker.mutator.region_matches(policy)
    }

    async fn enforce_inner(&self, policy: &BlockPolicy, escalated: bool) -> LayerReport {
        let blocker = self.blocker;
        let resource = blocker.mutator.apply(policy);
        match &resource {
            Ok(outcome) => {
                blocker.relock();
                tracing::info!(
                    path = %blocker.mutator.path().display(),
                    ?outcome,
                    escalated,
                    "Policy enforced"
                );
            }
            Err(e) => log_resource_error(blocker.mutator.path(), e),
        }
        let layers = blocker
            .run_layers(policy, LayerAction::Enforce, escalated)
            .await;
        LayerReport {
            action: LayerAction::Enforce,
            resource,
            layers,
        }
    }

    async fn lift_inner(&self, policy: &BlockPolicy, escalated: bool) -> LayerReport {
        let blocker = self.blocker;
        blocker.unlock();
        let resource = blocker.mutator.remove(policy);
        match &resource {
            Ok(outcome) => tracing::info!(
                path = %blocker.mutator.path().display(),
                ?outcome,
                "Policy lifted"
            ),
            Err(e) => log_resource_error(blocker.mutator.path(), e),
        }
        let layers = blocker.run_layers(policy, LayerAction::Lift, escalated).await;
        LayerReport {
            action: LayerAction::Lift,
            resource,
            layers,
        }
    }
}

fn log_resource_error(path: &Path, e: &FocusError) {
    tracing::error!(path = %path.display(), error = %e, "Resource mutation failed");
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_enforce_runs_layers_in_stage_order() {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        assert_eq!(blocker.layer_names(), vec!["flush", "cache", "restart"]);

        let report = blocker.enforce(&policy()).await;
        assert!(report.is_clean());
        assert!(matches!(report.resource, Ok(MutationOutcome::Applied)));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["resource:apply", "flush:enforce", "cache:enforce"]
        );
        assert_eq!(report.layers[2].status, LayerStatus::Skipped);
        assert!(resource.content().contains("# FocusGuard Block Start"));
    }

    #[tokio::test]
    async fn test_enforce_twice_is_identical() {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);

        blocker.enforce(&policy()).await;
        let once = resource.content();
        let report = blocker.enforce(&policy()).await;
        assert!(matches!(report.resource, Ok(MutationOutcome::NoOp)));
        assert_eq!(resource.content(), once);
    }

    #[tokio::test]
    async fn test_failed_layer_does_not_stop_later_layers() {
        let journal = journal();
        let resource = Arc::new(MemoryResource::new("", journal.clone()));
        let blocker = LayeredBlocker::new(resource)
            .with_layer(
                Arc::new(
                    RecordingLayer::new("flush", LayerStage::ResolverFlush, journal.clone())
                        .failing(),
                ),
                true,
            )
            .with_layer(
                Arc::new(RecordingLayer::new("cache", LayerStage::ClientCache, journal.clone())),
                true,
            );

        let report = blocker.enforce(&policy()).await;
        assert!(report.resource_ok());
        assert!(!report.is_clean());
        let failed: Vec<_> = report.failed_layers().map(|o| o.layer.as_str()).collect();
        assert_eq!(failed, vec!["flush"]);
        assert_eq!(report.layers[1].status, LayerStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resource_failure_is_surfaced() {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        *resource.fail.lock().unwrap() = true;

        let report = blocker.enforce(&policy()).await;
        assert!(!report.resource_ok());
        // Later layers still ran
        assert!(journal.lock().unwrap().contains(&"cache:enforce".to_string()));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, FocusError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_lift_removes_region() {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        blocker.enforce(&policy()).await;
        let report = blocker.lift(&policy()).await;
        assert!(matches!(report.resource, Ok(MutationOutcome::Removed)));
        assert_eq!(resource.content(), "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_reapply_forces_client_restart() {
        let journal = journal();
        let (blocker, resource) = blocker(&journal);
        blocker.enforce(&policy()).await;
        resource.set_content("127.0.0.1 localhost\n");
        journal.lock().unwrap().clear();

        let report = blocker.reapply(&policy()).await;
        assert!(report.is_clean());
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "resource:remove",
                "flush:lift!",
                "cache:lift!",
                "restart:lift!",
                "resource:apply",
                "flush:enforce!",
                "cache:enforce!",
                "restart:enforce!",
            ]
        );
        assert!(crate::hosts::content_matches(&resource.content(), &policy()));
    }

    #[tokio::test]
    async fn test_region_check_under_exclusive_access() {
        let journal = journal();
        let (blocker, _resource) = blocker(&journal);
        let guard = blocker.exclusive().await;
        assert!(!guard.region_matches(&policy()).unwrap());
        guard.enforce(&policy()).await;
        assert!(guard.region_matches(&policy()).unwrap());
        drop(guard);

        // Released: a second caller can take it
        let _again = blocker.exclusive().await;
    }
}
