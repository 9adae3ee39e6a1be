//! Desktop notifications for events the operator should see
//!
//! Tamper detection and difficulty escalation pop a notification.
//! Delivery is best-effort; a missing notifier only logs.

use crate::events::{EngineEvent, EventKind};
use crate::layers::command::applescript_quote;
use crate::layers::{CommandRunner, Platform};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TITLE: &str = "Focus Guard";

pub struct DesktopNotifier {
    runner: Arc<dyn CommandRunner>,
    platform: Platform,
}

impl DesktopNotifier {
    pub fn new(runner: Arc<dyn CommandRunner>, platform: Platform) -> Self {
        Self { runner, platform }
    }

    /// Notification text for an event, if it warrants one
    pub fn message(event: &EngineEvent) -> Option<String> {
        match &event.kind {
            EventKind::TamperDetected { resource_path } => Some(format!(
                "Edit to {} reverted (bypass attempt #{})",
                resource_path.display(),
                event.counters.bypass_attempt_count
            )),
            EventKind::DifficultyEscalated { from, to } => {
                Some(format!("Exit challenge difficulty raised from {from} to {to}"))
            }
            _ => None,
        }
    }

    /// Show the notification for one event
    pub async fn notify(&self, event: &EngineEvent) {
        let Some(text) = Self::message(event) else {
            return;
        };

        let script;
        let (program, args): (&str, Vec<&str>) = match self.platform {
            Platform::MacOs => {
                script = format!(
                    "display notification {} with title {}",
                    applescript_quote(&text),
                    applescript_quote(TITLE)
                );
                ("osascript", vec!["-e", script.as_str()])
            }
            Platform::Linux => ("notify-send", vec![TITLE, text.as_str()]),
            Platform::Other => {
                tracing::debug!(event = event.kind.name(), "No notifier on this platform");
                return;
            }
        };

        match self.runner.run(program, &args).await {
            Ok(out) if out.success => {
                tracing::debug!(event = event.kind.name(), "Notification shown");
            }
            Ok(out) => {
                tracing::warn!(program, code = ?out.code, stderr = %out.stderr.trim(), "Notification failed");
            }
            Err(e) => tracing::warn!(error = %e, "Notification failed"),
        }
    }

    /// Notify for every event on the bus until it closes
    pub fn spawn(self, mut rx: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.notify(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Notifier lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
