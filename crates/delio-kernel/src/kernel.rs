//! Boot-time assembly of the guard, the controller and the default handlers.

use std::sync::Arc;

use delio_core::{Collaborators, ExecutionContext, KernelEvent, State, UserId};
use delio_settings::DelioSettings;
use delio_telemetry::MetricsRecorder;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerts::AlertEmitter;
use crate::background::{spawn_alert_forwarder, Heartbeat};
use crate::controller::{ControllerConfig, FsmController, NotifyOutcome};
use crate::guard::{GuardConfig, StateGuard};
use crate::states::{register_defaults, HandlerConfig, HandlerDeps};

/// Point-in-time kernel status that reads no per-user state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelHealth {
    pub handlers: usize,
    pub missing_handlers: Vec<State>,
    pub tracked_users: usize,
    pub active_cycles: usize,
    pub alerts_emitted: u64,
}

pub struct Kernel {
    controller: Arc<FsmController>,
    alerts: Arc<AlertEmitter>,
    collaborators: Collaborators,
    settings: DelioSettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Kernel {
    /// Build a kernel with the default handler set. Every user starts IDLE.
    pub fn boot(
        settings: DelioSettings,
        collaborators: Collaborators,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        let alerts = Arc::new(AlertEmitter::new());
        let mut guard = StateGuard::new(GuardConfig::from(&settings.guard), alerts.clone());
        if let Some(metrics) = &metrics {
            guard = guard.with_metrics(metrics.clone());
        }
        let guard = Arc::new(guard);
        let reset = guard.reset_all_states();

        let config = ControllerConfig::from(&settings.cycle);
        let mut controller = FsmController::new(guard.clone(), config, alerts.clone());
        if let Some(metrics) = &metrics {
            controller = controller.with_metrics(metrics.clone());
        }
        let deps = HandlerDeps::new(guard, collaborators.clone(), HandlerConfig::from(&settings));
        register_defaults(&mut controller, &deps);

        let missing = controller.missing_handlers();
        if !missing.is_empty() {
            warn!(missing = ?missing, "states without handlers");
        }
        info!(
            handlers = controller.handler_count(),
            reset,
            max_transitions = settings.cycle.max_transitions,
            "kernel booted"
        );

        Self {
            controller: Arc::new(controller),
            alerts,
            collaborators,
            settings,
            metrics,
        }
    }

    pub fn controller(&self) -> &Arc<FsmController> {
        &self.controller
    }

    pub fn alerts(&self) -> &Arc<AlertEmitter> {
        &self.alerts
    }

    pub fn settings(&self) -> &DelioSettings {
        &self.settings
    }

    pub async fn process_event(&self, event: KernelEvent) -> ExecutionContext {
        self.controller.process_event(event).await
    }

    pub async fn dispatch_notification(&self, user_id: UserId, text: &str) -> NotifyOutcome {
        self.controller.dispatch_notification(user_id, text).await
    }

    /// Heartbeat over the configured roster.
    pub fn heartbeat(&self) -> Heartbeat {
        let users = self.settings.heartbeat.users.iter().copied().map(UserId::new).collect();
        let interval = self.settings.heartbeat.interval();
        let mut beat = Heartbeat::new(self.controller.clone(), interval, users)
            .with_idle_eviction(self.settings.guard.idle_eviction());
        if let Some(metrics) = &self.metrics {
            beat = beat.with_metrics(metrics.clone());
        }
        beat
    }

    /// Start the configured background tasks: the heartbeat when enabled and
    /// the alert forwarder when an admin user is set.
    pub fn start_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        if self.settings.heartbeat.enabled {
            tasks.push(self.heartbeat().spawn(cancel.child_token()));
        }
        if let Some(admin) = self.settings.delivery.admin_user_id {
            tasks.push(spawn_alert_forwarder(
                &self.alerts,
                self.collaborators.delivery.clone(),
                UserId::new(admin),
                cancel.child_token(),
            ));
        }
        tasks
    }

    pub fn health(&self) -> KernelHealth {
        KernelHealth {
            handlers: self.controller.handler_count(),
            missing_handlers: self.controller.missing_handlers(),
            tracked_users: self.controller.guard().tracked_users(),
            active_cycles: self.controller.active_cycles(),
            alerts_emitted: self.alerts.emit_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delio_core::mock::MockSet;

    #[tokio::test]
    async fn boot_registers_every_handler() {
        let collaborators = MockSet::default().collaborators();
        let kernel = Kernel::boot(DelioSettings::default(), collaborators, None);
        let health = kernel.health();
        assert_eq!(health.handlers, 11);
        assert!(health.missing_handlers.is_empty());
        assert_eq!(health.tracked_users, 0);
        assert_eq!(health.active_cycles, 0);
    }

    #[tokio::test]
    async fn heartbeat_uses_configured_roster() {
        let mut settings = DelioSettings::default();
        settings.heartbeat.users = vec![4, 5];
        let kernel = Kernel::boot(settings, MockSet::default().collaborators(), None);
        let handles = kernel.heartbeat().tick();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn background_tasks_follow_settings() {
        let mut settings = DelioSettings::default();
        settings.heartbeat.enabled = false;
        settings.delivery.admin_user_id = Some(1);
        let kernel = Kernel::boot(settings, MockSet::default().collaborators(), None);
        let cancel = CancellationToken::new();
        let tasks = kernel.start_background(&cancel);
        assert_eq!(tasks.len(), 1);
        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
