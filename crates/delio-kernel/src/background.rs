//! Background producers: the periodic heartbeat, reminder delivery, and the
//! operator-alert forwarder.

use std::sync::Arc;
use std::time::Duration;

use delio_core::{Delivery, ExecutionContext, KernelEvent, State, UserId};
use delio_telemetry::{names, MetricsRecorder};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertEmitter;
use crate::controller::{FsmController, NotifyOutcome};

/// Periodic proactive check-in for a fixed roster of users.
pub struct Heartbeat {
    controller: Arc<FsmController>,
    interval: Duration,
    users: Vec<UserId>,
    idle_eviction: Option<Duration>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Heartbeat {
    pub fn new(controller: Arc<FsmController>, interval: Duration, users: Vec<UserId>) -> Self {
        Self {
            controller,
            interval,
            users,
            idle_eviction: None,
            metrics: None,
        }
    }

    /// Also sweep guard entries idle for longer than `older_than` on each tick.
    pub fn with_idle_eviction(mut self, older_than: Duration) -> Self {
        self.idle_eviction = Some(older_than);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one beat: sweep, then start a heartbeat cycle for every roster
    /// user who is IDLE and has nothing queued.
    pub fn tick(&self) -> Vec<JoinHandle<ExecutionContext>> {
        let guard = self.controller.guard();
        if let Some(older_than) = self.idle_eviction {
            let evicted = guard.evict_idle(older_than);
            if evicted > 0 {
                info!(evicted, "evicted idle sessions");
            }
        }

        let mut started = Vec::new();
        for &user_id in &self.users {
            if guard.get_state(user_id) != State::Idle || self.controller.is_busy(user_id) {
                debug!(user_id = %user_id, "heartbeat skipped, user busy");
                continue;
            }
            let controller = self.controller.clone();
            started.push(tokio::spawn(async move {
                controller.process_event(KernelEvent::heartbeat(user_id)).await
            }));
        }
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::HEARTBEAT_DISPATCHED_TOTAL, &[], started.len() as u64);
        }
        started
    }

    /// Beat every `interval` until `cancel` fires. The first beat happens
    /// one interval after start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                users = self.users.len(),
                interval_secs = self.interval.as_secs(),
                "heartbeat started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            info!("heartbeat stopped");
        })
    }
}

/// Deliver a reminder, retrying while the user is mid-cycle. Gives up after
/// `attempts` deferrals and reports the last outcome.
pub async fn deliver_reminder(
    controller: &FsmController,
    user_id: UserId,
    text: &str,
    retry_every: Duration,
    attempts: u32,
) -> NotifyOutcome {
    let mut outcome = NotifyOutcome::Deferred;
    for attempt in 1..=attempts.max(1) {
        outcome = controller.dispatch_notification(user_id, text).await;
        if outcome != NotifyOutcome::Deferred {
            break;
        }
        debug!(user_id = %user_id, attempt, "reminder deferred, retrying");
        tokio::time::sleep(retry_every).await;
    }
    if outcome == NotifyOutcome::Deferred {
        warn!(user_id = %user_id, "reminder dropped, user stayed busy");
    }
    outcome
}

/// Forward every operator alert to the admin user until `cancel` fires or
/// the emitter goes away.
pub fn spawn_alert_forwarder(
    alerts: &AlertEmitter,
    delivery: Arc<dyn Delivery>,
    admin: UserId,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = alerts.subscribe();
    tokio::spawn(async move {
        loop {
            let alert = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(alert) => alert,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "alert forwarder lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if let Err(e) = delivery.send(admin, &alert.render()).await {
                warn!(error = %e, kind = %alert.kind, "failed to forward operator alert");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, OperatorAlert};
    use crate::controller::ControllerConfig;
    use crate::guard::{GuardConfig, StateGuard};
    use crate::handler::fixed;
    use delio_core::mock::MockDelivery;

    fn controller() -> Arc<FsmController> {
        let alerts = Arc::new(AlertEmitter::new());
        let guard = Arc::new(StateGuard::new(GuardConfig::default(), alerts.clone()));
        let mut c = FsmController::new(guard, ControllerConfig::default(), alerts);
        c.register_handler(State::Observe, fixed(State::Plan));
        c.register_handler(State::Plan, fixed(State::Decide));
        c.register_handler(State::Decide, fixed(State::Idle));
        c.register_handler(State::Notify, fixed(State::Idle));
        c.register_handler(State::Error, fixed(State::Idle));
        Arc::new(c)
    }

    #[tokio::test]
    async fn tick_runs_idle_users() {
        let c = controller();
        let users = vec![UserId::new(1), UserId::new(2)];
        let beat = Heartbeat::new(c.clone(), Duration::from_secs(60), users);
        let handles = beat.tick();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            let ctx = handle.await.unwrap();
            assert_eq!(ctx.trace(), ["START", "OBSERVE", "PLAN", "DECIDE"]);
        }
    }

    #[tokio::test]
    async fn tick_skips_users_not_idle() {
        let c = controller();
        c.guard().enter(UserId::new(1), State::Observe).await.unwrap();
        let beat = Heartbeat::new(c.clone(), Duration::from_secs(60), vec![UserId::new(1)]);
        assert!(beat.tick().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_stops_on_cancel() {
        let c = controller();
        let metrics = Arc::new(MetricsRecorder::new());
        let cancel = CancellationToken::new();
        let handle = Heartbeat::new(c, Duration::from_secs(10), vec![UserId::new(1)])
            .with_metrics(metrics.clone())
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(metrics.counter_get(names::HEARTBEAT_DISPATCHED_TOTAL, &[]), 2);
    }

    #[tokio::test]
    async fn reminder_delivered_on_first_try() {
        let c = controller();
        let retry = Duration::from_millis(1);
        let outcome = deliver_reminder(&c, UserId::new(3), "drink water", retry, 3).await;
        assert_eq!(outcome, NotifyOutcome::Delivered);
    }

    #[tokio::test]
    async fn reminder_gives_up_while_user_busy() {
        let c = controller();
        c.guard().enter(UserId::new(3), State::Observe).await.unwrap();
        let retry = Duration::from_millis(1);
        let outcome = deliver_reminder(&c, UserId::new(3), "drink water", retry, 2).await;
        assert_eq!(outcome, NotifyOutcome::Deferred);
    }

    #[tokio::test]
    async fn alerts_reach_admin() {
        let alerts = AlertEmitter::new();
        let delivery = Arc::new(MockDelivery::new());
        let cancel = CancellationToken::new();
        let handle =
            spawn_alert_forwarder(&alerts, delivery.clone(), UserId::new(99), cancel.clone());

        alerts.emit(OperatorAlert::new(
            AlertSeverity::Critical,
            "illegal_transition",
            Some(UserId::new(1)),
            "PLAN -> ACT",
        ));
        for _ in 0..50 {
            if !delivery.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        let sent = delivery.sent_to(UserId::new(99));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[CRITICAL] illegal_transition"));
    }
}
