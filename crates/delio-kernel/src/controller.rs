//! Cycle driver: serializes cycles per user, walks the state graph through
//! the registered handlers and commits every step through the guard.
//!
//! Whole-cycle deadlines cancel the in-flight handler future at its current
//! await point; the driver then runs a bounded ERROR to IDLE unwind so the
//! ERROR handler can tell the user the turn took too long.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use delio_core::{
    ErrorKind, EventType, ExecutionContext, GuardError, KernelEvent, State, UserId, TRACE_START,
};
use delio_settings::CycleSettings;
use delio_telemetry::{names, MetricsRecorder};
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{AlertEmitter, AlertSeverity, OperatorAlert};
use crate::guard::StateGuard;
use crate::handler::{error_kind_of, panic_message, StateHandler};

/// Extra transitions allowed past the ceiling for the ERROR to IDLE unwind
/// before the cycle is abandoned outright.
const UNWIND_ALLOWANCE: u32 = 2;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub cycle_timeout: Duration,
    pub max_transitions: u32,
    pub error_unwind_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&CycleSettings::default())
    }
}

impl From<&CycleSettings> for ControllerConfig {
    fn from(settings: &CycleSettings) -> Self {
        Self {
            cycle_timeout: settings.timeout(),
            max_transitions: settings.max_transitions,
            error_unwind_timeout: settings.error_unwind_timeout(),
        }
    }
}

/// Result of an out-of-band reminder dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    /// The user was busy; nothing was sent.
    Deferred,
    Failed { errors: Vec<String> },
}

/// Outcome of committing one step.
enum Commit {
    Entered(State),
    /// Illegal target; the guard has already forced ERROR.
    Diverted,
    /// The transition lock could not be taken; state is untouched.
    Aborted,
}

pub struct FsmController {
    guard: Arc<StateGuard>,
    handlers: HashMap<State, Arc<dyn StateHandler>>,
    session_locks: DashMap<UserId, Arc<Mutex<()>>>,
    config: ControllerConfig,
    alerts: Arc<AlertEmitter>,
    metrics: Option<Arc<MetricsRecorder>>,
    active_cycles: AtomicUsize,
}

impl FsmController {
    pub fn new(
        guard: Arc<StateGuard>,
        config: ControllerConfig,
        alerts: Arc<AlertEmitter>,
    ) -> Self {
        Self {
            guard,
            handlers: HashMap::new(),
            session_locks: DashMap::new(),
            config,
            alerts,
            metrics: None,
            active_cycles: AtomicUsize::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind `handler` to `state`, returning the handler it replaces.
    pub fn register_handler(
        &mut self,
        state: State,
        handler: Arc<dyn StateHandler>,
    ) -> Option<Arc<dyn StateHandler>> {
        let previous = self.handlers.insert(state, handler);
        if previous.is_some() {
            warn!(state = %state, "replaced existing state handler");
        }
        previous
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Non-IDLE states with no handler bound.
    pub fn missing_handlers(&self) -> Vec<State> {
        State::ALL
            .into_iter()
            .filter(|s| *s != State::Idle && !self.handlers.contains_key(s))
            .collect()
    }

    pub fn guard(&self) -> &Arc<StateGuard> {
        &self.guard
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn active_cycles(&self) -> usize {
        self.active_cycles.load(Ordering::Relaxed)
    }

    /// A cycle or dispatch for this user is running or queued.
    pub fn is_busy(&self, user_id: UserId) -> bool {
        self.session_locks.contains_key(&user_id)
    }

    /// Run one full cycle for `event`. Never fails: every failure is
    /// recorded on the returned context and the user ends IDLE.
    #[instrument(
        skip_all,
        fields(user_id = %event.user_id, event_type = event.event_type.as_str())
    )]
    pub async fn process_event(&self, event: KernelEvent) -> ExecutionContext {
        let mut ctx = ExecutionContext::from_event(&event);
        ctx.add_trace(TRACE_START);
        let user_id = ctx.user_id;

        let lock = self.session_lock(user_id);
        let held = lock.clone().lock_owned().await;
        let _cleanup = CycleCleanup::new(self, user_id, held, lock);
        debug!(trace_id = %ctx.trace_id, "cycle started");

        let deadline = self.config.cycle_timeout;
        if tokio::time::timeout(deadline, self.run_cycle(&mut ctx)).await.is_err() {
            let state = self.guard.get_state(user_id);
            ctx.timed_out = true;
            ctx.record_error(
                ErrorKind::CycleTimeout,
                Some(state),
                format!("cycle exceeded {}ms deadline in {state}", deadline.as_millis()),
            );
            warn!(trace_id = %ctx.trace_id, state = %state, "cycle deadline expired");
            self.alert(
                AlertSeverity::Warning,
                ErrorKind::CycleTimeout,
                user_id,
                format!("cycle timed out in {state}"),
            );
            self.unwind(&mut ctx).await;
        }

        self.record_cycle(&ctx);
        info!(
            trace_id = %ctx.trace_id,
            steps = ctx.trace().len(),
            errors = ctx.errors().len(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "cycle finished"
        );
        ctx
    }

    /// Deliver a reminder without interrupting a running cycle. Returns
    /// [`NotifyOutcome::Deferred`] when the user is busy.
    #[instrument(skip(self, text), fields(user_id = %user_id))]
    pub async fn dispatch_notification(&self, user_id: UserId, text: &str) -> NotifyOutcome {
        let lock = self.session_lock(user_id);
        let Ok(held) = lock.clone().try_lock_owned() else {
            drop(lock);
            self.release_session_lock(user_id);
            debug!("reminder deferred, cycle in progress");
            return NotifyOutcome::Deferred;
        };
        if !self.guard.try_enter_notify(user_id).await {
            drop(held);
            drop(lock);
            self.release_session_lock(user_id);
            debug!("reminder deferred, user not idle");
            return NotifyOutcome::Deferred;
        }
        let _cleanup = CycleCleanup::new(self, user_id, held, lock);

        let event = KernelEvent::new(user_id, EventType::Reminder, text);
        let mut ctx = ExecutionContext::from_event(&event);
        ctx.add_trace(TRACE_START);
        let deadline = self.config.cycle_timeout;
        if tokio::time::timeout(deadline, self.drive(&mut ctx, State::Notify, 1))
            .await
            .is_err()
        {
            ctx.timed_out = true;
            ctx.record_error(
                ErrorKind::CycleTimeout,
                Some(State::Notify),
                "reminder delivery timed out",
            );
            warn!("reminder delivery timed out");
        }

        if let Some(metrics) = &self.metrics {
            let outcome = if ctx.has_errors() { "failed" } else { "delivered" };
            metrics.counter_inc(names::NOTIFICATIONS_TOTAL, &[("outcome", outcome)], 1);
        }
        if ctx.has_errors() {
            NotifyOutcome::Failed {
                errors: ctx.errors().iter().map(ToString::to_string).collect(),
            }
        } else {
            NotifyOutcome::Delivered
        }
    }

    async fn run_cycle(&self, ctx: &mut ExecutionContext) {
        let user_id = ctx.user_id;
        self.guard.force_idle(user_id);
        match self.commit(ctx, State::Idle, State::Observe).await {
            Commit::Entered(state) => self.drive(ctx, state, 1).await,
            Commit::Diverted => self.drive(ctx, State::Error, 1).await,
            Commit::Aborted => self.unwind(ctx).await,
        }
    }

    /// Walk the graph from `state` (already committed) until IDLE, the hard
    /// ceiling, or an uncommittable step.
    async fn drive(&self, ctx: &mut ExecutionContext, mut state: State, mut transitions: u32) {
        let user_id = ctx.user_id;
        let ceiling = self.config.max_transitions;
        let mut limit_hit = false;

        while state != State::Idle {
            if transitions > ceiling + UNWIND_ALLOWANCE {
                error!(state = %state, transitions, "unwind did not reach IDLE, abandoning cycle");
                break;
            }

            let Some(handler) = self.handlers.get(&state).cloned() else {
                error!(state = %state, "no handler registered");
                ctx.record_error(
                    ErrorKind::MissingHandler,
                    Some(state),
                    format!("missing handler for {state}"),
                );
                if state == State::Error {
                    break;
                }
                match self.commit(ctx, state, State::Error).await {
                    Commit::Entered(next) => state = next,
                    Commit::Diverted => state = State::Error,
                    Commit::Aborted => {
                        self.unwind(ctx).await;
                        break;
                    }
                }
                transitions += 1;
                continue;
            };

            ctx.add_trace(state.name());
            let mut next = self.invoke(handler.as_ref(), ctx, state).await;

            if !limit_hit && transitions >= ceiling && next != State::Idle {
                limit_hit = true;
                ctx.record_error(
                    ErrorKind::LoopLimitExceeded,
                    Some(state),
                    format!("loop limit exceeded after {transitions} transitions"),
                );
                warn!(state = %state, transitions, "transition ceiling reached, forcing ERROR");
                self.alert(
                    AlertSeverity::Warning,
                    ErrorKind::LoopLimitExceeded,
                    user_id,
                    format!("ceiling of {ceiling} transitions reached in {state}"),
                );
                if let Err(e) = self
                    .guard
                    .enter_within(user_id, State::Error, self.config.error_unwind_timeout)
                    .await
                {
                    error!(error = %e, "could not enter ERROR after ceiling breach, aborting");
                    ctx.record_error(abort_kind(&e), Some(state), e.to_string());
                    break;
                }
                state = State::Error;
                transitions += 1;
                continue;
            }

            if state == State::Error
                && next != State::Idle
                && !self.guard.table().permits(State::Error, next)
            {
                // An ERROR handler asking to go anywhere but IDLE cannot be
                // unwound further.
                ctx.record_error(
                    ErrorKind::IllegalTransition,
                    Some(state),
                    format!("ERROR handler returned {next}"),
                );
                next = State::Idle;
            }

            match self.commit(ctx, state, next).await {
                Commit::Entered(entered) => state = entered,
                Commit::Diverted if state == State::Error => break,
                Commit::Diverted => state = State::Error,
                Commit::Aborted if state == State::Error => break,
                Commit::Aborted => {
                    self.unwind(ctx).await;
                    break;
                }
            }
            transitions += 1;
        }
    }

    /// Run one handler, mapping raised errors and panics to a next state.
    async fn invoke(
        &self,
        handler: &dyn StateHandler,
        ctx: &mut ExecutionContext,
        state: State,
    ) -> State {
        let fallback = if state == State::Error {
            State::Idle
        } else {
            State::Error
        };
        match AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                warn!(state = %state, error = %e, kind = e.error_kind(), "handler failed");
                ctx.record_error(error_kind_of(&e), Some(state), e.to_string());
                fallback
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(state = %state, panic = %msg, "handler panicked");
                ctx.record_error(
                    ErrorKind::HandlerFailure,
                    Some(state),
                    format!("handler for {state} crashed: {msg}"),
                );
                fallback
            }
        }
    }

    async fn commit(&self, ctx: &mut ExecutionContext, from: State, next: State) -> Commit {
        match self.guard.enter(ctx.user_id, next).await {
            Ok(_) => Commit::Entered(next),
            Err(e @ GuardError::IllegalTransition { .. }) => {
                ctx.record_error(ErrorKind::IllegalTransition, Some(from), e.to_string());
                Commit::Diverted
            }
            Err(e) => {
                ctx.record_error(abort_kind(&e), Some(from), e.to_string());
                Commit::Aborted
            }
        }
    }

    /// Bounded ERROR to IDLE walk after the cycle deadline expired or a
    /// commit was aborted.
    async fn unwind(&self, ctx: &mut ExecutionContext) {
        let user_id = ctx.user_id;
        let deadline = self.config.error_unwind_timeout;
        let handler = self.handlers.get(&State::Error).cloned();
        let unwound = tokio::time::timeout(deadline, async {
            if self.guard.enter_within(user_id, State::Error, deadline).await.is_err() {
                return;
            }
            ctx.add_trace(State::Error.name());
            if let Some(handler) = handler {
                let _ = self.invoke(handler.as_ref(), ctx, State::Error).await;
            }
            let _ = self.guard.enter_within(user_id, State::Idle, deadline).await;
        })
        .await;
        if unwound.is_err() {
            warn!(user_id = %user_id, "timeout unwind did not finish");
        }
    }

    fn session_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the user's session lock if nobody else holds or awaits it.
    fn release_session_lock(&self, user_id: UserId) {
        self.session_locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn alert(&self, severity: AlertSeverity, kind: ErrorKind, user_id: UserId, message: String) {
        self.alerts
            .emit(OperatorAlert::new(severity, kind.as_str(), Some(user_id), message));
    }

    fn record_cycle(&self, ctx: &ExecutionContext) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = if ctx.timed_out {
            "timeout"
        } else if ctx.has_errors() {
            "error"
        } else {
            "ok"
        };
        metrics.counter_inc(names::CYCLES_TOTAL, &[("outcome", outcome)], 1);
        for err in ctx.errors() {
            metrics.counter_inc(names::CYCLE_ERRORS_TOTAL, &[("kind", err.kind.as_str())], 1);
        }
        let elapsed_ms = ctx.elapsed().as_secs_f64() * 1000.0;
        metrics.histogram_observe(names::CYCLE_DURATION_MS, &[], elapsed_ms);
    }
}

/// Context error kind for a guard failure that leaves the state untouched.
fn abort_kind(err: &GuardError) -> ErrorKind {
    match err {
        GuardError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        _ => ErrorKind::LockTimeout,
    }
}

/// Teardown that runs however the cycle ends, including when the caller
/// drops the `process_event` future: force IDLE, release the session lock,
/// and forget its bookkeeping.
struct CycleCleanup<'a> {
    controller: &'a FsmController,
    user_id: UserId,
    held: Option<OwnedMutexGuard<()>>,
    lock: Option<Arc<Mutex<()>>>,
}

impl<'a> CycleCleanup<'a> {
    fn new(
        controller: &'a FsmController,
        user_id: UserId,
        held: OwnedMutexGuard<()>,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        controller.active_cycles.fetch_add(1, Ordering::Relaxed);
        Self {
            controller,
            user_id,
            held: Some(held),
            lock: Some(lock),
        }
    }
}

impl Drop for CycleCleanup<'_> {
    fn drop(&mut self) {
        self.controller.guard.force_idle(self.user_id);
        self.controller.guard.release(self.user_id);
        drop(self.held.take());
        drop(self.lock.take());
        self.controller.release_session_lock(self.user_id);
        self.controller.active_cycles.fetch_sub(1, Ordering::Relaxed);
    }
}
