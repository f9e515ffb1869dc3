//! Per-user state authority: transition legality, side-effect permission,
//! and the transition lock guarding each state read-modify-write.
//!
//! Entries are created only by writes and bounded by
//! [`GuardConfig::max_tracked_users`]. Pure reads of an untracked user
//! report IDLE without creating an entry. At capacity, the least recently
//! touched IDLE entry whose lock nobody holds is evicted; if no entry
//! qualifies the write is refused with [`GuardError::CapacityExceeded`].
//! Finished cycles drop their entry through [`StateGuard::release`].
//!
//! Lock nesting: the controller's session lock is always taken before this
//! guard's transition lock for the same user, and the transition lock is
//! never held across an await other than its own acquisition.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use delio_core::{Action, GuardError, SideEffectMatrix, State, TransitionTable, UserId};
use delio_settings::GuardSettings;
use delio_telemetry::{names, MetricsRecorder};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEmitter, AlertSeverity, OperatorAlert};

#[derive(Clone, Debug)]
pub struct GuardConfig {
    pub max_tracked_users: usize,
    pub transition_lock_timeout: Duration,
    pub notify_lock_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from(&GuardSettings::default())
    }
}

impl From<&GuardSettings> for GuardConfig {
    fn from(settings: &GuardSettings) -> Self {
        Self {
            max_tracked_users: settings.max_tracked_users,
            transition_lock_timeout: settings.transition_lock_timeout(),
            notify_lock_timeout: settings.notify_lock_timeout(),
        }
    }
}

struct UserSession {
    state: State,
    lock: Arc<Mutex<()>>,
    last_touched: Instant,
}

impl UserSession {
    fn new() -> Self {
        Self {
            state: State::Idle,
            lock: Arc::new(Mutex::new(())),
            last_touched: Instant::now(),
        }
    }

    /// IDLE, and no caller holds or waits on the lock.
    fn is_evictable(&self) -> bool {
        self.state == State::Idle && Arc::strong_count(&self.lock) == 1
    }
}

pub struct StateGuard {
    sessions: DashMap<UserId, UserSession>,
    table: TransitionTable,
    matrix: SideEffectMatrix,
    config: GuardConfig,
    alerts: Arc<AlertEmitter>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl StateGuard {
    /// Guard over the canonical transition table and side-effect matrix.
    pub fn new(config: GuardConfig, alerts: Arc<AlertEmitter>) -> Self {
        Self::with_tables(
            TransitionTable::canonical(),
            SideEffectMatrix::canonical(),
            config,
            alerts,
        )
    }

    pub fn with_tables(
        table: TransitionTable,
        matrix: SideEffectMatrix,
        config: GuardConfig,
        alerts: Arc<AlertEmitter>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            table,
            matrix,
            config,
            alerts,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn matrix(&self) -> &SideEffectMatrix {
        &self.matrix
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Current state; IDLE for users with no entry.
    pub fn get_state(&self, user_id: UserId) -> State {
        self.sessions
            .get(&user_id)
            .map_or(State::Idle, |session| session.state)
    }

    pub fn tracked_users(&self) -> usize {
        self.sessions.len()
    }

    /// Validate and commit `next`. The caller must hold the user's session
    /// lock.
    ///
    /// Entering ERROR is always legal. Any other target outside the table
    /// forces ERROR, raises a critical alert, and returns
    /// [`GuardError::IllegalTransition`]. A lock timeout leaves the state
    /// untouched.
    pub async fn enter(&self, user_id: UserId, next: State) -> Result<State, GuardError> {
        self.enter_within(user_id, next, self.config.transition_lock_timeout).await
    }

    /// [`enter`](Self::enter) with an explicit lock deadline.
    pub async fn enter_within(
        &self,
        user_id: UserId,
        next: State,
        wait: Duration,
    ) -> Result<State, GuardError> {
        let _held = self.acquire(user_id, wait).await?;
        let mut session = self
            .sessions
            .entry(user_id)
            .or_insert_with(UserSession::new);
        let current = session.state;

        if next != State::Error && !self.table.permits(current, next) {
            session.state = State::Error;
            session.last_touched = Instant::now();
            drop(session);
            let err = GuardError::IllegalTransition {
                user_id,
                from: current,
                to: next,
            };
            error!(
                user_id = %user_id,
                from = %current,
                to = %next,
                "illegal transition, forcing ERROR"
            );
            self.escalate(&err);
            return Err(err);
        }

        if next == State::Error {
            warn!(user_id = %user_id, from = %current, "emergency transition to ERROR");
        } else {
            debug!(user_id = %user_id, from = %current, to = %next, "transition");
        }
        session.state = next;
        session.last_touched = Instant::now();
        drop(session);

        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                names::TRANSITIONS_TOTAL,
                &[("from", current.name()), ("to", next.name())],
                1,
            );
        }
        Ok(current)
    }

    /// Deny unless the user's current state may exercise `action`.
    pub fn assert_allowed(&self, user_id: UserId, action: Action) -> Result<(), GuardError> {
        let state = self.get_state(user_id);
        if self.matrix.permits(action, state) {
            return Ok(());
        }
        let err = GuardError::PermissionDenied { user_id, action, state };
        error!(user_id = %user_id, action = %action, state = %state, "side effect blocked");
        self.escalate(&err);
        Err(err)
    }

    /// Out-of-band IDLE to NOTIFY for producers that must never wait behind
    /// a running cycle. Returns false instead of waiting.
    pub async fn try_enter_notify(&self, user_id: UserId) -> bool {
        if self.get_state(user_id) != State::Idle
            || !self.table.permits(State::Idle, State::Notify)
        {
            return false;
        }
        let Ok(_held) = self.acquire(user_id, self.config.notify_lock_timeout).await else {
            debug!(user_id = %user_id, "notify skipped, transition lock busy");
            return false;
        };
        let Some(mut session) = self.sessions.get_mut(&user_id) else {
            return false;
        };
        if session.state != State::Idle {
            return false;
        }
        session.state = State::Notify;
        session.last_touched = Instant::now();
        true
    }

    /// Unconditional reset to IDLE. Untracked users already read IDLE and
    /// are left untracked.
    pub fn force_idle(&self, user_id: UserId) {
        if let Some(mut session) = self.sessions.get_mut(&user_id) {
            if session.state != State::Idle {
                debug!(user_id = %user_id, from = %session.state, "forced IDLE");
            }
            session.state = State::Idle;
            session.last_touched = Instant::now();
        }
    }

    /// Crash amnesia: force every tracked user to IDLE. Returns the number
    /// of tracked users reset.
    pub fn reset_all_states(&self) -> usize {
        let mut reset = 0;
        for mut session in self.sessions.iter_mut() {
            session.state = State::Idle;
            session.last_touched = Instant::now();
            reset += 1;
        }
        info!(count = reset, "reset all user states to IDLE");
        reset
    }

    /// Drop IDLE entries untouched for at least `older_than` whose lock is
    /// free. Returns the number evicted.
    pub fn evict_idle(&self, older_than: Duration) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|_, session| {
            let stale = session.is_evictable() && session.last_touched.elapsed() >= older_than;
            if stale {
                evicted += 1;
            }
            !stale
        });
        if evicted > 0 {
            debug!(count = evicted, "evicted idle user entries");
        }
        self.record_population();
        evicted
    }

    /// Forget the user's entry once it is IDLE and its lock is free.
    /// Returns whether the entry was removed.
    pub fn release(&self, user_id: UserId) -> bool {
        let removed = self
            .sessions
            .remove_if(&user_id, |_, session| session.is_evictable())
            .is_some();
        if removed {
            self.record_population();
        }
        removed
    }

    /// Users currently tracked in a non-IDLE state.
    pub fn busy_users(&self) -> Vec<(UserId, State)> {
        let mut busy: Vec<(UserId, State)> = self
            .sessions
            .iter()
            .filter(|entry| entry.state != State::Idle)
            .map(|entry| (*entry.key(), entry.state))
            .collect();
        busy.sort();
        busy
    }

    async fn acquire(
        &self,
        user_id: UserId,
        wait: Duration,
    ) -> Result<OwnedMutexGuard<()>, GuardError> {
        let lock = self.transition_lock(user_id)?;
        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(held) => Ok(held),
            Err(_) => {
                let err = GuardError::LockTimeout { user_id, waited: wait };
                warn!(
                    user_id = %user_id,
                    waited_ms = wait.as_millis() as u64,
                    "transition lock timeout"
                );
                self.escalate(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn transition_lock(&self, user_id: UserId) -> Result<Arc<Mutex<()>>, GuardError> {
        if let Some(session) = self.sessions.get(&user_id) {
            return Ok(session.lock.clone());
        }
        if self.sessions.len() >= self.config.max_tracked_users {
            self.evict_one()?;
        }
        let lock = self
            .sessions
            .entry(user_id)
            .or_insert_with(UserSession::new)
            .lock
            .clone();
        self.record_population();
        Ok(lock)
    }

    fn evict_one(&self) -> Result<(), GuardError> {
        let candidate = self
            .sessions
            .iter()
            .filter(|entry| entry.is_evictable())
            .min_by_key(|entry| entry.last_touched)
            .map(|entry| *entry.key());

        let evicted = candidate
            .and_then(|user| self.sessions.remove_if(&user, |_, s| s.is_evictable()));
        match evicted {
            Some((user, _)) => {
                debug!(user_id = %user, "evicted least recently used idle entry");
                Ok(())
            }
            None => {
                let err = GuardError::CapacityExceeded {
                    limit: self.config.max_tracked_users,
                };
                warn!(limit = self.config.max_tracked_users, "tracked user ceiling reached");
                self.escalate(&err);
                Err(err)
            }
        }
    }

    fn escalate(&self, err: &GuardError) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::GUARD_DENIALS_TOTAL, &[("kind", err.error_kind())], 1);
        }
        let severity = if err.is_violation() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let user_id = match err {
            GuardError::IllegalTransition { user_id, .. }
            | GuardError::PermissionDenied { user_id, .. }
            | GuardError::LockTimeout { user_id, .. } => Some(*user_id),
            GuardError::CapacityExceeded { .. } => None,
        };
        self.alerts
            .emit(OperatorAlert::new(severity, err.error_kind(), user_id, err.to_string()));
    }

    fn record_population(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set(names::TRACKED_USERS, &[], self.sessions.len() as f64);
        }
    }
}
