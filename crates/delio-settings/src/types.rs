//! Settings sections. Every section tolerates missing keys so a partial
//! `settings.json` deep-merges cleanly over the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelioSettings {
    pub guard: GuardSettings,
    pub cycle: CycleSettings,
    pub heartbeat: HeartbeatSettings,
    pub delivery: DeliverySettings,
    pub planning: PlanningSettings,
    pub logging: LoggingSettings,
}

impl DelioSettings {
    /// Reject values the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("guard.maxTrackedUsers", self.guard.max_tracked_users as u64),
            ("guard.transitionLockTimeoutMs", self.guard.transition_lock_timeout_ms),
            ("guard.notifyLockTimeoutMs", self.guard.notify_lock_timeout_ms),
            ("cycle.timeoutMs", self.cycle.timeout_ms),
            ("cycle.maxTransitions", u64::from(self.cycle.max_transitions)),
            ("cycle.errorUnwindTimeoutMs", self.cycle.error_unwind_timeout_ms),
            ("heartbeat.intervalSecs", self.heartbeat.interval_secs),
            ("delivery.maxMessageChars", self.delivery.max_message_chars as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::InvalidValue(format!("{key} must be positive")));
        }
        if self.planning.lesson_score_threshold > 10 {
            return Err(SettingsError::InvalidValue(
                "planning.lessonScoreThreshold must be at most 10".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-user state tracking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardSettings {
    /// Ceiling on users with a tracked state entry.
    pub max_tracked_users: usize,
    /// Deadline for acquiring a user's transition lock.
    pub transition_lock_timeout_ms: u64,
    /// Deadline for the out-of-band IDLE to NOTIFY attempt.
    pub notify_lock_timeout_ms: u64,
    /// Idle entries untouched for this long are evicted by the sweep.
    pub idle_eviction_secs: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_tracked_users: 10_000,
            transition_lock_timeout_ms: 2_000,
            notify_lock_timeout_ms: 50,
            idle_eviction_secs: 3_600,
        }
    }
}

impl GuardSettings {
    pub fn transition_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_lock_timeout_ms)
    }

    pub fn notify_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_lock_timeout_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

/// Bounds on a single cognitive cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CycleSettings {
    /// Whole-cycle deadline.
    pub timeout_ms: u64,
    /// Transition ceiling per cycle.
    pub max_transitions: u32,
    /// Deadline for the ERROR to IDLE unwind after a timeout, an aborted
    /// commit or a ceiling breach.
    pub error_unwind_timeout_ms: u64,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_transitions: 25,
            error_unwind_timeout_ms: 5_000,
        }
    }
}

impl CycleSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn error_unwind_timeout(&self) -> Duration {
        Duration::from_millis(self.error_unwind_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Users eligible for heartbeat cycles.
    pub users: Vec<i64>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            users: Vec::new(),
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Messages longer than this are split into chunks.
    pub max_message_chars: usize,
    /// Receives operator alerts when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_user_id: Option<i64>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_message_chars: 4_000,
            admin_user_id: None,
        }
    }
}

/// Default handler behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanningSettings {
    /// Validate every draft plan with a critic call.
    pub critic_enabled: bool,
    /// Self-evaluate responses in REFLECT.
    pub reflection_enabled: bool,
    /// Evaluations scoring below this become stored lessons.
    pub lesson_score_threshold: u8,
}

impl Default for PlanningSettings {
    fn default() -> Self {
        Self {
            critic_enabled: true,
            reflection_enabled: true,
            lesson_score_threshold: 7,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Per-module overrides, e.g. `{"delio_kernel::guard": "debug"}`.
    pub modules: std::collections::BTreeMap<String, String>,
    /// Persist warn+ records to SQLite.
    pub persist_warnings: bool,
    /// Path of the warn+ log database. Defaults under `~/.delio`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: std::collections::BTreeMap::new(),
            persist_warnings: true,
            db_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DelioSettings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(DelioSettings::default()).unwrap();
        assert_eq!(json["guard"]["maxTrackedUsers"], 10_000);
        assert_eq!(json["cycle"]["timeoutMs"], 120_000);
        assert_eq!(json["delivery"]["maxMessageChars"], 4_000);
        assert!(json["delivery"].get("adminUserId").is_none());
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let settings: DelioSettings =
            serde_json::from_str(r#"{"cycle": {"maxTransitions": 5}}"#).unwrap();
        assert_eq!(settings.cycle.max_transitions, 5);
        assert_eq!(settings.cycle.timeout_ms, 120_000);
        assert_eq!(settings.guard, GuardSettings::default());
    }

    #[test]
    fn zero_ceiling_rejected() {
        let mut settings = DelioSettings::default();
        settings.cycle.max_transitions = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cycle.maxTransitions"));
    }

    #[test]
    fn threshold_above_ten_rejected() {
        let mut settings = DelioSettings::default();
        settings.planning.lesson_score_threshold = 11;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn duration_helpers() {
        let settings = DelioSettings::default();
        assert_eq!(settings.cycle.timeout(), Duration::from_secs(120));
        assert_eq!(settings.guard.notify_lock_timeout(), Duration::from_millis(50));
        assert_eq!(settings.heartbeat.interval(), Duration::from_secs(3_600));
    }
}
