//! Alarm data model.
//!
//! Defines [`AlarmId`], the [`FiringPolicy`] sum type with its
//! [`AlarmModifiers`], the persisted [`AlarmRecord`], and the
//! [`FireEvent`] delivered by the wake facility.

use crate::alarm::registry::HandlerToken;
use crate::error::{AlarmError, Result};
use serde::{Deserialize, Serialize};

/// Caller-supplied alarm identifier, shared by one-shot and periodic alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(pub i64);

impl std::fmt::Display for AlarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AlarmId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Flags that refine how the wake facility treats an alarm.
///
/// `allow_while_idle` and `alarm_clock` are only meaningful for one-shot
/// alarms; a periodic policy carrying either is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmModifiers {
    /// Fire at the exact requested time instead of letting the OS batch it.
    pub exact: bool,
    /// Wake the device if it is asleep. Advisory; passed through unchanged.
    pub wakeup: bool,
    /// Bypass idle/doze restrictions (one-shot only).
    pub allow_while_idle: bool,
    /// Use alarm-clock semantics (one-shot only).
    pub alarm_clock: bool,
    /// Re-arm the wake request after a device restart.
    pub reschedule_on_reboot: bool,
}

impl AlarmModifiers {
    #[must_use]
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    #[must_use]
    pub fn wakeup(mut self, wakeup: bool) -> Self {
        self.wakeup = wakeup;
        self
    }

    #[must_use]
    pub fn allow_while_idle(mut self, allow: bool) -> Self {
        self.allow_while_idle = allow;
        self
    }

    #[must_use]
    pub fn alarm_clock(mut self, alarm_clock: bool) -> Self {
        self.alarm_clock = alarm_clock;
        self
    }

    #[must_use]
    pub fn reschedule_on_reboot(mut self, reschedule: bool) -> Self {
        self.reschedule_on_reboot = reschedule;
        self
    }
}

/// When an alarm fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FiringPolicy {
    /// Fire exactly once.
    OneShot {
        /// Epoch milliseconds of the single firing.
        fire_at_millis: i64,
        #[serde(default)]
        modifiers: AlarmModifiers,
    },
    /// Fire repeatedly every `period_millis`.
    Periodic {
        /// Epoch milliseconds of the first firing.
        first_fire_at_millis: i64,
        /// Interval between firings; always positive.
        period_millis: i64,
        #[serde(default)]
        modifiers: AlarmModifiers,
    },
}

impl FiringPolicy {
    /// Modifiers attached to either variant.
    #[must_use]
    pub fn modifiers(&self) -> AlarmModifiers {
        match self {
            Self::OneShot { modifiers, .. } | Self::Periodic { modifiers, .. } => *modifiers,
        }
    }

    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::OneShot { .. })
    }

    #[must_use]
    pub fn reschedule_on_reboot(&self) -> bool {
        self.modifiers().reschedule_on_reboot
    }

    /// Epoch milliseconds of the next (or only) planned firing.
    #[must_use]
    pub fn first_fire_at_millis(&self) -> i64 {
        match self {
            Self::OneShot { fire_at_millis, .. } => *fire_at_millis,
            Self::Periodic {
                first_fire_at_millis,
                ..
            } => *first_fire_at_millis,
        }
    }

    /// Check the policy's structural invariants.
    ///
    /// # Errors
    ///
    /// [`AlarmError::InvalidPeriod`] for a non-positive period and
    /// [`AlarmError::InvalidModifierCombination`] for one-shot-only
    /// modifiers on a periodic policy.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::OneShot { .. } => Ok(()),
            Self::Periodic {
                period_millis,
                modifiers,
                ..
            } => {
                if *period_millis <= 0 {
                    return Err(AlarmError::InvalidPeriod(*period_millis));
                }
                if modifiers.allow_while_idle {
                    return Err(AlarmError::InvalidModifierCombination(
                        "allow_while_idle is only valid for one-shot alarms".to_owned(),
                    ));
                }
                if modifiers.alarm_clock {
                    return Err(AlarmError::InvalidModifierCombination(
                        "alarm_clock is only valid for one-shot alarms".to_owned(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for FiringPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneShot { fire_at_millis, .. } => {
                write!(f, "once at {}", format_epoch_millis(*fire_at_millis))
            }
            Self::Periodic {
                first_fire_at_millis,
                period_millis,
                ..
            } => write!(
                f,
                "every {}ms from {}",
                period_millis,
                format_epoch_millis(*first_fire_at_millis)
            ),
        }
    }
}

/// A primitive argument value stored with an alarm and handed to its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlarmArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for AlarmArg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AlarmArg {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AlarmArg {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AlarmArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for AlarmArg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// A persisted alarm definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub policy: FiringPolicy,
    pub handler: HandlerToken,
    #[serde(default)]
    pub args: Vec<AlarmArg>,
    /// Unique per scheduling call; guards one-shot cleanup against a
    /// reschedule that lands while the old firing is still running.
    pub revision: String,
    /// Boot epoch in which the wake request was last armed.
    #[serde(default)]
    pub armed_epoch: Option<u64>,
    /// Fire time of the last delivered firing of this revision.
    #[serde(default)]
    pub last_fired_at_millis: Option<i64>,
}

impl AlarmRecord {
    /// Create a record with a fresh revision.
    #[must_use]
    pub fn new(
        id: AlarmId,
        policy: FiringPolicy,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
    ) -> Self {
        Self {
            id,
            policy,
            handler,
            args,
            revision: uuid::Uuid::new_v4().to_string(),
            armed_epoch: None,
            last_fired_at_millis: None,
        }
    }
}

/// A fire notification from the wake facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireEvent {
    pub alarm_id: AlarmId,
    pub fired_at_millis: i64,
}

impl FireEvent {
    #[must_use]
    pub fn new(alarm_id: AlarmId, fired_at_millis: i64) -> Self {
        Self {
            alarm_id,
            fired_at_millis,
        }
    }

    /// Fire event stamped with the current time.
    #[must_use]
    pub fn now(alarm_id: AlarmId) -> Self {
        Self::new(alarm_id, now_epoch_millis())
    }
}

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn format_epoch_millis(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(at) => at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => format!("{millis}ms"),
    }
}
