//! Wake scheduler adapter.
//!
//! Translates a [`FiringPolicy`] into a [`WakeRequest`] for the host's
//! [`WakeFacility`], keeps at most one outstanding request per id, and
//! repairs drift between the alarm store and the facility.

use crate::alarm::store::AlarmStore;
use crate::alarm::types::{AlarmId, AlarmRecord, FireEvent, FiringPolicy, now_epoch_millis};
use crate::error::{AlarmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stripes in the per-id lock table.
const ID_LOCK_STRIPES: usize = 64;

/// How the facility should treat a wake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeStyle {
    /// Highest priority, always exact, ignores idle restrictions.
    AlarmClock,
    ExactAllowWhileIdle,
    Exact,
    /// May be batched by the OS for power saving.
    Inexact,
    ExactRepeating,
    InexactRepeating,
}

impl WakeStyle {
    #[must_use]
    pub fn is_repeating(self) -> bool {
        matches!(self, Self::ExactRepeating | Self::InexactRepeating)
    }
}

/// A single request handed to the wake facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRequest {
    pub style: WakeStyle,
    pub trigger_at_millis: i64,
    /// Set for repeating styles only.
    pub interval_millis: Option<i64>,
    /// Phase origin of a repeating wake. Fires after the first one land on
    /// `anchor + k * interval`, even when the first fire was a catch-up.
    #[serde(default)]
    pub anchor_at_millis: Option<i64>,
    /// Advisory: whether the device must be woken.
    pub wakeup: bool,
}

/// OS-level capability that wakes the process at a given time and emits a
/// fire event for an alarm id.
pub trait WakeFacility: Send + Sync {
    /// Arm a wake for `id`. Any earlier request for `id` has already been
    /// disarmed by the adapter.
    fn arm(&self, id: AlarmId, request: WakeRequest) -> Result<()>;

    /// Drop any outstanding request for `id`. No-op if none.
    fn disarm(&self, id: AlarmId) -> Result<()>;

    /// Ids with an outstanding wake request.
    fn armed_ids(&self) -> Result<Vec<AlarmId>>;
}

/// Choose the wake style for a policy.
///
/// # Errors
///
/// Returns [`AlarmError::InvalidModifierCombination`] or
/// [`AlarmError::InvalidPeriod`] when the policy is malformed.
pub fn select_style(policy: &FiringPolicy) -> Result<WakeStyle> {
    policy.validate()?;
    let modifiers = policy.modifiers();
    let style = match policy {
        FiringPolicy::OneShot { .. } => {
            if modifiers.alarm_clock {
                WakeStyle::AlarmClock
            } else if modifiers.allow_while_idle {
                WakeStyle::ExactAllowWhileIdle
            } else if modifiers.exact {
                WakeStyle::Exact
            } else {
                WakeStyle::Inexact
            }
        }
        FiringPolicy::Periodic { .. } => {
            if modifiers.exact {
                WakeStyle::ExactRepeating
            } else {
                WakeStyle::InexactRepeating
            }
        }
    };
    Ok(style)
}

/// Build the wake request for `policy` as seen at `now_ms`.
///
/// Periodic alarms keep the phase of their first fire time. If a period
/// boundary has passed since `last_fired_at_millis` (or ever, for an alarm
/// that never fired), the missed periods are coalesced into one immediate
/// fire; otherwise the wake is set for the next boundary. Elapsed periods
/// are never replayed.
pub fn build_request(
    policy: &FiringPolicy,
    now_ms: i64,
    last_fired_at_millis: Option<i64>,
) -> Result<WakeRequest> {
    let style = select_style(policy)?;
    let wakeup = policy.modifiers().wakeup;
    let request = match policy {
        FiringPolicy::OneShot { fire_at_millis, .. } => WakeRequest {
            style,
            trigger_at_millis: *fire_at_millis,
            interval_millis: None,
            anchor_at_millis: None,
            wakeup,
        },
        FiringPolicy::Periodic {
            first_fire_at_millis,
            period_millis,
            ..
        } => {
            let anchor = *first_fire_at_millis;
            let trigger_at_millis = if now_ms < anchor {
                anchor
            } else {
                let latest = latest_period_boundary(anchor, *period_millis, now_ms);
                if last_fired_at_millis.is_some_and(|at| at >= latest) {
                    latest.saturating_add(*period_millis)
                } else {
                    now_ms
                }
            };
            WakeRequest {
                style,
                trigger_at_millis,
                interval_millis: Some(*period_millis),
                anchor_at_millis: Some(anchor),
                wakeup,
            }
        }
    };
    Ok(request)
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records whose wake request was re-issued.
    pub rearmed: Vec<AlarmId>,
    /// Records armed before the last reboot without `reschedule_on_reboot`.
    pub dropped: Vec<AlarmId>,
    /// Records that could not be repaired this pass; they stay in the store.
    pub failed: Vec<AlarmId>,
}

/// Façade over a [`WakeFacility`].
#[derive(Clone)]
pub struct WakeScheduler {
    facility: Arc<dyn WakeFacility>,
    id_locks: Arc<[Mutex<()>]>,
}

impl WakeScheduler {
    pub fn new(facility: Arc<dyn WakeFacility>) -> Self {
        Self {
            facility,
            id_locks: (0..ID_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Serialize record writes and wake calls for `id`.
    ///
    /// Hold the guard across a store write and the matching wake call so
    /// the stored revision and the armed request never diverge. Ids share
    /// stripes, so never hold two guards at once.
    pub fn lock_id(&self, id: AlarmId) -> MutexGuard<'_, ()> {
        let stripes = self.id_locks.len() as u64;
        let index = usize::try_from(id.0.unsigned_abs() % stripes).unwrap_or(0);
        self.id_locks[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel any outstanding wake for `id`, then arm the new one.
    pub fn schedule(&self, id: AlarmId, policy: &FiringPolicy) -> Result<WakeRequest> {
        self.schedule_at(id, policy, now_epoch_millis())
    }

    /// [`schedule`](Self::schedule) with an explicit clock reading, for a
    /// policy that has never fired.
    pub fn schedule_at(
        &self,
        id: AlarmId,
        policy: &FiringPolicy,
        now_ms: i64,
    ) -> Result<WakeRequest> {
        self.arm_policy(id, policy, None, now_ms)
    }

    /// Re-arm a stored record, keeping its periodic phase and firing history.
    pub fn schedule_record_at(&self, record: &AlarmRecord, now_ms: i64) -> Result<WakeRequest> {
        self.arm_policy(record.id, &record.policy, record.last_fired_at_millis, now_ms)
    }

    fn arm_policy(
        &self,
        id: AlarmId,
        policy: &FiringPolicy,
        last_fired_at_millis: Option<i64>,
        now_ms: i64,
    ) -> Result<WakeRequest> {
        let request = build_request(policy, now_ms, last_fired_at_millis)?;
        self.facility.disarm(id).map_err(as_wake_failure)?;
        self.facility.arm(id, request).map_err(as_wake_failure)?;
        debug!(
            "armed {:?} wake for alarm {} at {}",
            request.style, id, request.trigger_at_millis
        );
        Ok(request)
    }

    pub fn cancel_wake(&self, id: AlarmId) -> Result<()> {
        self.facility.disarm(id).map_err(as_wake_failure)
    }

    /// Compare the store against outstanding wake requests and repair drift.
    ///
    /// - Records armed in an earlier boot epoch without
    ///   `reschedule_on_reboot` are removed.
    /// - Records armed in an earlier epoch with `reschedule_on_reboot`, or
    ///   with no outstanding wake, are re-armed and stamped with
    ///   `boot_epoch`.
    ///
    /// A record that cannot be repaired is listed in
    /// [`ReconcileReport::failed`] and the pass moves on.
    pub fn reconcile_at(
        &self,
        store: &dyn AlarmStore,
        boot_epoch: u64,
        now_ms: i64,
    ) -> Result<ReconcileReport> {
        let armed: HashSet<AlarmId> = self
            .facility
            .armed_ids()
            .map_err(as_wake_failure)?
            .into_iter()
            .collect();
        let mut report = ReconcileReport::default();

        for listed in store.list_all()? {
            let id = listed.id;
            let _guard = self.lock_id(id);
            // A different revision means a schedule call replaced and armed it.
            let record = match store.get(id) {
                Ok(Some(record)) if record.revision == listed.revision => record,
                Ok(_) => continue,
                Err(e) => {
                    warn!("reconcile could not reload alarm {id}: {e}");
                    report.failed.push(id);
                    continue;
                }
            };

            let stale_epoch = record.armed_epoch.is_some_and(|epoch| epoch < boot_epoch);
            if stale_epoch && !record.policy.reschedule_on_reboot() {
                match self.drop_record(store, &record, armed.contains(&id)) {
                    Ok(()) => report.dropped.push(id),
                    Err(e) => {
                        warn!("reconcile could not drop alarm {id}: {e}");
                        report.failed.push(id);
                    }
                }
                continue;
            }
            if !stale_epoch && armed.contains(&id) {
                continue;
            }

            let rearmed = self
                .schedule_record_at(&record, now_ms)
                .and_then(|_| store.mark_armed(id, boot_epoch));
            match rearmed {
                Ok(()) => report.rearmed.push(id),
                Err(e) => {
                    warn!("reconcile could not re-arm alarm {id}: {e}");
                    report.failed.push(id);
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                "reconcile re-armed {} alarm(s), dropped {}, failed {}",
                report.rearmed.len(),
                report.dropped.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    fn drop_record(&self, store: &dyn AlarmStore, record: &AlarmRecord, armed: bool) -> Result<()> {
        if armed {
            self.cancel_wake(record.id)?;
        }
        store.remove_revision(record.id, &record.revision)?;
        Ok(())
    }
}

fn as_wake_failure(e: AlarmError) -> AlarmError {
    match e {
        AlarmError::WakeRegistrationFailure(_) => e,
        other => AlarmError::WakeRegistrationFailure(other.to_string()),
    }
}

/// In-process wake facility driven by tokio timers.
///
/// Each armed id owns one task that sleeps until the trigger time and then
/// sends a [`FireEvent`]. Repeating wakes stay on the phase of their
/// anchor and skip periods that elapsed while the task was not scheduled.
pub struct TokioWakeFacility {
    fire_tx: mpsc::UnboundedSender<FireEvent>,
    runtime: tokio::runtime::Handle,
    timers: Mutex<HashMap<AlarmId, tokio::task::JoinHandle<()>>>,
}

impl TokioWakeFacility {
    /// Create a facility bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::WakeRegistrationFailure`] outside a runtime.
    pub fn new(fire_tx: mpsc::UnboundedSender<FireEvent>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AlarmError::WakeRegistrationFailure(format!("no tokio runtime for wake timers: {e}"))
        })?;
        Ok(Self {
            fire_tx,
            runtime,
            timers: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<AlarmId, tokio::task::JoinHandle<()>>>> {
        self.timers.lock().map_err(|e| {
            AlarmError::WakeRegistrationFailure(format!("wake timer lock poisoned: {e}"))
        })
    }
}

impl WakeFacility for TokioWakeFacility {
    fn arm(&self, id: AlarmId, request: WakeRequest) -> Result<()> {
        let fire_tx = self.fire_tx.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay_until(request.trigger_at_millis)).await;
            if fire_tx.send(FireEvent::now(id)).is_err() {
                return;
            }
            let Some(interval) = request.interval_millis.filter(|ms| *ms > 0) else {
                return;
            };
            let anchor = request.anchor_at_millis.unwrap_or(request.trigger_at_millis);
            loop {
                let next = next_period_boundary(anchor, interval, now_epoch_millis());
                tokio::time::sleep(delay_until(next)).await;
                if fire_tx.send(FireEvent::now(id)).is_err() {
                    debug!("fire channel closed; stopping repeating wake for alarm {id}");
                    return;
                }
            }
        });

        if let Some(previous) = self.lock()?.insert(id, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn disarm(&self, id: AlarmId) -> Result<()> {
        if let Some(handle) = self.lock()?.remove(&id) {
            handle.abort();
        }
        Ok(())
    }

    fn armed_ids(&self) -> Result<Vec<AlarmId>> {
        let mut timers = self.lock()?;
        timers.retain(|_, handle| !handle.is_finished());
        let mut ids: Vec<AlarmId> = timers.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

impl Drop for TokioWakeFacility {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }
}

/// Last `anchor + k * interval` at or before `now_ms`. Requires
/// `now_ms >= anchor_ms` and a positive interval.
fn latest_period_boundary(anchor_ms: i64, interval_ms: i64, now_ms: i64) -> i64 {
    let elapsed_periods = now_ms.saturating_sub(anchor_ms) / interval_ms;
    anchor_ms.saturating_add(elapsed_periods.saturating_mul(interval_ms))
}

/// First `anchor + k * interval` strictly after `now_ms`.
fn next_period_boundary(anchor_ms: i64, interval_ms: i64, now_ms: i64) -> i64 {
    if now_ms < anchor_ms {
        return anchor_ms;
    }
    latest_period_boundary(anchor_ms, interval_ms, now_ms).saturating_add(interval_ms)
}

fn delay_until(at_ms: i64) -> Duration {
    let remaining = at_ms.saturating_sub(now_epoch_millis());
    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}
