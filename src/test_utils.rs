//! Shared test utilities used across multiple test modules.

use crate::alarm::registry::HandlerToken;
use crate::alarm::store::{AlarmStore, MemoryAlarmStore};
use crate::alarm::types::{AlarmId, AlarmRecord};
use crate::alarm::wake::{WakeFacility, WakeRequest};
use crate::error::{AlarmError, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Wake facility that records every call instead of arming timers.
#[derive(Default)]
pub struct RecordingWakeFacility {
    calls: Mutex<Vec<String>>,
    armed: Mutex<BTreeMap<AlarmId, WakeRequest>>,
    fail_next_arm: AtomicBool,
    fail_next_disarm: AtomicBool,
}

impl RecordingWakeFacility {
    /// Call log, e.g. `["disarm 5", "arm 5"]`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock calls").clone()
    }

    /// Currently armed request for `id`.
    pub fn request_for(&self, id: AlarmId) -> Option<WakeRequest> {
        self.armed.lock().expect("lock armed").get(&id).copied()
    }

    /// Make the next `arm` call fail with a registration error.
    pub fn fail_next_arm(&self) {
        self.fail_next_arm.store(true, Ordering::SeqCst);
    }

    /// Make the next `disarm` call fail with a registration error.
    pub fn fail_next_disarm(&self) {
        self.fail_next_disarm.store(true, Ordering::SeqCst);
    }
}

impl WakeFacility for RecordingWakeFacility {
    fn arm(&self, id: AlarmId, request: WakeRequest) -> Result<()> {
        self.calls.lock().expect("lock calls").push(format!("arm {id}"));
        if self.fail_next_arm.swap(false, Ordering::SeqCst) {
            return Err(AlarmError::WakeRegistrationFailure(
                "facility out of alarm slots".to_owned(),
            ));
        }
        self.armed.lock().expect("lock armed").insert(id, request);
        Ok(())
    }

    fn disarm(&self, id: AlarmId) -> Result<()> {
        self.calls
            .lock()
            .expect("lock calls")
            .push(format!("disarm {id}"));
        if self.fail_next_disarm.swap(false, Ordering::SeqCst) {
            return Err(AlarmError::WakeRegistrationFailure(
                "facility unreachable".to_owned(),
            ));
        }
        self.armed.lock().expect("lock armed").remove(&id);
        Ok(())
    }

    fn armed_ids(&self) -> Result<Vec<AlarmId>> {
        Ok(self.armed.lock().expect("lock armed").keys().copied().collect())
    }
}

/// In-memory store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryAlarmStore,
    pub fail_puts: AtomicBool,
    pub fail_mark_armed: AtomicBool,
}

impl AlarmStore for FlakyStore {
    fn put(&self, record: &AlarmRecord) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(AlarmError::PersistenceFailure("disk full".to_owned()));
        }
        self.inner.put(record)
    }
    fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
        self.inner.get(id)
    }
    fn remove(&self, id: AlarmId) -> Result<()> {
        self.inner.remove(id)
    }
    fn remove_revision(&self, id: AlarmId, revision: &str) -> Result<bool> {
        self.inner.remove_revision(id, revision)
    }
    fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        self.inner.list_all()
    }
    fn mark_armed(&self, id: AlarmId, epoch: u64) -> Result<()> {
        if self.fail_mark_armed.swap(false, Ordering::SeqCst) {
            return Err(AlarmError::PersistenceFailure("database is locked".to_owned()));
        }
        self.inner.mark_armed(id, epoch)
    }
    fn mark_fired(&self, id: AlarmId, revision: &str, fired_at_millis: i64) -> Result<bool> {
        self.inner.mark_fired(id, revision, fired_at_millis)
    }
    fn bootstrap_token(&self) -> Result<Option<HandlerToken>> {
        self.inner.bootstrap_token()
    }
    fn set_bootstrap_token(&self, token: HandlerToken) -> Result<()> {
        self.inner.set_bootstrap_token(token)
    }
    fn boot_epoch(&self) -> Result<u64> {
        self.inner.boot_epoch()
    }
    fn set_boot_epoch(&self, epoch: u64) -> Result<()> {
        self.inner.set_boot_epoch(epoch)
    }
}
