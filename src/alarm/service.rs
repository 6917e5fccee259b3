//! Public alarm operations.
//!
//! [`AlarmService`] composes the store, the wake scheduler and the
//! bootstrap table. Boolean operations log failures and return `false`;
//! every one of them has a `try_` twin returning [`Result`] and an `_at`
//! twin taking an explicit clock reading.

use crate::alarm::registry::{BootstrapTable, HandlerToken};
use crate::alarm::store::AlarmStore;
use crate::alarm::types::{
    AlarmArg, AlarmId, AlarmModifiers, AlarmRecord, FiringPolicy, now_epoch_millis,
};
use crate::alarm::wake::{ReconcileReport, WakeScheduler};
use crate::error::{AlarmError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub struct AlarmService {
    store: Arc<dyn AlarmStore>,
    wake: WakeScheduler,
    bootstrap: BootstrapTable,
    initialized: AtomicBool,
}

impl AlarmService {
    /// Create the service.
    ///
    /// A bootstrap token persisted by an earlier `initialize` that still
    /// belongs to this build marks the service initialised straight away.
    pub fn new(store: Arc<dyn AlarmStore>, wake: WakeScheduler, bootstrap: BootstrapTable) -> Self {
        let restored = match store.bootstrap_token() {
            Ok(Some(token)) => bootstrap.contains(&token),
            Ok(None) => false,
            Err(e) => {
                warn!("cannot read persisted bootstrap token: {e}");
                false
            }
        };
        if restored {
            info!("alarm service restored from persisted bootstrap token");
        }
        Self {
            store,
            wake,
            bootstrap,
            initialized: AtomicBool::new(restored),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bootstrap(&self) -> &BootstrapTable {
        &self.bootstrap
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.store
    }

    pub fn initialize(&self, bootstrap_token: HandlerToken) -> bool {
        report("initialize", self.try_initialize(bootstrap_token))
    }

    /// Persist the bootstrap reference used to build handlers on cold start.
    ///
    /// # Errors
    ///
    /// [`AlarmError::UnresolvableHandler`] if the token is not in this
    /// build's bootstrap table, or a persistence failure.
    pub fn try_initialize(&self, bootstrap_token: HandlerToken) -> Result<()> {
        if !self.bootstrap.contains(&bootstrap_token) {
            return Err(AlarmError::UnresolvableHandler(format!(
                "bootstrap token {bootstrap_token} is not part of build '{}'",
                self.bootstrap.build_id()
            )));
        }
        self.store.set_bootstrap_token(bootstrap_token)?;
        self.initialized.store(true, Ordering::Release);
        info!("alarm service initialised with bootstrap {bootstrap_token}");
        Ok(())
    }

    pub fn one_shot(
        &self,
        delay: Duration,
        id: AlarmId,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> bool {
        self.one_shot_at(now_epoch_millis(), delay, id, handler, args, modifiers)
    }

    pub fn one_shot_at(
        &self,
        now_ms: i64,
        delay: Duration,
        id: AlarmId,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> bool {
        report(
            "one_shot",
            self.try_one_shot_at(now_ms, delay, id, handler, args, modifiers),
        )
    }

    /// Schedule `handler` to fire once, `delay` after `now_ms`.
    pub fn try_one_shot_at(
        &self,
        now_ms: i64,
        delay: Duration,
        id: AlarmId,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> Result<()> {
        let policy = FiringPolicy::OneShot {
            fire_at_millis: now_ms.saturating_add(duration_millis(delay)),
            modifiers,
        };
        self.try_schedule_at(now_ms, id, policy, handler, args)
    }

    pub fn periodic(
        &self,
        period: Duration,
        id: AlarmId,
        start_at_millis: Option<i64>,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> bool {
        self.periodic_at(
            now_epoch_millis(),
            period,
            id,
            start_at_millis,
            handler,
            args,
            modifiers,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn periodic_at(
        &self,
        now_ms: i64,
        period: Duration,
        id: AlarmId,
        start_at_millis: Option<i64>,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> bool {
        report(
            "periodic",
            self.try_periodic_at(now_ms, period, id, start_at_millis, handler, args, modifiers),
        )
    }

    /// Schedule `handler` to fire every `period`, first at `start_at_millis`
    /// or one period from now.
    #[allow(clippy::too_many_arguments)]
    pub fn try_periodic_at(
        &self,
        now_ms: i64,
        period: Duration,
        id: AlarmId,
        start_at_millis: Option<i64>,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
        modifiers: AlarmModifiers,
    ) -> Result<()> {
        let period_millis = duration_millis(period);
        let policy = FiringPolicy::Periodic {
            first_fire_at_millis: start_at_millis
                .unwrap_or_else(|| now_ms.saturating_add(period_millis)),
            period_millis,
            modifiers,
        };
        self.try_schedule_at(now_ms, id, policy, handler, args)
    }

    /// Schedule an already-built policy, replacing any alarm with the same id.
    pub fn schedule(
        &self,
        id: AlarmId,
        policy: FiringPolicy,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
    ) -> bool {
        report(
            "schedule",
            self.try_schedule_at(now_epoch_millis(), id, policy, handler, args),
        )
    }

    /// Validate, persist, then arm.
    ///
    /// A rejected policy never reaches the store. A failed put never
    /// reaches the wake facility. A failed arm leaves the durable record
    /// for reconciliation to repair. Concurrent calls for the same id are
    /// serialized, so the last writer's record is also the armed one.
    pub fn try_schedule_at(
        &self,
        now_ms: i64,
        id: AlarmId,
        policy: FiringPolicy,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
    ) -> Result<()> {
        if !self.is_initialized() {
            return Err(AlarmError::UninitializedService);
        }
        policy.validate()?;

        let mut record = AlarmRecord::new(id, policy, handler, args);
        record.armed_epoch = Some(self.store.boot_epoch()?);

        let _guard = self.wake.lock_id(id);
        self.store.put(&record)?;

        let request = self.wake.schedule_at(id, &policy, now_ms)?;
        info!(
            "scheduled alarm {id} ({policy}) as {:?}, revision {}",
            request.style, record.revision
        );
        Ok(())
    }

    pub fn cancel(&self, id: AlarmId) -> bool {
        report("cancel", self.try_cancel(id))
    }

    /// Disarm and forget `id`. Cancelling an unknown id succeeds.
    pub fn try_cancel(&self, id: AlarmId) -> Result<()> {
        let _guard = self.wake.lock_id(id);
        self.wake.cancel_wake(id)?;
        self.store.remove(id)?;
        info!("cancelled alarm {id}");
        Ok(())
    }

    /// Stored record for `id`, if any.
    pub fn alarm(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
        self.store.get(id)
    }

    /// Recover after a device restart identified by `boot_epoch`.
    pub fn reboot_recovery(&self, boot_epoch: u64) -> Result<ReconcileReport> {
        self.reboot_recovery_at(boot_epoch, now_epoch_millis())
    }

    pub fn reboot_recovery_at(&self, boot_epoch: u64, now_ms: i64) -> Result<ReconcileReport> {
        let previous = self.store.boot_epoch()?;
        self.store.set_boot_epoch(boot_epoch)?;
        let report = self
            .wake
            .reconcile_at(self.store.as_ref(), boot_epoch, now_ms)?;
        info!(
            "reboot recovery {previous} -> {boot_epoch}: re-armed {}, dropped {}, failed {}",
            report.rearmed.len(),
            report.dropped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Re-arm stored alarms that have no outstanding wake.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let epoch = self.store.boot_epoch()?;
        self.wake
            .reconcile_at(self.store.as_ref(), epoch, now_epoch_millis())
    }
}

fn report(operation: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("alarm {operation} failed: {e}");
            false
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
