//! Dispatch context manager.
//!
//! Owns the single background dispatch context. The context is started
//! lazily by the first fire event after a cold start:
//!
//! ```text
//!   Cold ──first fire──► Starting ──registry built──► Ready
//!    ▲                      │
//!    └──bootstrap failed────┘   (queued events are kept for the retry)
//! ```
//!
//! While `Starting`, fire events are buffered in arrival order. Once
//! `Ready`, events are routed to per-alarm lanes: each lane is an ordered
//! queue drained by one worker, so firings of the same id never overlap,
//! while different ids run concurrently up to `max_concurrent_handlers`.

use crate::alarm::registry::{AlarmInvocation, BootstrapTable, HandlerRegistry};
use crate::alarm::store::AlarmStore;
use crate::alarm::types::{AlarmId, FireEvent, now_epoch_millis};
use crate::alarm::wake::WakeScheduler;
use crate::config::DispatchConfig;
use crate::error::{AlarmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

/// Observable lifecycle phase of the dispatch context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Cold,
    Starting,
    Ready,
}

/// What happened to one fire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The handler ran to completion.
    Delivered,
    /// No record for the id, or the event predates the stored alarm's due
    /// time; a duplicate, cancelled or replaced alarm.
    Stale,
    /// The handler token could not be resolved; the record was kept.
    Unresolvable { reason: String },
    /// The handler panicked.
    HandlerPanicked,
    /// The record could not be read.
    StoreError { reason: String },
}

/// Result of delivering one fire event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub alarm_id: AlarmId,
    pub fired_at_millis: i64,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

enum DispatchState {
    Cold { pending: VecDeque<FireEvent> },
    Starting { ready_queue: VecDeque<FireEvent> },
    Ready { registry: Arc<HandlerRegistry> },
}

struct Delivery {
    event: FireEvent,
    registry: Arc<HandlerRegistry>,
}

type Lanes = HashMap<AlarmId, mpsc::UnboundedSender<Delivery>>;

/// How far before its due time a fire event may be stamped and still count.
const EARLY_FIRE_TOLERANCE_MILLIS: i64 = 100;

/// Process-wide owner of the dispatch context.
///
/// Share it as `Arc<DispatchContextManager>`; [`submit`](Self::submit)
/// must be called from within a tokio runtime.
pub struct DispatchContextManager {
    store: Arc<dyn AlarmStore>,
    bootstrap: BootstrapTable,
    wake: Option<WakeScheduler>,
    outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
    permits: Arc<Semaphore>,
    lane_idle: Duration,
    max_pending: usize,
    state: Mutex<DispatchState>,
    lanes: Mutex<Lanes>,
}

impl DispatchContextManager {
    /// Create a cold dispatch context.
    pub fn new(store: Arc<dyn AlarmStore>, bootstrap: BootstrapTable) -> Self {
        let defaults = DispatchConfig::default();
        Self {
            store,
            bootstrap,
            wake: None,
            outcome_tx: None,
            permits: Arc::new(Semaphore::new(defaults.max_concurrent_handlers.max(1))),
            lane_idle: Duration::from_secs(defaults.lane_idle_secs),
            max_pending: defaults.max_pending_fires,
            state: Mutex::new(DispatchState::Cold {
                pending: VecDeque::new(),
            }),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Apply concurrency limits from configuration.
    pub fn with_config(mut self, config: &DispatchConfig) -> Self {
        self.permits = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        self.lane_idle = Duration::from_secs(config.lane_idle_secs);
        self.max_pending = config.max_pending_fires;
        self
    }

    /// Run a reconciliation pass through `wake` once the context is ready.
    pub fn with_wake_scheduler(mut self, wake: WakeScheduler) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Report every delivery outcome on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.outcome_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn phase(&self) -> DispatchPhase {
        match &*self.lock_state() {
            DispatchState::Cold { .. } => DispatchPhase::Cold,
            DispatchState::Starting { .. } => DispatchPhase::Starting,
            DispatchState::Ready { .. } => DispatchPhase::Ready,
        }
    }

    /// Accept a fire event from the wake facility.
    ///
    /// Never blocks on handler execution. The first event after a cold
    /// start kicks off context initialization.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::Channel`] when called outside a tokio runtime.
    pub fn submit(self: &Arc<Self>, event: FireEvent) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AlarmError::Channel(format!("dispatch needs a tokio runtime: {e}")))?;

        let mut state = self.lock_state();
        match &mut *state {
            DispatchState::Ready { registry } => {
                let registry = Arc::clone(registry);
                self.enqueue(&runtime, event, registry);
            }
            DispatchState::Starting { ready_queue } => {
                debug!("dispatch context starting; buffering fire for alarm {}", event.alarm_id);
                ready_queue.push_back(event);
            }
            DispatchState::Cold { pending } => {
                let mut ready_queue = std::mem::take(pending);
                ready_queue.push_back(event);
                info!("cold start of dispatch context (alarm {})", event.alarm_id);
                self.begin_start(&runtime, &mut state, ready_queue);
            }
        }
        Ok(())
    }

    /// Retry a failed start for the fire events it left behind.
    ///
    /// Call after the bootstrap token changes. Returns `true` if a start
    /// was kicked off; a context that is not cold or holds no events is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::Channel`] when a start is needed outside a
    /// tokio runtime.
    pub fn resume(self: &Arc<Self>) -> Result<bool> {
        let mut state = self.lock_state();
        let DispatchState::Cold { pending } = &mut *state else {
            return Ok(false);
        };
        if pending.is_empty() {
            return Ok(false);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AlarmError::Channel(format!("dispatch needs a tokio runtime: {e}")))?;
        let ready_queue = std::mem::take(pending);
        info!("retrying dispatch start for {} held fire(s)", ready_queue.len());
        self.begin_start(&runtime, &mut state, ready_queue);
        Ok(true)
    }

    fn begin_start(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        state: &mut DispatchState,
        ready_queue: VecDeque<FireEvent>,
    ) {
        *state = DispatchState::Starting { ready_queue };
        let this = Arc::clone(self);
        let start_runtime = runtime.clone();
        runtime.spawn_blocking(move || this.finish_start(&start_runtime));
    }

    /// Feed fire events from a wake facility into [`submit`](Self::submit)
    /// until the sender side closes.
    pub async fn run_fire_pump(self: Arc<Self>, mut fire_rx: mpsc::UnboundedReceiver<FireEvent>) {
        while let Some(event) = fire_rx.recv().await {
            if let Err(e) = self.submit(event) {
                error!("cannot dispatch fire for alarm {}: {e}", event.alarm_id);
            }
        }
        debug!("fire channel closed; pump stopped");
    }

    /// Build the handler registry from the persisted bootstrap token.
    fn build_registry(&self) -> Result<HandlerRegistry> {
        let token = self
            .store
            .bootstrap_token()?
            .ok_or(AlarmError::UninitializedService)?;
        self.bootstrap.build_registry(&token)
    }

    fn finish_start(self: Arc<Self>, runtime: &tokio::runtime::Handle) {
        let built = self.build_registry();

        {
            let mut state = self.lock_state();
            let queued = match &mut *state {
                DispatchState::Starting { ready_queue } => std::mem::take(ready_queue),
                _ => VecDeque::new(),
            };

            match built {
                Ok(registry) => {
                    let registry = Arc::new(registry);
                    *state = DispatchState::Ready {
                        registry: Arc::clone(&registry),
                    };
                    info!(
                        "dispatch context ready with {} handler(s); draining {} buffered fire(s)",
                        registry.len(),
                        queued.len()
                    );
                    // Still under the state lock so later submits queue behind these.
                    for event in queued {
                        self.enqueue(runtime, event, Arc::clone(&registry));
                    }
                }
                Err(e) => {
                    let mut pending = queued;
                    if pending.len() > self.max_pending {
                        let excess = pending.len() - self.max_pending;
                        pending.drain(..excess);
                        warn!("dropped {excess} oldest held fire(s) over the pending limit");
                    }
                    warn!(
                        "dispatch context failed to start, {} fire(s) held for retry: {e}",
                        pending.len()
                    );
                    *state = DispatchState::Cold { pending };
                    return;
                }
            }
        }

        self.reconcile_after_start();
    }

    fn reconcile_after_start(&self) {
        let Some(wake) = &self.wake else {
            return;
        };
        let epoch = match self.store.boot_epoch() {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("skipping post-start reconcile: {e}");
                return;
            }
        };
        if let Err(e) = wake.reconcile_at(self.store.as_ref(), epoch, now_epoch_millis()) {
            warn!("post-start reconcile failed: {e}");
        }
    }

    /// Route one event to its alarm's lane, creating the lane if needed.
    fn enqueue(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        event: FireEvent,
        registry: Arc<HandlerRegistry>,
    ) {
        let id = event.alarm_id;
        let mut lanes = self.lock_lanes();
        let mut delivery = Delivery { event, registry };

        if let Some(tx) = lanes.get(&id) {
            match tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    debug!("lane for alarm {id} closed; opening a new one");
                    delivery = returned;
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(delivery).is_err() {
            error!("fresh lane for alarm {id} rejected its first fire");
            return;
        }
        lanes.insert(id, tx);
        drop(lanes);

        let this = Arc::clone(self);
        runtime.spawn(async move { this.run_lane(id, rx).await });
    }

    async fn run_lane(self: Arc<Self>, id: AlarmId, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        loop {
            let delivery = match tokio::time::timeout(self.lane_idle, rx.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return,
                Err(_) => match self.retire_lane_or_take(id, &mut rx) {
                    Some(delivery) => delivery,
                    None => {
                        debug!("retired idle lane for alarm {id}");
                        return;
                    }
                },
            };

            let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                warn!("handler permits closed; stopping lane for alarm {id}");
                return;
            };
            let outcome = self.deliver(delivery).await;
            if let Some(tx) = &self.outcome_tx {
                let _ = tx.send(outcome);
            }
        }
    }

    /// Remove an idle lane unless an event raced in. Runs under the lane
    /// map lock, which `enqueue` also holds while sending.
    fn retire_lane_or_take(
        &self,
        id: AlarmId,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> Option<Delivery> {
        let mut lanes = self.lock_lanes();
        match rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(_) => {
                lanes.remove(&id);
                None
            }
        }
    }

    async fn deliver(&self, delivery: Delivery) -> DispatchOutcome {
        let FireEvent {
            alarm_id,
            fired_at_millis,
        } = delivery.event;
        let outcome = |status| DispatchOutcome {
            alarm_id,
            fired_at_millis,
            status,
        };

        let record = match self.store.get(alarm_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("dropping stale fire for alarm {alarm_id}: no stored record");
                return outcome(DeliveryStatus::Stale);
            }
            Err(e) => {
                error!("cannot load alarm {alarm_id} for dispatch: {e}");
                return outcome(DeliveryStatus::StoreError {
                    reason: e.to_string(),
                });
            }
        };

        let due_at = record.policy.first_fire_at_millis();
        if fired_at_millis < due_at.saturating_sub(EARLY_FIRE_TOLERANCE_MILLIS) {
            info!(
                "dropping stale fire for alarm {alarm_id}: stamped {fired_at_millis}, \
                 revision {} is due at {due_at}",
                record.revision
            );
            return outcome(DeliveryStatus::Stale);
        }

        let handler = match delivery.registry.resolve(&record.handler) {
            Ok(handler) => handler,
            Err(e) => {
                warn!("dropping fire for alarm {alarm_id}, record kept: {e}");
                return outcome(DeliveryStatus::Unresolvable {
                    reason: e.to_string(),
                });
            }
        };

        let invocation = AlarmInvocation {
            alarm_id,
            fired_at_millis,
            args: record.args.clone(),
        };
        let joined = tokio::spawn(async move { handler.on_alarm(invocation).await }).await;

        if record.policy.is_one_shot() {
            match self.store.remove_revision(alarm_id, &record.revision) {
                Ok(true) => debug!("one-shot alarm {alarm_id} completed and removed"),
                Ok(false) => debug!("alarm {alarm_id} was rescheduled while firing; keeping it"),
                Err(e) => error!("cannot remove fired one-shot alarm {alarm_id}: {e}"),
            }
        } else if let Err(e) = self
            .store
            .mark_fired(alarm_id, &record.revision, fired_at_millis)
        {
            error!("cannot record firing of periodic alarm {alarm_id}: {e}");
        }

        match joined {
            Ok(()) => outcome(DeliveryStatus::Delivered),
            Err(e) => {
                error!("handler for alarm {alarm_id} panicked: {e}");
                outcome(DeliveryStatus::HandlerPanicked)
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::alarm::registry::{HandlerRegistryBuilder, HandlerToken, handler_fn};
    use crate::alarm::store::MemoryAlarmStore;
    use crate::alarm::types::{AlarmArg, AlarmModifiers, AlarmRecord, FiringPolicy};
    use crate::test_utils::RecordingWakeFacility;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BUILD: &str = "dispatch-test";

    static LOG: Mutex<Vec<(i64, Vec<AlarmArg>)>> = Mutex::new(Vec::new());
    static RUNNING: AtomicUsize = AtomicUsize::new(0);
    static MAX_RUNNING: AtomicUsize = AtomicUsize::new(0);
    static GATED_RUNNING: AtomicUsize = AtomicUsize::new(0);
    static GATED_MAX: AtomicUsize = AtomicUsize::new(0);

    fn bootstrap(builder: &mut HandlerRegistryBuilder) -> Result<()> {
        builder.register(
            "record",
            handler_fn(|inv| async move {
                LOG.lock()
                    .unwrap()
                    .push((inv.alarm_id.0, inv.args.clone()));
            }),
        )?;
        builder.register(
            "slow",
            handler_fn(|inv| async move {
                let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                MAX_RUNNING.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                LOG.lock()
                    .unwrap()
                    .push((inv.alarm_id.0, inv.args.clone()));
                RUNNING.fetch_sub(1, Ordering::SeqCst);
            }),
        )?;
        builder.register(
            "gated",
            handler_fn(|_inv| async move {
                let now = GATED_RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                GATED_MAX.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                GATED_RUNNING.fetch_sub(1, Ordering::SeqCst);
            }),
        )?;
        builder.register(
            "panics",
            handler_fn(|inv| async move {
                assert!(inv.alarm_id.0 < 0, "handler blew up");
            }),
        )?;
        Ok(())
    }

    struct Harness {
        store: Arc<MemoryAlarmStore>,
        manager: Arc<DispatchContextManager>,
        outcomes: mpsc::UnboundedReceiver<DispatchOutcome>,
    }

    fn harness(initialize: bool) -> Harness {
        harness_with(
            initialize,
            DispatchConfig {
                max_concurrent_handlers: 8,
                lane_idle_secs: 1,
                max_pending_fires: 64,
            },
        )
    }

    fn harness_with(initialize: bool, config: DispatchConfig) -> Harness {
        let store = Arc::new(MemoryAlarmStore::new());
        let mut table = BootstrapTable::new(BUILD);
        let boot = table.register("main", bootstrap).unwrap();
        if initialize {
            store.set_bootstrap_token(boot).unwrap();
        }
        let (tx, outcomes) = mpsc::unbounded_channel();
        let manager = Arc::new(
            DispatchContextManager::new(store.clone(), table)
                .with_config(&config)
                .with_outcomes(tx),
        );
        Harness {
            store,
            manager,
            outcomes,
        }
    }

    fn put(store: &MemoryAlarmStore, id: i64, handler: &str, policy: FiringPolicy) -> AlarmRecord {
        let record = AlarmRecord::new(
            AlarmId(id),
            policy,
            HandlerToken::derive(BUILD, handler),
            vec![AlarmArg::Int(id * 10), AlarmArg::Str(format!("alarm-{id}"))],
        );
        store.put(&record).unwrap();
        record
    }

    fn one_shot() -> FiringPolicy {
        FiringPolicy::OneShot {
            fire_at_millis: 0,
            modifiers: AlarmModifiers::default(),
        }
    }

    fn periodic() -> FiringPolicy {
        FiringPolicy::Periodic {
            first_fire_at_millis: 0,
            period_millis: 1_000,
            modifiers: AlarmModifiers::default(),
        }
    }

    async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<DispatchOutcome>) -> DispatchOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outcome within timeout")
            .expect("outcome channel open")
    }

    fn log_for(id: i64) -> Vec<Vec<AlarmArg>> {
        LOG.lock()
            .unwrap()
            .iter()
            .filter(|(logged, _)| *logged == id)
            .map(|(_, args)| args.clone())
            .collect()
    }

    #[tokio::test]
    async fn one_shot_fires_once_and_is_removed() {
        let mut h = harness(true);
        put(&h.store, 101, "record", one_shot());
        assert_eq!(h.manager.phase(), DispatchPhase::Cold);

        h.manager.submit(FireEvent::new(AlarmId(101), 1_005)).unwrap();
        let outcome = next_outcome(&mut h.outcomes).await;

        assert_eq!(outcome.status, DeliveryStatus::Delivered);
        assert_eq!(outcome.fired_at_millis, 1_005);
        assert_eq!(h.manager.phase(), DispatchPhase::Ready);
        assert_eq!(
            log_for(101),
            vec![vec![AlarmArg::Int(1010), AlarmArg::Str("alarm-101".to_owned())]]
        );
        assert!(h.store.get(AlarmId(101)).unwrap().is_none());

        // At-least-once redelivery is a no-op.
        h.manager.submit(FireEvent::new(AlarmId(101), 1_006)).unwrap();
        assert_eq!(next_outcome(&mut h.outcomes).await.status, DeliveryStatus::Stale);
        assert_eq!(log_for(101).len(), 1);
    }

    #[tokio::test]
    async fn periodic_record_survives_firings() {
        let mut h = harness(true);
        put(&h.store, 102, "record", periodic());

        for at in 0..3 {
            h.manager.submit(FireEvent::new(AlarmId(102), at)).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(
                next_outcome(&mut h.outcomes).await.status,
                DeliveryStatus::Delivered
            );
        }
        assert_eq!(log_for(102).len(), 3);
        assert!(h.store.get(AlarmId(102)).unwrap().is_some());
    }

    #[tokio::test]
    async fn same_id_firings_are_serialized_in_order() {
        let mut h = harness(true);
        put(&h.store, 103, "slow", periodic());

        for at in [1, 2, 3] {
            h.manager.submit(FireEvent::new(AlarmId(103), at)).unwrap();
        }
        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(next_outcome(&mut h.outcomes).await.fired_at_millis);
        }

        assert_eq!(fired, vec![1, 2, 3]);
        let args = log_for(103);
        assert_eq!(args.len(), 3);
        assert!(args.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn cold_start_buffers_without_dropping_or_reordering() {
        let mut h = harness(true);
        put(&h.store, 104, "record", periodic());
        put(&h.store, 105, "record", periodic());

        // Submitted back to back, before the blocking start task can finish.
        for at in [10, 11, 12, 13] {
            h.manager.submit(FireEvent::new(AlarmId(104), at)).unwrap();
        }
        h.manager.submit(FireEvent::new(AlarmId(105), 20)).unwrap();

        let mut per_id: HashMap<i64, Vec<i64>> = HashMap::new();
        for _ in 0..5 {
            let outcome = next_outcome(&mut h.outcomes).await;
            assert_eq!(outcome.status, DeliveryStatus::Delivered);
            per_id
                .entry(outcome.alarm_id.0)
                .or_default()
                .push(outcome.fired_at_millis);
        }
        assert_eq!(per_id[&104], vec![10, 11, 12, 13]);
        assert_eq!(per_id[&105], vec![20]);
    }

    #[tokio::test]
    async fn unresolvable_handler_keeps_record() {
        let mut h = harness(true);
        let record = AlarmRecord::new(
            AlarmId(106),
            one_shot(),
            HandlerToken::derive("some-older-build", "record"),
            Vec::new(),
        );
        h.store.put(&record).unwrap();

        h.manager.submit(FireEvent::new(AlarmId(106), 0)).unwrap();
        let outcome = next_outcome(&mut h.outcomes).await;

        assert!(matches!(outcome.status, DeliveryStatus::Unresolvable { .. }));
        assert_eq!(h.store.get(AlarmId(106)).unwrap(), Some(record));
    }

    #[tokio::test]
    async fn handler_panic_does_not_poison_the_lane() {
        let mut h = harness(true);
        put(&h.store, 107, "panics", periodic());

        h.manager.submit(FireEvent::new(AlarmId(107), 0)).unwrap();
        assert_eq!(
            next_outcome(&mut h.outcomes).await.status,
            DeliveryStatus::HandlerPanicked
        );
        h.manager.submit(FireEvent::new(AlarmId(107), 1)).unwrap();
        assert_eq!(
            next_outcome(&mut h.outcomes).await.status,
            DeliveryStatus::HandlerPanicked
        );
    }

    #[tokio::test]
    async fn failed_start_holds_events_until_retry() {
        let mut h = harness(false);
        put(&h.store, 108, "record", periodic());

        h.manager.submit(FireEvent::new(AlarmId(108), 1)).unwrap();
        for _ in 0..100 {
            if h.manager.phase() == DispatchPhase::Cold {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.manager.phase(), DispatchPhase::Cold);
        assert!(h.outcomes.try_recv().is_err());

        let boot = BootstrapTable::new(BUILD).token_for("main");
        h.store.set_bootstrap_token(boot).unwrap();
        h.manager.submit(FireEvent::new(AlarmId(108), 2)).unwrap();

        assert_eq!(next_outcome(&mut h.outcomes).await.fired_at_millis, 1);
        assert_eq!(next_outcome(&mut h.outcomes).await.fired_at_millis, 2);
    }

    #[tokio::test]
    async fn different_ids_run_concurrently() {
        let mut h = harness(true);
        MAX_RUNNING.store(0, Ordering::SeqCst);
        put(&h.store, 109, "slow", periodic());
        put(&h.store, 110, "slow", periodic());

        h.manager.submit(FireEvent::new(AlarmId(109), 0)).unwrap();
        h.manager.submit(FireEvent::new(AlarmId(110), 0)).unwrap();
        next_outcome(&mut h.outcomes).await;
        next_outcome(&mut h.outcomes).await;

        assert!(MAX_RUNNING.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn handler_limit_caps_concurrency_across_ids() {
        let mut h = harness_with(
            true,
            DispatchConfig {
                max_concurrent_handlers: 1,
                ..DispatchConfig::default()
            },
        );
        put(&h.store, 120, "gated", periodic());
        put(&h.store, 121, "gated", periodic());

        h.manager.submit(FireEvent::new(AlarmId(120), 0)).unwrap();
        h.manager.submit(FireEvent::new(AlarmId(121), 0)).unwrap();
        next_outcome(&mut h.outcomes).await;
        next_outcome(&mut h.outcomes).await;

        assert_eq!(GATED_MAX.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lanes_retiring_while_events_arrive_lose_nothing() {
        // Zero idle time: lanes retire as soon as they drain.
        let mut h = harness_with(
            true,
            DispatchConfig {
                lane_idle_secs: 0,
                ..DispatchConfig::default()
            },
        );
        put(&h.store, 122, "record", periodic());

        for at in 0..300 {
            h.manager.submit(FireEvent::new(AlarmId(122), at)).unwrap();
            if at % 3 == 0 {
                tokio::task::yield_now().await;
            }
            if at % 50 == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        let mut fired = Vec::new();
        for _ in 0..300 {
            let outcome = next_outcome(&mut h.outcomes).await;
            assert_eq!(outcome.status, DeliveryStatus::Delivered);
            fired.push(outcome.fired_at_millis);
        }
        assert_eq!(fired, (0..300).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn early_fire_does_not_consume_a_replacement() {
        let mut h = harness(true);
        let replacement = put(
            &h.store,
            112,
            "record",
            FiringPolicy::OneShot {
                fire_at_millis: 10_000,
                modifiers: AlarmModifiers::default(),
            },
        );

        // Late event from the wake the replacement superseded.
        h.manager.submit(FireEvent::new(AlarmId(112), 1_000)).unwrap();
        assert_eq!(next_outcome(&mut h.outcomes).await.status, DeliveryStatus::Stale);
        assert_eq!(h.store.get(AlarmId(112)).unwrap(), Some(replacement));
        assert!(log_for(112).is_empty());

        h.manager.submit(FireEvent::new(AlarmId(112), 10_002)).unwrap();
        assert_eq!(
            next_outcome(&mut h.outcomes).await.status,
            DeliveryStatus::Delivered
        );
        assert!(h.store.get(AlarmId(112)).unwrap().is_none());
    }

    #[tokio::test]
    async fn periodic_delivery_records_last_fire() {
        let mut h = harness(true);
        put(&h.store, 113, "record", periodic());

        h.manager.submit(FireEvent::new(AlarmId(113), 3_001)).unwrap();
        next_outcome(&mut h.outcomes).await;

        let stored = h.store.get(AlarmId(113)).unwrap().unwrap();
        assert_eq!(stored.last_fired_at_millis, Some(3_001));
    }

    #[tokio::test]
    async fn resume_retries_held_events_after_initialize() {
        let mut h = harness_with(
            false,
            DispatchConfig {
                max_pending_fires: 2,
                ..DispatchConfig::default()
            },
        );
        put(&h.store, 114, "record", periodic());

        for at in [1, 2, 3, 4] {
            h.manager.submit(FireEvent::new(AlarmId(114), at)).unwrap();
        }
        for _ in 0..100 {
            if h.manager.phase() == DispatchPhase::Cold {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.manager.phase(), DispatchPhase::Cold);

        let boot = BootstrapTable::new(BUILD).token_for("main");
        h.store.set_bootstrap_token(boot).unwrap();
        assert!(h.manager.resume().unwrap());

        // Only the newest events fit under the pending limit.
        assert_eq!(next_outcome(&mut h.outcomes).await.fired_at_millis, 3);
        assert_eq!(next_outcome(&mut h.outcomes).await.fired_at_millis, 4);
        assert!(!h.manager.resume().unwrap());
    }

    #[tokio::test]
    async fn ready_context_reconciles_missing_wakes() {
        let store = Arc::new(MemoryAlarmStore::new());
        let mut table = BootstrapTable::new(BUILD);
        let boot = table.register("main", bootstrap).unwrap();
        store.set_bootstrap_token(boot).unwrap();
        put(&store, 111, "record", periodic());

        let facility = Arc::new(RecordingWakeFacility::default());
        let (tx, mut outcomes) = mpsc::unbounded_channel();
        let manager = Arc::new(
            DispatchContextManager::new(store.clone(), table)
                .with_wake_scheduler(WakeScheduler::new(facility.clone()))
                .with_outcomes(tx),
        );

        manager.submit(FireEvent::new(AlarmId(111), 0)).unwrap();
        next_outcome(&mut outcomes).await;

        for _ in 0..100 {
            if facility.request_for(AlarmId(111)).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(facility.request_for(AlarmId(111)).is_some());
    }
}
