//! Persistent alarms with background dispatch.
//!
//! Client code schedules alarms through [`AlarmService`]; the record is
//! persisted in an [`AlarmStore`] and armed on a [`WakeFacility`]. When the
//! facility fires, the [`DispatchContextManager`] starts (or reuses) the
//! single dispatch context, resolves the stored [`HandlerToken`] and runs
//! the handler with the stored arguments.

pub mod dispatch;
pub mod registry;
mod schema;
pub mod service;
pub mod store;
pub mod types;
pub mod wake;

pub use dispatch::{DeliveryStatus, DispatchContextManager, DispatchOutcome, DispatchPhase};
pub use registry::{
    AlarmHandler, AlarmInvocation, BootstrapFn, BootstrapTable, HandlerRegistry,
    HandlerRegistryBuilder, HandlerToken, default_build_id, handler_fn,
};
pub use service::AlarmService;
pub use store::{AlarmStore, MemoryAlarmStore, SqliteAlarmStore};
pub use types::{AlarmArg, AlarmId, AlarmModifiers, AlarmRecord, FireEvent, FiringPolicy};
pub use wake::{
    ReconcileReport, TokioWakeFacility, WakeFacility, WakeRequest, WakeScheduler, WakeStyle,
};
