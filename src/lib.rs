//! Chime: persistent alarms with background callback dispatch.
//!
//! Client code schedules named alarms that fire at a time or on an
//! interval. Each alarm is stored durably, armed on a wake facility, and
//! delivered to a registered handler inside one long-lived dispatch
//! context, even when the scheduling caller is long gone.
//!
//! # Architecture
//!
//! - **Handle registry**: portable tokens resolved to compiled-in handlers
//! - **Alarm store**: SQLite-backed records keyed by alarm id
//! - **Wake scheduler**: maps firing policies onto wake requests
//! - **Dispatch context**: lazy cold start, per-id ordered delivery
//! - **Host channel**: versioned JSON commands over stdio

pub mod alarm;
pub mod chime_dirs;
pub mod config;
pub mod error;
pub mod host;

#[cfg(test)]
mod test_utils;

pub use alarm::{AlarmId, AlarmService, DispatchContextManager, FiringPolicy, HandlerToken};
pub use config::ChimeConfig;
pub use error::{AlarmError, Result};
