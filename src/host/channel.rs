//! Host command channel and router for the alarm host.
//!
//! [`HostCommandClient`] sends validated [`CommandEnvelope`]s to a
//! [`HostCommandServer`], which routes them to the [`AlarmService`] and the
//! [`DispatchContextManager`] and answers with a [`ResponseEnvelope`].
//! Side effects are announced on a broadcast channel of [`EventEnvelope`]s.

use crate::alarm::dispatch::{DispatchContextManager, DispatchOutcome};
use crate::alarm::registry::HandlerToken;
use crate::alarm::service::AlarmService;
use crate::alarm::types::{AlarmArg, AlarmId, AlarmModifiers, FireEvent, FiringPolicy};
use crate::error::{AlarmError, Result};
use crate::host::contract::{
    CommandEnvelope, CommandName, EVENT_ALARM_CANCELLED, EVENT_ALARM_DISPATCHED,
    EVENT_ALARM_FIRE_RECEIVED, EVENT_ALARM_SCHEDULED, EVENT_VERSION, EventEnvelope,
    ResponseEnvelope,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

/// Everything the router needs to serve alarm commands.
#[derive(Clone)]
pub struct AlarmHost {
    service: Arc<AlarmService>,
    dispatch: Arc<DispatchContextManager>,
}

impl AlarmHost {
    pub fn new(service: Arc<AlarmService>, dispatch: Arc<DispatchContextManager>) -> Self {
        Self { service, dispatch }
    }

    pub fn service(&self) -> &Arc<AlarmService> {
        &self.service
    }

    pub fn dispatch(&self) -> &Arc<DispatchContextManager> {
        &self.dispatch
    }
}

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    /// Send a command and wait for its response.
    ///
    /// # Errors
    ///
    /// [`AlarmError::InvalidCommand`] for an envelope that fails
    /// validation, [`AlarmError::Channel`] if the server is gone.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            AlarmError::InvalidCommand(format!(
                "invalid host command envelope {}: {}",
                envelope.request_id, e
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| AlarmError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| AlarmError::Channel(format!("host command response dropped: {e}")))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

pub struct HostCommandServer {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
    host: AlarmHost,
}

#[must_use]
pub fn command_channel(
    request_capacity: usize,
    event_capacity: usize,
    host: AlarmHost,
) -> (HostCommandClient, HostCommandServer) {
    let (event_tx, _event_rx) = broadcast::channel(event_capacity.max(1));
    command_channel_with_events(request_capacity, event_tx, host)
}

/// Create a command channel using an existing event broadcast sender.
///
/// Lets dispatch outcomes (see [`forward_outcomes`]) share the stream that
/// command side effects are reported on.
#[must_use]
pub fn command_channel_with_events(
    request_capacity: usize,
    event_tx: broadcast::Sender<EventEnvelope>,
    host: AlarmHost,
) -> (HostCommandClient, HostCommandServer) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            event_tx,
            host,
        },
    )
}

/// Publish every [`DispatchOutcome`] as an `alarm.dispatched` event.
pub fn forward_outcomes(
    event_tx: broadcast::Sender<EventEnvelope>,
    mut outcomes: mpsc::UnboundedReceiver<DispatchOutcome>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            match serde_json::to_value(&outcome) {
                Ok(payload) => {
                    let _ = event_tx.send(EventEnvelope::new(EVENT_ALARM_DISPATCHED, payload));
                }
                Err(e) => warn!("cannot encode dispatch outcome: {e}"),
            }
        }
    })
}

impl HostCommandServer {
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            let envelope = &request.envelope;
            let response = self.route(envelope).unwrap_or_else(|e| {
                warn!("{} {} rejected: {e}", envelope.command.as_str(), envelope.request_id);
                ResponseEnvelope::error(envelope.request_id.clone(), e.to_string())
            });
            let _ = request.response_tx.send(response);
        }
    }

    /// Route a command envelope to the alarm subsystem.
    ///
    /// Alarm operations answer `ok` with `payload.success`; an `Err` means
    /// the payload itself could not be understood.
    pub fn route(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        match envelope.command {
            CommandName::HostPing => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({"pong": true}),
            )),
            CommandName::HostVersion => Ok(self.handle_version(envelope)),
            CommandName::HostStop => Ok(ResponseEnvelope::ok(
                envelope.request_id.clone(),
                serde_json::json!({"stopping": true}),
            )),
            CommandName::AlarmStart => self.handle_start(envelope),
            CommandName::AlarmScheduleOneShot => self.handle_schedule_one_shot(envelope),
            CommandName::AlarmSchedulePeriodic => self.handle_schedule_periodic(envelope),
            CommandName::AlarmCancel => self.handle_cancel(envelope),
            CommandName::AlarmFire => self.handle_fire(envelope),
            CommandName::AlarmRebootRecovery => self.handle_reboot_recovery(envelope),
            CommandName::AlarmGet => self.handle_get(envelope),
        }
    }

    fn handle_version(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        let table = self.host.service.bootstrap();
        let bootstraps: Vec<serde_json::Value> = table
            .entries()
            .into_iter()
            .map(|(name, token)| serde_json::json!({"name": name, "token": token}))
            .collect();
        ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({
                "contract_version": EVENT_VERSION,
                "package_version": env!("CARGO_PKG_VERSION"),
                "build_id": table.build_id(),
                "bootstraps": bootstraps,
            }),
        )
    }

    fn handle_start(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let payload: StartPayload = parse_payload(envelope)?;
        let success = match payload.handler {
            Some(token) => self.host.service.initialize(token),
            None => {
                warn!("alarm.start without a handler token");
                false
            }
        };
        if success {
            // Fires held by an earlier failed start can now be delivered.
            if let Err(e) = self.host.dispatch.resume() {
                warn!("cannot resume held fires: {e}");
            }
        }
        Ok(ResponseEnvelope::success(envelope.request_id.clone(), success))
    }

    fn handle_schedule_one_shot(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let payload: OneShotPayload = parse_payload(envelope)?;
        let policy = payload.policy();
        Ok(self.schedule(envelope, payload.id, policy, payload.handler, payload.args))
    }

    fn handle_schedule_periodic(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let payload: PeriodicPayload = parse_payload(envelope)?;
        let policy = payload.policy();
        Ok(self.schedule(envelope, payload.id, policy, payload.handler, payload.args))
    }

    fn schedule(
        &self,
        envelope: &CommandEnvelope,
        id: AlarmId,
        policy: FiringPolicy,
        handler: HandlerToken,
        args: Vec<AlarmArg>,
    ) -> ResponseEnvelope {
        let success = self.host.service.schedule(id, policy, handler, args);
        if success {
            self.emit_event(
                EVENT_ALARM_SCHEDULED,
                serde_json::json!({
                    "request_id": envelope.request_id,
                    "id": id,
                    "policy": policy,
                }),
            );
        }
        ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"success": success, "id": id}),
        )
    }

    fn handle_cancel(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let IdPayload { id } = parse_payload(envelope)?;
        let success = self.host.service.cancel(id);
        if success {
            self.emit_event(
                EVENT_ALARM_CANCELLED,
                serde_json::json!({"request_id": envelope.request_id, "id": id}),
            );
        }
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"success": success, "id": id}),
        ))
    }

    fn handle_fire(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let payload: FirePayload = parse_payload(envelope)?;
        let event = match payload.fired_at_millis {
            Some(at) => FireEvent::new(payload.id, at),
            None => FireEvent::now(payload.id),
        };
        self.host.dispatch.submit(event)?;

        self.emit_event(
            EVENT_ALARM_FIRE_RECEIVED,
            serde_json::json!({
                "request_id": envelope.request_id,
                "id": event.alarm_id,
                "fired_at_millis": event.fired_at_millis,
            }),
        );
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"accepted": true, "id": event.alarm_id}),
        ))
    }

    fn handle_reboot_recovery(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let RebootPayload { boot_epoch } = parse_payload(envelope)?;
        let payload = match self.host.service.reboot_recovery(boot_epoch) {
            Ok(report) => serde_json::json!({"success": true, "report": report}),
            Err(e) => {
                warn!("reboot recovery for epoch {boot_epoch} failed: {e}");
                serde_json::json!({"success": false})
            }
        };
        Ok(ResponseEnvelope::ok(envelope.request_id.clone(), payload))
    }

    fn handle_get(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope> {
        let IdPayload { id } = parse_payload(envelope)?;
        let record = self.host.service.alarm(id)?;
        Ok(ResponseEnvelope::ok(
            envelope.request_id.clone(),
            serde_json::json!({"alarm": record}),
        ))
    }

    fn emit_event(&self, event: &str, payload: serde_json::Value) {
        let _ = self.event_tx.send(EventEnvelope::new(event, payload));
    }
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(default)]
    handler: Option<HandlerToken>,
}

#[derive(Debug, Deserialize)]
struct OneShotPayload {
    id: AlarmId,
    fire_at_millis: i64,
    handler: HandlerToken,
    #[serde(default)]
    args: Vec<AlarmArg>,
    #[serde(default)]
    alarm_clock: bool,
    #[serde(default)]
    allow_while_idle: bool,
    #[serde(default)]
    exact: bool,
    #[serde(default)]
    wakeup: bool,
    #[serde(default)]
    reschedule_on_reboot: bool,
}

impl OneShotPayload {
    fn policy(&self) -> FiringPolicy {
        FiringPolicy::OneShot {
            fire_at_millis: self.fire_at_millis,
            modifiers: AlarmModifiers::default()
                .alarm_clock(self.alarm_clock)
                .allow_while_idle(self.allow_while_idle)
                .exact(self.exact)
                .wakeup(self.wakeup)
                .reschedule_on_reboot(self.reschedule_on_reboot),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PeriodicPayload {
    id: AlarmId,
    first_fire_at_millis: i64,
    period_millis: i64,
    handler: HandlerToken,
    #[serde(default)]
    args: Vec<AlarmArg>,
    #[serde(default)]
    exact: bool,
    #[serde(default)]
    wakeup: bool,
    #[serde(default)]
    reschedule_on_reboot: bool,
}

impl PeriodicPayload {
    fn policy(&self) -> FiringPolicy {
        FiringPolicy::Periodic {
            first_fire_at_millis: self.first_fire_at_millis,
            period_millis: self.period_millis,
            modifiers: AlarmModifiers::default()
                .exact(self.exact)
                .wakeup(self.wakeup)
                .reschedule_on_reboot(self.reschedule_on_reboot),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdPayload {
    id: AlarmId,
}

#[derive(Debug, Deserialize)]
struct FirePayload {
    id: AlarmId,
    #[serde(default)]
    fired_at_millis: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RebootPayload {
    boot_epoch: u64,
}

fn parse_payload<T: DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        AlarmError::InvalidCommand(format!("{} payload: {e}", envelope.command.as_str()))
    })
}
