//! Versioned host command/event envelopes for the alarm host.

use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Emitted after a schedule command stored and armed an alarm.
pub const EVENT_ALARM_SCHEDULED: &str = "alarm.scheduled";
/// Emitted after a cancel command.
pub const EVENT_ALARM_CANCELLED: &str = "alarm.cancelled";
/// Emitted when a fire event was handed to the dispatch context.
pub const EVENT_ALARM_FIRE_RECEIVED: &str = "alarm.fire_received";
/// Emitted once a handler invocation finished (or was dropped).
pub const EVENT_ALARM_DISPATCHED: &str = "alarm.dispatched";

/// Command set understood by the alarm host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "host.version")]
    HostVersion,
    #[serde(rename = "host.stop")]
    HostStop,
    #[serde(rename = "alarm.start")]
    AlarmStart,
    #[serde(rename = "alarm.schedule_one_shot")]
    AlarmScheduleOneShot,
    #[serde(rename = "alarm.schedule_periodic")]
    AlarmSchedulePeriodic,
    #[serde(rename = "alarm.cancel")]
    AlarmCancel,
    #[serde(rename = "alarm.fire")]
    AlarmFire,
    #[serde(rename = "alarm.reboot_recovery")]
    AlarmRebootRecovery,
    #[serde(rename = "alarm.get")]
    AlarmGet,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::HostVersion => "host.version",
            Self::HostStop => "host.stop",
            Self::AlarmStart => "alarm.start",
            Self::AlarmScheduleOneShot => "alarm.schedule_one_shot",
            Self::AlarmSchedulePeriodic => "alarm.schedule_periodic",
            Self::AlarmCancel => "alarm.cancel",
            Self::AlarmFire => "alarm.fire",
            Self::AlarmRebootRecovery => "alarm.reboot_recovery",
            Self::AlarmGet => "alarm.get",
        }
    }
}

/// A versioned response envelope from host -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }

    /// Response for an alarm operation that reports a boolean outcome.
    #[must_use]
    pub fn success(request_id: impl Into<String>, success: bool) -> Self {
        Self::ok(request_id, serde_json::json!({ "success": success }))
    }
}

/// A versioned command envelope from client -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A versioned event envelope from host -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build an event with a fresh random id.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: uuid::Uuid::new_v4().to_string(),
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CommandName; 10] = [
        CommandName::HostPing,
        CommandName::HostVersion,
        CommandName::HostStop,
        CommandName::AlarmStart,
        CommandName::AlarmScheduleOneShot,
        CommandName::AlarmSchedulePeriodic,
        CommandName::AlarmCancel,
        CommandName::AlarmFire,
        CommandName::AlarmRebootRecovery,
        CommandName::AlarmGet,
    ];

    #[test]
    fn command_names_agree_with_serde() {
        for command in ALL {
            let wire = serde_json::to_value(command).unwrap();
            assert_eq!(wire, serde_json::Value::from(command.as_str()));
            let back: CommandName = serde_json::from_value(wire).unwrap();
            assert_eq!(back, command);
        }
        assert!(serde_json::from_str::<CommandName>("\"alarm.snooze\"").is_err());
    }

    #[test]
    fn envelope_validation_rejects_bad_version_and_id() {
        let mut envelope = CommandEnvelope::new("req", CommandName::HostPing, serde_json::json!({}));
        assert!(envelope.validate().is_ok());

        envelope.v = 2;
        let err = envelope.validate().unwrap_err();
        assert_eq!(err.kind, ContractErrorKind::UnsupportedVersion);

        envelope.v = EVENT_VERSION;
        envelope.request_id = "  ".to_owned();
        let err = envelope.validate().unwrap_err();
        assert_eq!(err.kind, ContractErrorKind::InvalidEnvelope);
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"v":1,"request_id":"r","command":"host.ping"}"#).unwrap();
        assert!(envelope.payload.is_null());
    }

    #[test]
    fn success_response_carries_flag() {
        let resp = ResponseEnvelope::success("r", false);
        assert!(resp.ok);
        assert_eq!(resp.payload["success"], false);
    }
}
