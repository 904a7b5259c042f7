//! Control-plane message types exchanged over the framed TCP transport.
//!
//! A request carries one command; a reply carries one of the response
//! variants. Devices that recognize a command answer with an ack (or
//! `Empty` for pure sensors); anything else comes back as an in-band error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandRequest {
    SendActuatorCommand {
        device_id: String,
        action: ActuatorAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorAction {
    Light(LightAction),
    Sink(SinkAction),
}

/// Partial update for a lamp. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightAction {
    pub turn_on: Option<bool>,
    pub brightness: Option<u32>,
    /// 24-bit RGB, e.g. 0xFFFFFF.
    pub color: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkAction {
    pub turn_on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    ActuatorAck { message: String },
    Error(ErrorDetails),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl ErrorDetails {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unknown,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidCommand,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unknown,
    InvalidCommand,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[test]
    fn request_round_trips_through_framing() {
        let request = CommandRequest::SendActuatorCommand {
            device_id: "Lamp._lightlamp._tcp.local.".into(),
            action: ActuatorAction::Light(LightAction {
                turn_on: Some(true),
                brightness: Some(80),
                color: Some(0x00FF88),
            }),
        };
        let bytes = wire::frame(&request).unwrap();
        let back: CommandRequest = wire::decode(wire::unframe(&bytes).unwrap()).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn error_helpers_set_codes() {
        assert_eq!(ErrorDetails::unknown("boom").code, ErrorCode::Unknown);
        assert_eq!(
            ErrorDetails::invalid_command("nope").code,
            ErrorCode::InvalidCommand
        );
    }
}
