//! Wire protocol spoken between the configurator and the motor controllers.
//!
//! Every message, in either direction, is one line of exactly five
//! comma-separated integers:
//!
//! ```text
//! requestId,commandId,controllerId,motorId,param
//! ```
//!
//! Responses reuse the same shape: the second field is an error code (zero
//! on success) and the third field is the result. Move-class commands carry
//! their angle in milli-degrees on the wire and in degrees everywhere else.

use serde::{Deserialize, Serialize};

mod line;
mod sequence;

pub use line::{decode_fields, decode_line, encode_fields, encode_line, DecodeError};
pub use sequence::{decode_sequence_file, encode_sequence_file, FormatError, VERSION_MARKER};

/// Number of integer fields in every wire line.
pub const FIELD_COUNT: usize = 5;

/// Wire units per degree for move-class commands.
pub const MILLI_PER_DEGREE: f64 = 1000.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CommandId {
    MotorsInitialize = 0,
    MotorsCount = 1,
    MotorStatus = 2,
    MotorAlerts = 3,
    MotorAbsoluteMove = 4,
    MotorRelativeMove = 5,
    MotorCutMove = 6,
    MotorReset = 7,
    MotorGetType = 8,
    MotorSetType = 9,
    MotorSetVelocity = 10,
    MotorGetVelocity = 11,
    MotorSetAcceleration = 12,
    MotorGetAcceleration = 13,
    MotorSetCuttingAcceleration = 14,
    MotorGetCuttingAcceleration = 15,
    MotorSetResolution = 16,
    MotorGetResolution = 17,
    MotorDelay = 18,
}

impl CommandId {
    pub const ALL: [CommandId; 19] = [
        CommandId::MotorsInitialize,
        CommandId::MotorsCount,
        CommandId::MotorStatus,
        CommandId::MotorAlerts,
        CommandId::MotorAbsoluteMove,
        CommandId::MotorRelativeMove,
        CommandId::MotorCutMove,
        CommandId::MotorReset,
        CommandId::MotorGetType,
        CommandId::MotorSetType,
        CommandId::MotorSetVelocity,
        CommandId::MotorGetVelocity,
        CommandId::MotorSetAcceleration,
        CommandId::MotorGetAcceleration,
        CommandId::MotorSetCuttingAcceleration,
        CommandId::MotorGetCuttingAcceleration,
        CommandId::MotorSetResolution,
        CommandId::MotorGetResolution,
        CommandId::MotorDelay,
    ];

    pub fn from_u32(id: u32) -> Option<CommandId> {
        CommandId::ALL.get(id as usize).copied()
    }

    /// Move-class commands carry their parameter in milli-degrees on the wire.
    pub fn is_move(self) -> bool {
        matches!(
            self,
            CommandId::MotorAbsoluteMove | CommandId::MotorRelativeMove | CommandId::MotorCutMove
        )
    }

    /// Commands that make something physically move, and so take a while to answer.
    pub fn is_motion(self) -> bool {
        self.is_move() || matches!(self, CommandId::MotorReset | CommandId::MotorsInitialize)
    }
}

impl From<CommandId> for u32 {
    fn from(id: CommandId) -> u32 {
        id as u32
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MotorType {
    #[default]
    Default = 0,
    Extruder = 1,
    CutterBottom = 2,
    CutterTop = 3,
    Disabled = 4,
}

impl MotorType {
    pub const ALL: [MotorType; 5] = [
        MotorType::Default,
        MotorType::Extruder,
        MotorType::CutterBottom,
        MotorType::CutterTop,
        MotorType::Disabled,
    ];

    pub fn from_u32(value: u32) -> Option<MotorType> {
        MotorType::ALL.get(value as usize).copied()
    }

    pub fn is_cutter(self) -> bool {
        matches!(self, MotorType::CutterBottom | MotorType::CutterTop)
    }
}

impl From<MotorType> for u32 {
    fn from(ty: MotorType) -> u32 {
        ty as u32
    }
}

/// One request (or response) line.
///
/// `command_id` is kept as the raw wire value: on a response line the same
/// position holds the error code, which need not be a valid [`CommandId`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: u32,
    pub command_id: u32,
    pub controller_id: u32,
    pub motor_id: u32,
    /// Degrees for move-class commands, a plain integer otherwise.
    pub param: f64,
}

impl Command {
    /// Builds a command with request id 0; the router stamps a real id at send time.
    pub fn new(id: CommandId, controller_id: u32, motor_id: u32, param: f64) -> Command {
        Command {
            request_id: 0,
            command_id: id.into(),
            controller_id,
            motor_id,
            param,
        }
    }

    pub fn with_request_id(self, request_id: u32) -> Command {
        Command { request_id, ..self }
    }

    pub fn kind(&self) -> Option<CommandId> {
        CommandId::from_u32(self.command_id)
    }

    pub fn is_move(&self) -> bool {
        self.kind().is_some_and(CommandId::is_move)
    }

    /// The five integer fields exactly as they go on the wire.
    pub fn wire_fields(&self) -> [i64; FIELD_COUNT] {
        let param = if self.is_move() {
            (self.param * MILLI_PER_DEGREE).round() as i64
        } else {
            self.param.round() as i64
        };
        [
            self.request_id.into(),
            self.command_id.into(),
            self.controller_id.into(),
            self.motor_id.into(),
            param,
        ]
    }
}

/// A decoded reply to a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub request_id: u32,
    /// Zero on success, otherwise a device error (usually the motor alert register).
    pub error: u32,
    pub result: u32,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

impl From<Command> for Response {
    fn from(line: Command) -> Response {
        Response {
            request_id: line.request_id,
            error: line.command_id,
            result: line.controller_id,
        }
    }
}
