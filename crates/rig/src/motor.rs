use std::sync::{Arc, Weak};

use filigree_protocol::{Command, CommandId, MotorType};

use crate::controller::Controller;
use crate::error::{Result, RigError};
use crate::router::RequestIds;

/// Where the blade goes at the start and at the end of a cut, per cutter role.
const BOTTOM_CUT: (f64, f64) = (45.0, 135.0);
const TOP_CUT: (f64, f64) = (225.0, 315.0);

/// Keeps a requested angle inside what the motor can be asked for.
///
/// Extruders are driven by distance and take anything; everything else
/// lives on one turn.
pub fn clamp_angle(motor_type: MotorType, angle: f64) -> f64 {
    match motor_type {
        MotorType::Extruder => angle,
        _ => angle.clamp(0.0, 360.0),
    }
}

/// One stepper on one controller.
///
/// `angle` is the requested position: it changes as soon as a move is
/// asked for, whether or not the board manages it.
#[derive(Debug)]
pub struct Motor {
    id: u32,
    controller_id: u32,
    controller: Weak<Controller>,
    ids: Arc<RequestIds>,
    display_index: usize,
    motor_type: MotorType,
    angle: f64,
    last_saved_angle: f64,
}

impl Motor {
    pub fn new(
        id: u32,
        controller: &Arc<Controller>,
        ids: Arc<RequestIds>,
        display_index: usize,
    ) -> Motor {
        Motor {
            id,
            controller_id: controller.id(),
            controller: Arc::downgrade(controller),
            ids,
            display_index,
            motor_type: MotorType::Default,
            angle: 0.0,
            last_saved_angle: 0.0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn controller_id(&self) -> u32 {
        self.controller_id
    }

    /// Position across every connected controller's motors.
    pub fn display_index(&self) -> usize {
        self.display_index
    }

    pub fn motor_type(&self) -> MotorType {
        self.motor_type
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn last_saved_angle(&self) -> f64 {
        self.last_saved_angle
    }

    pub fn has_changed(&self) -> bool {
        self.angle != self.last_saved_angle
    }

    fn command(&self, id: CommandId, param: f64) -> Command {
        Command::new(id, self.controller_id, self.id, param)
    }

    /// Stamps a command bound for a sequence rather than the wire.
    fn recorded(&self, cmd: Command) -> Command {
        cmd.with_request_id(self.ids.next())
    }

    async fn send(&self, cmd: Command) -> Result<u32> {
        let controller = self.controller.upgrade().ok_or(RigError::ControllerGone)?;
        controller.send_request(cmd).await
    }

    /// The move that takes the motor from `from` to the current angle.
    fn move_from(&self, from: f64) -> Command {
        match self.motor_type {
            MotorType::Extruder => self.command(CommandId::MotorRelativeMove, self.angle - from),
            _ => self.command(CommandId::MotorAbsoluteMove, self.angle),
        }
    }

    pub async fn move_to(&mut self, angle: f64) -> Result<u32> {
        let from = self.angle;
        self.angle = angle;
        log::debug!("motor {}/{}: move to {angle}", self.controller_id, self.id);
        self.send(self.move_from(from)).await
    }

    pub async fn move_by(&mut self, delta: f64) -> Result<u32> {
        self.move_to(self.angle + delta).await
    }

    /// Goes back to the last saved angle. Nothing is sent if already there.
    pub async fn undo(&mut self) -> Result<()> {
        if self.has_changed() {
            self.move_to(self.last_saved_angle).await?;
        }
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<u32> {
        self.angle = 0.0;
        self.last_saved_angle = 0.0;
        self.send(self.command(CommandId::MotorReset, 0.0)).await
    }

    /// Changes the motor's type, refusing values that aren't a [`MotorType`]
    /// before anything reaches the board.
    pub async fn set_motor_type(&mut self, value: u32) -> Result<u32> {
        let motor_type = MotorType::from_u32(value).ok_or(RigError::InvalidMotorType(value))?;
        self.motor_type = motor_type;
        self.send(self.command(CommandId::MotorSetType, value as f64))
            .await
    }

    /// Takes on the type the board reports, without telling the board.
    pub(crate) fn assume_motor_type(&mut self, motor_type: MotorType) {
        self.motor_type = motor_type;
    }

    /// The move since the last save, ready to append to a sequence.
    pub fn move_command(&self) -> Command {
        self.recorded(self.move_from(self.last_saved_angle))
    }

    fn cut_angles(&self) -> Option<(f64, f64)> {
        match self.motor_type {
            MotorType::CutterBottom => Some(BOTTOM_CUT),
            MotorType::CutterTop => Some(TOP_CUT),
            _ => None,
        }
    }

    pub fn cut_start_command(&self) -> Option<Command> {
        let (start, _) = self.cut_angles()?;
        Some(self.recorded(self.command(CommandId::MotorCutMove, start)))
    }

    pub fn cut_end_command(&self) -> Option<Command> {
        let (_, end) = self.cut_angles()?;
        Some(self.recorded(self.command(CommandId::MotorCutMove, end)))
    }

    /// Checkpoints the current angle. Extruders count from zero again.
    pub fn save(&mut self) {
        if self.motor_type == MotorType::Extruder {
            self.angle = 0.0;
        }
        self.last_saved_angle = self.angle;
    }
}
