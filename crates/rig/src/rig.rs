use std::collections::HashMap;
use std::sync::Arc;

use filigree_protocol::{Command, CommandId, MotorType};

use crate::config::RigConfig;
use crate::controller::Controller;
use crate::error::{Result, RigError};
use crate::motor::Motor;
use crate::player::{PlaybackReport, Player};
use crate::router::RequestIds;
use crate::sequence::Sequence;
use crate::transport::PortOpener;

/// Everything attached to the host: the controllers, the motors on the
/// connected ones, the recorded sequence and its player.
pub struct Rig {
    config: RigConfig,
    ids: Arc<RequestIds>,
    controllers: Vec<Arc<Controller>>,
    motors: Vec<Motor>,
    /// `(controller, motor count)` for each controller the motor list was built from.
    built_from: Vec<(u32, u32)>,
    sequence: Sequence,
    player: Player,
}

impl Rig {
    pub fn new(config: RigConfig, opener: Arc<dyn PortOpener>) -> Rig {
        let ids = Arc::new(RequestIds::new());
        let controllers = (0..config.controller_count() as u32)
            .map(|id| Arc::new(Controller::new(id, ids.clone(), opener.clone(), &config)))
            .collect();
        let player = Player::new(config.step_delay());
        Rig {
            config,
            ids,
            controllers,
            motors: Vec::new(),
            built_from: Vec::new(),
            sequence: Sequence::new(),
            player,
        }
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    pub fn controller(&self, id: u32) -> Result<&Arc<Controller>> {
        self.controllers
            .get(id as usize)
            .ok_or(RigError::UnknownController(id))
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    pub fn motor(&self, display_index: usize) -> Result<&Motor> {
        self.motors
            .get(display_index)
            .ok_or(RigError::UnknownMotor(display_index))
    }

    pub fn motor_mut(&mut self, display_index: usize) -> Result<&mut Motor> {
        self.motors
            .get_mut(display_index)
            .ok_or(RigError::UnknownMotor(display_index))
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn sequence_mut(&mut self) -> &mut Sequence {
        &mut self.sequence
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    /// Connects a controller and brings its motors into the list.
    ///
    /// Succeeds once the controller is connected. Motors whose type can't be
    /// read keep the type they had, or the default for new ones.
    pub async fn connect(&mut self, id: u32) -> Result<()> {
        self.controller(id)?.open_port().await?;
        self.rebuild_motors();
        if let Err(e) = self.refresh_motor_types().await {
            log::warn!("controller {id}: couldn't read motor types: {e}");
        }
        Ok(())
    }

    pub async fn disconnect(&mut self, id: u32) -> Result<()> {
        self.controller(id)?.close_port().await;
        self.rebuild_motors();
        Ok(())
    }

    fn connected_set(&self) -> Vec<(u32, u32)> {
        self.controllers
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| (c.id(), c.motor_count()))
            .collect()
    }

    /// Recreates the motor list from the controllers connected right now,
    /// numbering motors across controllers in controller order.
    ///
    /// Motors that were already in the list keep their type.
    pub fn rebuild_motors(&mut self) {
        let known: HashMap<(u32, u32), MotorType> = self
            .motors
            .iter()
            .map(|m| ((m.controller_id(), m.id()), m.motor_type()))
            .collect();
        self.built_from = self.connected_set();
        let mut motors = Vec::new();
        for &(controller_id, count) in &self.built_from {
            let controller = &self.controllers[controller_id as usize];
            for motor_id in 0..count {
                let mut motor = Motor::new(motor_id, controller, self.ids.clone(), motors.len());
                if let Some(&ty) = known.get(&(controller_id, motor_id)) {
                    motor.assume_motor_type(ty);
                }
                motors.push(motor);
            }
        }
        log::debug!("{} motors on {} controllers", motors.len(), self.built_from.len());
        self.motors = motors;
    }

    /// Rebuilds the motor list if a controller came or went behind our back,
    /// say by being unplugged. Returns whether it did.
    pub fn sync_motors(&mut self) -> bool {
        if self.connected_set() == self.built_from {
            return false;
        }
        self.rebuild_motors();
        true
    }

    /// Asks every motor's board what type it is.
    pub async fn refresh_motor_types(&mut self) -> Result<()> {
        for motor in &mut self.motors {
            let controller = self
                .controllers
                .get(motor.controller_id() as usize)
                .ok_or(RigError::UnknownController(motor.controller_id()))?;
            match controller.motor_type(motor.id()).await? {
                Some(ty) => motor.assume_motor_type(ty),
                None => log::warn!(
                    "motor {}/{} reports an unknown type",
                    motor.controller_id(),
                    motor.id()
                ),
            }
        }
        Ok(())
    }

    /// Appends a move for every motor that has moved since it was last saved,
    /// and saves them. Returns how many were recorded.
    pub fn record_changes(&mut self) -> usize {
        let mut recorded = 0;
        for motor in &mut self.motors {
            if motor.has_changed() {
                self.sequence.push(motor.move_command());
                motor.save();
                recorded += 1;
            }
        }
        recorded
    }

    /// Appends a full cut for a cutter motor.
    pub fn record_cut(&mut self, display_index: usize) -> Result<()> {
        let motor = self.motor(display_index)?;
        let (Some(start), Some(end)) = (motor.cut_start_command(), motor.cut_end_command()) else {
            return Err(RigError::InvalidMotorType(motor.motor_type() as u32));
        };
        self.sequence.push(start);
        self.sequence.push(end);
        Ok(())
    }

    pub fn record_delay(&mut self, controller_id: u32, millis: u32) -> Result<()> {
        self.controller(controller_id)?;
        let cmd = Command::new(CommandId::MotorDelay, controller_id, 0, millis as f64)
            .with_request_id(self.ids.next());
        self.sequence.push(cmd);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<Command> {
        self.sequence.remove(index)
    }

    pub fn load_sequence(&mut self, text: &str) -> Result<()> {
        Ok(self.sequence.load(text)?)
    }

    pub fn sequence_file(&self) -> String {
        self.sequence.to_file_text()
    }

    /// Plays the sequence from `from`, or from the cursor, and leaves the
    /// cursor where playback stopped.
    pub async fn play(&mut self, from: Option<usize>) -> PlaybackReport {
        let from = from.unwrap_or(self.sequence.cursor());
        let report = self
            .player
            .start(self.sequence.commands(), &self.controllers, from)
            .await;
        self.sequence.set_cursor(report.cursor);
        report
    }

    /// Motors of a given type, by display index.
    pub fn motors_of_type(&self, motor_type: MotorType) -> impl Iterator<Item = &Motor> {
        self.motors
            .iter()
            .filter(move |m| m.motor_type() == motor_type)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RigConfigBuilder;
    use crate::simulator::SimulatedOpener;

    fn rig(sim: &SimulatedOpener) -> Rig {
        let cfg = RigConfigBuilder::default()
            .with_controllers(3)
            .with_settle_delay(Duration::from_millis(10))
            .with_step_delay(Duration::from_millis(100))
            .build();
        Rig::new(cfg, Arc::new(sim.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn motors_are_numbered_across_controllers() {
        let sim = SimulatedOpener::new(3);
        sim.set_motor_type(1, 2, MotorType::CutterTop);
        let mut rig = rig(&sim);

        rig.connect(1).await.unwrap();
        assert_eq!(rig.motors().len(), 3);
        assert_eq!(rig.motor(2).unwrap().motor_type(), MotorType::CutterTop);

        rig.connect(0).await.unwrap();
        let placed: Vec<(u32, u32, usize)> = rig
            .motors()
            .iter()
            .map(|m| (m.controller_id(), m.id(), m.display_index()))
            .collect();
        assert_eq!(
            placed,
            vec![(0, 0, 0), (0, 1, 1), (0, 2, 2), (1, 0, 3), (1, 1, 4), (1, 2, 5)]
        );
        assert_eq!(rig.motors_of_type(MotorType::CutterTop).count(), 1);

        rig.disconnect(0).await.unwrap();
        assert_eq!(rig.motors().len(), 3);
        assert_eq!(rig.motor(0).unwrap().controller_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unplugged_controllers_drop_out() {
        let sim = SimulatedOpener::new(2);
        let mut rig = rig(&sim);
        rig.connect(0).await.unwrap();
        rig.connect(1).await.unwrap();
        assert!(!rig.sync_motors());

        sim.unplug(0);
        let mut state = rig.controller(0).unwrap().subscribe();
        state
            .wait_for(|s| *s == crate::ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(rig.sync_motors());
        assert_eq!(rig.motors().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn types_survive_other_controllers_leaving() {
        let sim = SimulatedOpener::new(2);
        sim.set_motor_type(1, 0, MotorType::Extruder);
        sim.set_motor_type(2, 1, MotorType::CutterTop);
        let mut rig = rig(&sim);
        rig.connect(0).await.unwrap();
        rig.connect(1).await.unwrap();
        rig.connect(2).await.unwrap();

        rig.disconnect(0).await.unwrap();
        let motor = rig.motor_mut(0).unwrap();
        assert_eq!((motor.controller_id(), motor.id()), (1, 0));
        assert_eq!(motor.motor_type(), MotorType::Extruder);
        motor.move_to(10.0).await.unwrap();
        let sent = *sim.received(1).last().unwrap();
        assert_eq!(sent.kind(), Some(CommandId::MotorRelativeMove));

        sim.unplug(1);
        let mut state = rig.controller(1).unwrap().subscribe();
        state
            .wait_for(|s| *s == crate::ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(rig.sync_motors());
        assert_eq!(rig.motor(1).unwrap().motor_type(), MotorType::CutterTop);
        rig.record_cut(1).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_types_dont_fail_the_connect() {
        let sim = SimulatedOpener::new(2);
        sim.set_motor_type(0, 1, MotorType::CutterBottom);
        sim.refuse(0, CommandId::MotorGetType);
        let mut rig = rig(&sim);

        rig.connect(0).await.unwrap();
        assert!(rig.controller(0).unwrap().is_connected());
        assert_eq!(rig.motors().len(), 2);
        assert_eq!(rig.motor(1).unwrap().motor_type(), MotorType::Default);
    }

    #[tokio::test(start_paused = true)]
    async fn record_and_replay() {
        let sim = SimulatedOpener::new(2);
        let mut rig = rig(&sim);
        rig.connect(0).await.unwrap();

        rig.motor_mut(0).unwrap().move_to(30.0).await.unwrap();
        rig.motor_mut(1).unwrap().move_to(60.0).await.unwrap();
        assert_eq!(rig.record_changes(), 2);
        assert_eq!(rig.record_changes(), 0);
        rig.record_delay(0, 250).unwrap();
        assert!(matches!(
            rig.record_delay(5, 250),
            Err(RigError::UnknownController(5))
        ));
        assert_eq!(rig.sequence().len(), 3);
        assert_eq!(rig.sequence().cursor(), 2);

        let saved = rig.sequence_file();
        rig.motor_mut(0).unwrap().reset().await.unwrap();
        rig.motor_mut(1).unwrap().reset().await.unwrap();
        assert_eq!(sim.angle(0, 1), Some(0.0));

        assert!(rig.load_sequence("garbage").is_err());
        assert_eq!(rig.sequence().len(), 3);
        rig.load_sequence(&saved).unwrap();

        let report = rig.play(None).await;
        assert_eq!(report.executed, 3);
        assert!(report.completed);
        assert_eq!(rig.sequence().cursor(), 2);
        assert_eq!(sim.angle(0, 0), Some(30.0));
        assert_eq!(sim.angle(0, 1), Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn cuts_need_a_cutter() {
        let sim = SimulatedOpener::new(2);
        sim.set_motor_type(0, 1, MotorType::CutterBottom);
        let mut rig = rig(&sim);
        rig.connect(0).await.unwrap();

        assert!(matches!(
            rig.record_cut(0),
            Err(RigError::InvalidMotorType(0))
        ));
        rig.record_cut(1).unwrap();
        let kinds: Vec<_> = rig.sequence().commands().iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            vec![Some(CommandId::MotorCutMove), Some(CommandId::MotorCutMove)]
        );
        assert!(rig.remove(0).is_some());
        assert_eq!(rig.sequence().len(), 1);
    }
}
