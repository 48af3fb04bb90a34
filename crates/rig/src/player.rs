//! Replaying a recorded sequence against the controllers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use filigree_protocol::Command;
use tokio::sync::watch;

use crate::controller::Controller;
use crate::error::{RequestError, Result, RigError};
use crate::router::{AbortHandle, AbortSignal};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
}

/// What a call to [`Player::start`] got through.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Steps the board answered successfully.
    pub executed: usize,
    /// Steps that were sent (or tried) but failed.
    pub failed: usize,
    /// True if playback ran off the end rather than being stopped.
    pub completed: bool,
    /// Where playback would resume.
    pub cursor: usize,
}

struct Shared {
    state: watch::Sender<PlayerState>,
    cursor: watch::Sender<usize>,
    abort: Mutex<AbortHandle>,
    step_delay: Duration,
}

/// Steps through a sequence one command at a time.
///
/// Clones share state, so one clone can pause or abort what another is
/// playing.
#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
}

impl Player {
    pub fn new(step_delay: Duration) -> Self {
        Player {
            shared: Arc::new(Shared {
                state: watch::channel(PlayerState::Stopped).0,
                cursor: watch::channel(0).0,
                abort: Mutex::new(AbortHandle::new()),
                step_delay,
            }),
        }
    }

    pub fn state(&self) -> PlayerState {
        *self.shared.state.borrow()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayerState::Playing
    }

    pub fn cursor(&self) -> usize {
        *self.shared.cursor.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_cursor(&self) -> watch::Receiver<usize> {
        self.shared.cursor.subscribe()
    }

    fn abort_handle(&self) -> MutexGuard<'_, AbortHandle> {
        self.shared
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops after the step in flight, if any, has been answered.
    pub fn pause(&self) {
        if self.shared.state.send_replace(PlayerState::Stopped) == PlayerState::Playing {
            log::info!("playback paused");
        }
    }

    /// Stops now, giving up on the step in flight.
    ///
    /// A command already written to the board still runs there; we just stop
    /// waiting for it.
    pub fn abort(&self) {
        self.pause();
        self.abort_handle().abort();
    }

    /// Plays `commands` from `from` to the end, or until paused.
    ///
    /// A step that fails is logged and skipped. Returns immediately if
    /// playback is already running elsewhere.
    pub async fn start(
        &self,
        commands: &[Command],
        controllers: &[Arc<Controller>],
        from: usize,
    ) -> PlaybackReport {
        let mut report = PlaybackReport {
            cursor: self.cursor(),
            ..PlaybackReport::default()
        };
        if commands.is_empty() {
            return report;
        }
        if self.shared.state.send_replace(PlayerState::Playing) == PlayerState::Playing {
            log::warn!("playback is already running");
            return report;
        }

        let signal = {
            let mut handle = self.abort_handle();
            *handle = AbortHandle::new();
            handle.signal()
        };
        let last = commands.len() - 1;
        let from = from.min(last);
        report.cursor = from;
        self.shared.cursor.send_replace(from);
        log::info!("playing steps {from}..={last}");

        for (i, cmd) in commands.iter().enumerate().skip(from) {
            if !self.is_playing() {
                break;
            }
            match dispatch(controllers, *cmd, signal.clone()).await {
                Ok(_) => report.executed += 1,
                Err(RigError::Request(RequestError::Aborted)) => {
                    log::info!("step {i} abandoned");
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    log::warn!("step {i} failed: {e}");
                    report.failed += 1;
                }
            }

            report.cursor = (i + 1).min(last);
            self.shared.cursor.send_replace(report.cursor);
            if i == last {
                report.completed = true;
                break;
            }
            self.step_delay().await;
        }

        self.shared.state.send_replace(PlayerState::Stopped);
        log::info!(
            "playback stopped at step {}: {} ok, {} failed",
            report.cursor,
            report.executed,
            report.failed
        );
        report
    }

    /// Waits out the pause between steps, ending early if playback stops.
    async fn step_delay(&self) {
        let mut state = self.subscribe_state();
        tokio::select! {
            _ = tokio::time::sleep(self.shared.step_delay) => {}
            _ = state.wait_for(|s| *s != PlayerState::Playing) => {}
        }
    }
}

async fn dispatch(
    controllers: &[Arc<Controller>],
    cmd: Command,
    signal: AbortSignal,
) -> Result<u32> {
    let controller = controllers
        .iter()
        .find(|c| c.id() == cmd.controller_id)
        .ok_or(RigError::UnknownController(cmd.controller_id))?;
    controller.send_request_abortable(cmd, Some(signal)).await
}

#[cfg(test)]
mod tests {
    use filigree_protocol::CommandId;

    use super::*;
    use crate::config::{RigConfig, RigConfigBuilder};
    use crate::router::RequestIds;
    use crate::simulator::SimulatedOpener;

    const STEP_DELAY: Duration = Duration::from_secs(5);

    fn config() -> RigConfig {
        RigConfigBuilder::default()
            .with_settle_delay(Duration::from_millis(10))
            .build()
    }

    async fn rig(sim: &SimulatedOpener, count: u32) -> Vec<Arc<Controller>> {
        let ids = Arc::new(RequestIds::new());
        let mut controllers = Vec::new();
        for id in 0..count {
            let ctl = Arc::new(Controller::new(id, ids.clone(), Arc::new(sim.clone()), &config()));
            ctl.open_port().await.unwrap();
            controllers.push(ctl);
        }
        controllers
    }

    fn moves(count: u32) -> Vec<Command> {
        (0..count)
            .map(|i| Command::new(CommandId::MotorAbsoluteMove, 0, i % 4, 10.0 * (i + 1) as f64))
            .collect()
    }

    fn moves_received(sim: &SimulatedOpener, controller: u32) -> Vec<Command> {
        sim.received(controller)
            .into_iter()
            .filter(|c| c.is_move())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn plays_to_the_end() {
        let sim = SimulatedOpener::new(4);
        let controllers = rig(&sim, 2).await;
        let mut seq = moves(2);
        seq.push(Command::new(CommandId::MotorAbsoluteMove, 1, 3, 45.0));

        let player = Player::new(STEP_DELAY);
        let report = player.start(&seq, &controllers, 0).await;
        assert_eq!(
            report,
            PlaybackReport {
                executed: 3,
                failed: 0,
                completed: true,
                cursor: 2,
            }
        );
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(moves_received(&sim, 0).len(), 2);
        assert_eq!(sim.angle(1, 3), Some(45.0));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_after_a_step_stops_the_wire() {
        let sim = SimulatedOpener::new(4);
        let controllers = rig(&sim, 1).await;
        let seq = moves(5);
        let player = Player::new(STEP_DELAY);

        let pauser = {
            let player = player.clone();
            let mut cursor = player.subscribe_cursor();
            async move {
                cursor.wait_for(|c| *c == 3).await.unwrap();
                player.pause();
            }
        };
        let (report, ()) = tokio::join!(player.start(&seq, &controllers, 2), pauser);

        assert_eq!(report.cursor, 3);
        assert_eq!(report.executed, 1);
        assert!(!report.completed);
        let sent = moves_received(&sim, 0);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].param, seq[2].param);

        // Nothing more goes out while paused.
        tokio::time::sleep(STEP_DELAY * 3).await;
        assert_eq!(moves_received(&sim, 0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_skipped() {
        let sim = SimulatedOpener::new(4);
        let controllers = rig(&sim, 1).await;
        let seq = vec![
            Command::new(CommandId::MotorAbsoluteMove, 0, 9, 1.0),
            Command::new(CommandId::MotorAbsoluteMove, 7, 0, 1.0),
            Command::new(CommandId::MotorAbsoluteMove, 0, 1, 5.0),
        ];
        let report = Player::new(Duration::ZERO)
            .start(&seq, &controllers, 0)
            .await;
        assert_eq!(report.executed, 1);
        assert_eq!(report.failed, 2);
        assert!(report.completed);
        assert_eq!(sim.angle(0, 1), Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_gives_up_on_the_step_in_flight() {
        let sim = SimulatedOpener::new(4);
        sim.set_latency(Duration::from_secs(10));
        let controllers = rig(&sim, 1).await;
        let seq = moves(3);
        let player = Player::new(Duration::ZERO);

        let aborter = {
            let player = player.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                player.abort();
            }
        };
        let (report, ()) = tokio::join!(player.start(&seq, &controllers, 0), aborter);
        assert_eq!(report.executed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cursor, 0);
        assert!(controllers[0].pending_requests().is_empty());
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_clamped_and_empty_is_a_no_op() {
        let sim = SimulatedOpener::new(4);
        let controllers = rig(&sim, 1).await;
        let player = Player::new(Duration::ZERO);

        assert_eq!(player.start(&[], &controllers, 3).await, PlaybackReport::default());

        let report = player.start(&moves(2), &controllers, 9).await;
        assert_eq!(report.executed, 1);
        assert_eq!(report.cursor, 1);
        assert!(report.completed);
    }
}
