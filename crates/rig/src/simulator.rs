//! An in-process stand-in for the controller boards.
//!
//! Each opened port is one end of an in-memory pipe; the other end is driven
//! by a task that speaks the line protocol the way the firmware does.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use filigree_protocol::{decode_line, encode_fields, Command, CommandId, MotorType};
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream};
use tokio::sync::oneshot;

use crate::error::RigError;
use crate::transport::{BoxedPort, PortOpener};

/// Error code for a motor id the board doesn't have.
pub const NO_SUCH_MOTOR: u32 = 0x100;
/// Error code for a command id the board doesn't know, or a bad parameter.
pub const BAD_COMMAND: u32 = 0x200;

const MOVE_TIME: Duration = Duration::from_millis(200);
const RESET_TIME: Duration = Duration::from_millis(50);
const PIPE_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Default)]
struct SimMotor {
    angle: f64,
    motor_type: u32,
    settings: HashMap<u32, u32>,
}

struct Board {
    motors: Vec<SimMotor>,
    received: Vec<Command>,
    silent: bool,
    missing: bool,
    refused: Vec<u32>,
    unplug: Option<oneshot::Sender<()>>,
}

impl Board {
    fn new(motor_count: u32) -> Board {
        Board {
            motors: vec![SimMotor::default(); motor_count as usize],
            received: Vec::new(),
            silent: false,
            missing: false,
            refused: Vec::new(),
            unplug: None,
        }
    }
}

struct Shared {
    motor_count: u32,
    move_time: Duration,
    boards: HashMap<u32, Board>,
}

/// Opens simulated boards, each with `motor_count` motors.
///
/// Board state (motor angles, types and settings) outlives a connection, so
/// a reconnect finds things where they were left.
#[derive(Clone)]
pub struct SimulatedOpener {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedOpener {
    pub fn new(motor_count: u32) -> Self {
        SimulatedOpener {
            shared: Arc::new(Mutex::new(Shared {
                motor_count,
                move_time: MOVE_TIME,
                boards: HashMap::new(),
            })),
        }
    }

    fn with_board<T>(&self, controller_id: u32, f: impl FnOnce(&mut Board) -> T) -> T {
        let mut shared = lock(&self.shared);
        let count = shared.motor_count;
        f(shared
            .boards
            .entry(controller_id)
            .or_insert_with(|| Board::new(count)))
    }

    /// How long a move takes to answer.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.shared).move_time = latency;
    }

    /// A silent board reads everything and answers nothing.
    pub fn set_silent(&self, controller_id: u32, silent: bool) {
        self.with_board(controller_id, |b| b.silent = silent);
    }

    /// A missing board can't be opened.
    pub fn set_missing(&self, controller_id: u32, missing: bool) {
        self.with_board(controller_id, |b| b.missing = missing);
    }

    /// Makes the board answer every `command` with [`BAD_COMMAND`].
    pub fn refuse(&self, controller_id: u32, command: CommandId) {
        self.with_board(controller_id, |b| b.refused.push(command.into()));
    }

    pub fn set_motor_type(&self, controller_id: u32, motor_id: u32, motor_type: MotorType) {
        self.with_board(controller_id, |b| {
            if let Some(m) = b.motors.get_mut(motor_id as usize) {
                m.motor_type = motor_type as u32;
            }
        });
    }

    /// Everything the board has read so far, in order.
    pub fn received(&self, controller_id: u32) -> Vec<Command> {
        self.with_board(controller_id, |b| b.received.clone())
    }

    pub fn angle(&self, controller_id: u32, motor_id: u32) -> Option<f64> {
        self.with_board(controller_id, |b| {
            b.motors.get(motor_id as usize).map(|m| m.angle)
        })
    }

    /// Yanks the cable: the host sees end-of-file.
    pub fn unplug(&self, controller_id: u32) {
        if let Some(tx) = self.with_board(controller_id, |b| b.unplug.take()) {
            let _ = tx.send(());
        }
    }
}

impl PortOpener for SimulatedOpener {
    fn open(&self, controller_id: u32) -> BoxFuture<'_, Result<BoxedPort, RigError>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            let missing = self.with_board(controller_id, |b| {
                if !b.missing {
                    b.unplug = Some(tx);
                }
                b.missing
            });
            if missing {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no simulated board for controller {controller_id}"),
                )
                .into());
            }
            log::info!("opening simulated board for controller {controller_id}");

            let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(run_board(self.shared.clone(), controller_id, device, rx));
            Ok(Box::new(host) as BoxedPort)
        })
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_board(
    shared: Arc<Mutex<Shared>>,
    controller_id: u32,
    device: DuplexStream,
    mut unplug: oneshot::Receiver<()>,
) {
    let (rd, mut wr) = tokio::io::split(device);
    let mut lines = BufReader::new(rd).lines();
    let _ = wr.write_all(b"# simulated board ready\n").await;

    let work = async {
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(cmd) = decode_line(line.trim()) else {
                continue;
            };
            let Some((wait, reply)) = execute(&shared, controller_id, cmd) else {
                continue;
            };
            tokio::time::sleep(wait).await;
            if wr.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = work => {}
        _ = &mut unplug => log::debug!("simulated board {controller_id} unplugged"),
    }
}

/// Applies one command to the board and works out the reply and how long
/// it takes. None means no reply at all.
fn execute(shared: &Mutex<Shared>, controller_id: u32, cmd: Command) -> Option<(Duration, String)> {
    let mut shared = lock(shared);
    let count = shared.motor_count;
    let move_time = shared.move_time;
    let board = shared
        .boards
        .entry(controller_id)
        .or_insert_with(|| Board::new(count));
    board.received.push(cmd);
    if board.silent {
        return None;
    }

    let mut wait = Duration::ZERO;
    let outcome = match cmd.kind() {
        None => Err(BAD_COMMAND),
        Some(_) if board.refused.contains(&cmd.command_id) => Err(BAD_COMMAND),
        Some(CommandId::MotorsInitialize) => {
            for m in &mut board.motors {
                m.angle = 0.0;
            }
            Ok(0)
        }
        Some(CommandId::MotorsCount) => Ok(board.motors.len() as u32),
        Some(CommandId::MotorDelay) => {
            wait = Duration::from_millis(cmd.param.max(0.0) as u64);
            Ok(0)
        }
        Some(kind) => match board.motors.get_mut(cmd.motor_id as usize) {
            None => Err(NO_SUCH_MOTOR),
            Some(m) => {
                if kind.is_motion() {
                    wait = if kind == CommandId::MotorReset {
                        RESET_TIME
                    } else {
                        move_time
                    };
                }
                apply(m, kind, &cmd)
            }
        },
    };

    let (error, result) = match outcome {
        Ok(result) => (0, result),
        Err(code) => (code, 0),
    };
    let mut reply = String::new();
    if cmd.kind() == Some(CommandId::MotorsInitialize) {
        reply.push_str("# motors initialized\n");
    }
    reply.push_str(&encode_fields(&[
        cmd.request_id.into(),
        error.into(),
        result.into(),
        0,
        0,
    ]));
    Some((wait, reply))
}

fn apply(m: &mut SimMotor, kind: CommandId, cmd: &Command) -> Result<u32, u32> {
    match kind {
        CommandId::MotorStatus | CommandId::MotorAlerts => Ok(0),
        CommandId::MotorAbsoluteMove | CommandId::MotorCutMove => {
            m.angle = cmd.param;
            Ok(0)
        }
        CommandId::MotorRelativeMove => {
            m.angle += cmd.param;
            Ok(0)
        }
        CommandId::MotorReset => {
            m.angle = 0.0;
            Ok(0)
        }
        CommandId::MotorGetType => Ok(m.motor_type),
        CommandId::MotorSetType => {
            let ty = MotorType::from_u32(cmd.param as u32).ok_or(BAD_COMMAND)?;
            m.motor_type = ty as u32;
            Ok(0)
        }
        CommandId::MotorSetVelocity
        | CommandId::MotorSetAcceleration
        | CommandId::MotorSetCuttingAcceleration
        | CommandId::MotorSetResolution => {
            m.settings.insert(cmd.command_id, cmd.param.max(0.0) as u32);
            Ok(0)
        }
        // Each getter sits right after its setter.
        CommandId::MotorGetVelocity
        | CommandId::MotorGetAcceleration
        | CommandId::MotorGetCuttingAcceleration
        | CommandId::MotorGetResolution => {
            Ok(m.settings.get(&(cmd.command_id - 1)).copied().unwrap_or(0))
        }
        _ => Err(BAD_COMMAND),
    }
}
