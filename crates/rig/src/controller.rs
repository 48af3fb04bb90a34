use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use filigree_protocol::{Command, CommandId, MotorType};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RigConfig;
use crate::error::{RequestError, Result, RigError};
use crate::reader::LineReader;
use crate::router::{AbortSignal, RequestIds, Router};
use crate::transport::{BoxedPort, PortOpener};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-motor tuning values stored on the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Setting {
    Velocity,
    Acceleration,
    CuttingAcceleration,
    Resolution,
}

impl Setting {
    fn setter(self) -> CommandId {
        match self {
            Setting::Velocity => CommandId::MotorSetVelocity,
            Setting::Acceleration => CommandId::MotorSetAcceleration,
            Setting::CuttingAcceleration => CommandId::MotorSetCuttingAcceleration,
            Setting::Resolution => CommandId::MotorSetResolution,
        }
    }

    fn getter(self) -> CommandId {
        match self {
            Setting::Velocity => CommandId::MotorGetVelocity,
            Setting::Acceleration => CommandId::MotorGetAcceleration,
            Setting::CuttingAcceleration => CommandId::MotorGetCuttingAcceleration,
            Setting::Resolution => CommandId::MotorGetResolution,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Timing {
    settle_delay: Duration,
    poll_interval: Duration,
    read_timeout: Duration,
    query_timeout: Duration,
    motion_timeout: Duration,
}

impl From<&RigConfig> for Timing {
    fn from(cfg: &RigConfig) -> Self {
        Timing {
            settle_delay: cfg.settle_delay(),
            poll_interval: cfg.poll_interval(),
            read_timeout: cfg.read_timeout(),
            query_timeout: cfg.query_timeout(),
            motion_timeout: cfg.motion_timeout(),
        }
    }
}

struct Status {
    state: ConnectionState,
    motor_count: u32,
}

/// The part of a controller that its poll loop shares.
struct Link {
    id: u32,
    router: Router,
    status: Mutex<Status>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Link {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Disconnected -> Connecting. False if we weren't disconnected.
    fn begin_connecting(&self) -> bool {
        let mut status = self.status();
        if status.state != ConnectionState::Disconnected {
            return false;
        }
        status.state = ConnectionState::Connecting;
        drop(status);
        self.state_tx.send_replace(ConnectionState::Connecting);
        true
    }

    /// Connecting -> Connected. False if the link dropped in the meantime.
    fn finish_connecting(&self, motor_count: u32) -> bool {
        let mut status = self.status();
        if status.state != ConnectionState::Connecting {
            return false;
        }
        status.state = ConnectionState::Connected;
        status.motor_count = motor_count;
        drop(status);
        self.state_tx.send_replace(ConnectionState::Connected);
        log::info!("controller {} connected with {motor_count} motors", self.id);
        true
    }

    fn mark_disconnected(&self) {
        let was = {
            let mut status = self.status();
            let was = status.state;
            status.state = ConnectionState::Disconnected;
            status.motor_count = 0;
            was
        };
        self.router.fail_all(RequestError::Disconnected);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            log::info!("controller {} disconnected", self.id);
        }
    }
}

struct Session {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn poll_loop(link: Arc<Link>, port: BoxedPort, mut stop: oneshot::Receiver<()>, timing: Timing) {
    let (rd, mut wr) = tokio::io::split(port);
    let mut reader = LineReader::new(rd);

    let dropped = loop {
        tokio::select! {
            _ = &mut stop => break None,
            res = link.router.poll_once(&mut reader, &mut wr, timing.read_timeout) => {
                if let Err(e) = res {
                    break Some(format!("transport error: {e}"));
                }
            }
        }
        if reader.is_closed() {
            break Some("port closed by the device".to_owned());
        }
        tokio::select! {
            _ = &mut stop => break None,
            _ = tokio::time::sleep(timing.poll_interval) => {}
        }
    };

    let _ = wr.shutdown().await;
    if let Some(reason) = dropped {
        log::warn!("controller {}: {reason}", link.id);
        link.mark_disconnected();
    }
}

/// One physical controller board and the motors hanging off it.
pub struct Controller {
    link: Arc<Link>,
    ids: Arc<RequestIds>,
    opener: Arc<dyn PortOpener>,
    timing: Timing,
    session: Mutex<Option<Session>>,
}

impl Controller {
    pub fn new(
        id: u32,
        ids: Arc<RequestIds>,
        opener: Arc<dyn PortOpener>,
        config: &RigConfig,
    ) -> Self {
        Controller {
            link: Arc::new(Link {
                id,
                router: Router::new(),
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    motor_count: 0,
                }),
                state_tx: watch::channel(ConnectionState::Disconnected).0,
            }),
            ids,
            opener,
            timing: config.into(),
            session: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.link.id
    }

    pub fn state(&self) -> ConnectionState {
        self.link.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Zero until the board has told us, and again after it disconnects.
    pub fn motor_count(&self) -> u32 {
        self.link.status().motor_count
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.link.state_tx.subscribe()
    }

    pub fn next_request_id(&self) -> u32 {
        self.ids.next()
    }

    /// Ids of requests still waiting for an answer.
    pub fn pending_requests(&self) -> Vec<u32> {
        self.link.router.pending_ids()
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the port, waits for the board to boot, starts polling, learns
    /// the motor count and initializes the motors.
    ///
    /// On failure nothing is left running and the controller is disconnected.
    pub async fn open_port(&self) -> Result<()> {
        if !self.link.begin_connecting() {
            log::info!("controller {} is already {:?}", self.id(), self.state());
            return Ok(());
        }
        // A link that dropped on its own leaves a finished poll task behind.
        self.stop_poll_loop().await;

        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("controller {} failed to connect: {e}", self.id());
                self.stop_poll_loop().await;
                self.link.mark_disconnected();
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<()> {
        let port = self.opener.open(self.id()).await?;
        tokio::time::sleep(self.timing.settle_delay).await;

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(poll_loop(self.link.clone(), port, stop_rx, self.timing));
        *self.session() = Some(Session { stop, task });

        let count = self.request(CommandId::MotorsCount, 0, 0.0).await?;
        self.initialize_motors().await?;
        if self.link.finish_connecting(count) {
            Ok(())
        } else {
            Err(RequestError::Disconnected.into())
        }
    }

    async fn stop_poll_loop(&self) {
        let session = self.session().take();
        if let Some(Session { stop, task }) = session {
            let _ = stop.send(());
            if let Err(e) = task.await {
                log::warn!("controller {} poll loop ended badly: {e}", self.id());
            }
        }
    }

    /// Stops polling, closes the port and rejects anything still outstanding.
    /// Does nothing if already disconnected.
    pub async fn close_port(&self) {
        let idle = self.session().is_none();
        if idle && self.state() == ConnectionState::Disconnected {
            return;
        }
        self.stop_poll_loop().await;
        self.link.mark_disconnected();
    }

    fn timeout_for(&self, cmd: &Command) -> Duration {
        match cmd.kind() {
            Some(CommandId::MotorDelay) => {
                self.timing.motion_timeout + Duration::from_millis(cmd.param.max(0.0) as u64)
            }
            Some(kind) if kind.is_motion() => self.timing.motion_timeout,
            _ => self.timing.query_timeout,
        }
    }

    /// Sends `command` under a fresh request id and waits for its result.
    pub async fn send_request(&self, command: Command) -> Result<u32> {
        self.send_request_abortable(command, None).await
    }

    /// Like [`Controller::send_request`], but gives up early if `abort` fires.
    pub async fn send_request_abortable(
        &self,
        command: Command,
        abort: Option<AbortSignal>,
    ) -> Result<u32> {
        if self.session().is_none() || self.state() == ConnectionState::Disconnected {
            return Err(RigError::NotConnected(self.id()));
        }
        let command = command.with_request_id(self.ids.next());
        let timeout = self.timeout_for(&command);
        Ok(self
            .link
            .router
            .send_request(command, timeout, abort)
            .await?)
    }

    pub async fn request(&self, id: CommandId, motor_id: u32, param: f64) -> Result<u32> {
        self.send_request(Command::new(id, self.id(), motor_id, param))
            .await
    }

    pub async fn initialize_motors(&self) -> Result<()> {
        self.request(CommandId::MotorsInitialize, 0, 0.0).await?;
        Ok(())
    }

    /// Asks the board how many motors it drives.
    pub async fn count_motors(&self) -> Result<u32> {
        let count = self.request(CommandId::MotorsCount, 0, 0.0).await?;
        let mut status = self.link.status();
        if status.state == ConnectionState::Connected {
            status.motor_count = count;
        }
        Ok(count)
    }

    pub async fn status(&self, motor_id: u32) -> Result<u32> {
        self.request(CommandId::MotorStatus, motor_id, 0.0).await
    }

    pub async fn alerts(&self, motor_id: u32) -> Result<u32> {
        self.request(CommandId::MotorAlerts, motor_id, 0.0).await
    }

    pub async fn motor_type(&self, motor_id: u32) -> Result<Option<MotorType>> {
        let ty = self.request(CommandId::MotorGetType, motor_id, 0.0).await?;
        Ok(MotorType::from_u32(ty))
    }

    pub async fn configure(&self, setting: Setting, motor_id: u32, value: u32) -> Result<()> {
        self.request(setting.setter(), motor_id, value as f64).await?;
        Ok(())
    }

    pub async fn query(&self, setting: Setting, motor_id: u32) -> Result<u32> {
        self.request(setting.getter(), motor_id, 0.0).await
    }
}
