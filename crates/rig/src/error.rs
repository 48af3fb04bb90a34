use filigree_protocol::FormatError;

/// Why a single request didn't produce a result.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Request timed out")]
    TimedOut,
    #[error("request aborted")]
    Aborted,
    #[error("controller disconnected")]
    Disconnected,
    #[error("device reported error {code:#x}")]
    Device { code: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum RigError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("controller {0} is not connected")]
    NotConnected(u32),
    #[error("no controller with id {0}")]
    UnknownController(u32),
    #[error("the motor's controller no longer exists")]
    ControllerGone,
    #[error("no motor at position {0}")]
    UnknownMotor(usize),
    #[error("{0} is not a valid motor type")]
    InvalidMotorType(u32),
    #[error("no serial port configured for controller {0}")]
    NoPortConfigured(u32),
    #[error(transparent)]
    Format(#[from] FormatError),
}

pub type Result<T> = std::result::Result<T, RigError>;
