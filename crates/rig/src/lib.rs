//! The engine behind the rig: talking to the controller boards over serial,
//! matching their answers to our requests, and recording and replaying
//! sequences of motor commands.

pub mod config;
pub mod controller;
pub mod error;
pub mod motor;
pub mod player;
pub mod reader;
pub mod rig;
pub mod router;
pub mod sequence;
pub mod simulator;
pub mod transport;

pub use config::{RigConfig, RigConfigBuilder};
pub use controller::{ConnectionState, Controller, Setting};
pub use error::{RequestError, Result, RigError};
pub use motor::{clamp_angle, Motor};
pub use player::{PlaybackReport, Player, PlayerState};
pub use reader::LineReader;
pub use rig::Rig;
pub use router::{AbortHandle, AbortSignal, RequestIds, Router};
pub use sequence::Sequence;
pub use simulator::SimulatedOpener;
pub use transport::{BoxedPort, Port, PortOpener, SerialOpener};
