//! Getting hold of a byte stream for each controller.

use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt as _;

use crate::config::RigConfig;
use crate::error::RigError;

/// A bidirectional byte stream to one controller.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Port for T {}

pub type BoxedPort = Box<dyn Port>;

/// Finds and opens the device behind a controller id.
pub trait PortOpener: Send + Sync {
    fn open(&self, controller_id: u32) -> BoxFuture<'_, Result<BoxedPort, RigError>>;
}

/// Opens real serial devices, one configured path per controller.
pub struct SerialOpener {
    ports: Vec<Option<String>>,
    baud_rate: u32,
}

impl SerialOpener {
    pub fn new(config: &RigConfig) -> Self {
        Self {
            ports: config.ports.clone(),
            baud_rate: config.baud_rate,
        }
    }

    /// Names of the serial devices currently present on the system.
    pub fn available_ports() -> io::Result<Vec<String>> {
        let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

impl PortOpener for SerialOpener {
    fn open(&self, controller_id: u32) -> BoxFuture<'_, Result<BoxedPort, RigError>> {
        Box::pin(async move {
            let path = self
                .ports
                .get(controller_id as usize)
                .and_then(Option::as_deref)
                .ok_or(RigError::NoPortConfigured(controller_id))?;
            log::info!(
                "opening {path} at {} baud for controller {controller_id}",
                self.baud_rate
            );
            let stream = tokio_serial::new(path, self.baud_rate)
                .open_native_async()
                .map_err(io::Error::from)?;
            Ok(Box::new(stream) as BoxedPort)
        })
    }
}
