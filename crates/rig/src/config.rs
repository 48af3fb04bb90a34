use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything tunable about talking to the rig.
///
/// Deserializes from JSON with every field optional, e.g.
/// `{"ports": ["/dev/ttyACM0", null], "step_delay_ms": 500}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// One entry per controller, in controller id order.
    pub ports: Vec<Option<String>>,
    pub baud_rate: u32,
    /// How long a freshly opened board needs before it listens.
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub motion_timeout_ms: u64,
    /// Pause between playback steps.
    pub step_delay_ms: u64,
}

impl Default for RigConfig {
    fn default() -> Self {
        RigConfigBuilder::default().build()
    }
}

impl RigConfig {
    pub fn controller_count(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, controller_id: u32) -> Option<&str> {
        self.ports.get(controller_id as usize)?.as_deref()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

pub struct RigConfigBuilder {
    ports: Vec<Option<String>>,
    baud_rate: u32,
    settle_delay_ms: u64,
    poll_interval_ms: u64,
    read_timeout_ms: u64,
    query_timeout_ms: u64,
    motion_timeout_ms: u64,
    step_delay_ms: u64,
}

impl Default for RigConfigBuilder {
    fn default() -> Self {
        Self {
            ports: vec![None, None],
            baud_rate: 9600,
            settle_delay_ms: 2000,
            poll_interval_ms: 10,
            read_timeout_ms: 50,
            query_timeout_ms: 1000,
            motion_timeout_ms: 30_000,
            step_delay_ms: 1000,
        }
    }
}

impl RigConfigBuilder {
    pub fn build(&self) -> RigConfig {
        RigConfig {
            ports: self.ports.clone(),
            baud_rate: self.baud_rate,
            settle_delay_ms: self.settle_delay_ms,
            poll_interval_ms: self.poll_interval_ms,
            read_timeout_ms: self.read_timeout_ms,
            query_timeout_ms: self.query_timeout_ms,
            motion_timeout_ms: self.motion_timeout_ms,
            step_delay_ms: self.step_delay_ms,
        }
    }

    /// Sets the number of controllers, keeping any ports already configured.
    pub fn with_controllers(&mut self, count: usize) -> &mut Self {
        self.ports.resize(count, None);
        self
    }

    pub fn with_port(&mut self, controller_id: u32, path: impl Into<String>) -> &mut Self {
        let idx = controller_id as usize;
        if self.ports.len() <= idx {
            self.ports.resize(idx + 1, None);
        }
        self.ports[idx] = Some(path.into());
        self
    }

    pub fn with_baud_rate(&mut self, baud_rate: u32) -> &mut Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_settle_delay(&mut self, delay: Duration) -> &mut Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_query_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_motion_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.motion_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_step_delay(&mut self, delay: Duration) -> &mut Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_controllers_by_default() {
        let cfg = RigConfig::default();
        assert_eq!(cfg.controller_count(), 2);
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.port(0), None);
    }

    #[test]
    fn with_port_grows_the_controller_list() {
        let cfg = RigConfigBuilder::default()
            .with_port(3, "/dev/ttyACM3")
            .build();
        assert_eq!(cfg.controller_count(), 4);
        assert_eq!(cfg.port(3), Some("/dev/ttyACM3"));
        assert_eq!(cfg.port(9), None);
    }
}
