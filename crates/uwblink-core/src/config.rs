//! Link configuration, loadable from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Tunables and debug switches of one device link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Extra delay after each ready wait, in microseconds.
    pub hsspi_delay_us: u64,
    /// Poll the device header over the bus when no ready line is wired.
    pub ready_check_over_bus: bool,
    pub ready_timeout_us: u64,
    pub ready_poll_us: u64,
    /// Total attempts for send/recv.
    pub retry_count: u32,
    pub retry_delay_us: u64,
    pub wakeup_duration_us: u64,
    pub wakeup_delay_us: u64,
    pub reset_duration_us: u64,
    pub reset_backoff_us: u64,
    pub reset_ready_polls: u32,
    pub reset_poll_interval_ms: u64,
    pub coredump_grace_ms: u64,
    pub regulator_delay_us: u64,
    pub probe_timeout_ms: u64,
    pub state_timeout_ms: u64,
    pub max_packet_size: usize,
    /// CPU the worker thread is pinned to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<usize>,
    /// Request SCHED_FIFO for the worker thread.
    pub realtime: bool,
    /// Piggyback pending writes on read exchanges.
    pub combined_write: bool,
    /// Skip GPIO toggling in reset.
    pub no_reset: bool,
    /// Hold reset while runtime-suspended.
    pub reset_on_suspend: bool,
    pub no_probing: bool,
    pub no_fw_update: bool,
    pub force_fw_update: bool,
    /// Firmware image tried before the device-id derived list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_name: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hsspi_delay_us: 0,
            ready_check_over_bus: false,
            ready_timeout_us: READY_TIMEOUT_US,
            ready_poll_us: READY_POLL_US,
            retry_count: RETRY_COUNT,
            retry_delay_us: RETRY_DELAY_US,
            wakeup_duration_us: WAKEUP_DURATION_US,
            wakeup_delay_us: WAKEUP_DELAY_US,
            reset_duration_us: RESET_DURATION_US,
            reset_backoff_us: RESET_BACKOFF_US,
            reset_ready_polls: RESET_READY_POLLS,
            reset_poll_interval_ms: RESET_POLL_INTERVAL_MS,
            coredump_grace_ms: COREDUMP_GRACE_MS,
            regulator_delay_us: 0,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            state_timeout_ms: STATE_TIMEOUT_MS,
            max_packet_size: MAX_PACKET_SIZE,
            cpu: None,
            realtime: true,
            combined_write: false,
            no_reset: false,
            reset_on_suspend: true,
            no_probing: false,
            no_fw_update: false,
            force_fw_update: false,
            fw_name: None,
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration with every delay collapsed, for simulated devices.
    pub fn fast() -> Self {
        Self {
            ready_timeout_us: 100,
            ready_poll_us: 1,
            retry_delay_us: 1,
            wakeup_duration_us: 0,
            wakeup_delay_us: 0,
            reset_duration_us: 0,
            reset_backoff_us: 0,
            reset_poll_interval_ms: 0,
            coredump_grace_ms: 0,
            probe_timeout_ms: 200,
            state_timeout_ms: 200,
            realtime: false,
            ..Self::default()
        }
    }

    pub fn hsspi_delay(&self) -> Duration {
        Duration::from_micros(self.hsspi_delay_us)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_micros(self.ready_timeout_us)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_micros(self.ready_poll_us)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_micros(self.retry_delay_us)
    }

    pub fn wakeup_duration(&self) -> Duration {
        Duration::from_micros(self.wakeup_duration_us)
    }

    pub fn wakeup_delay(&self) -> Duration {
        Duration::from_micros(self.wakeup_delay_us)
    }

    pub fn reset_duration(&self) -> Duration {
        Duration::from_micros(self.reset_duration_us)
    }

    pub fn reset_backoff(&self) -> Duration {
        Duration::from_micros(self.reset_backoff_us)
    }

    pub fn reset_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reset_poll_interval_ms)
    }

    pub fn coredump_grace(&self) -> Duration {
        Duration::from_millis(self.coredump_grace_ms)
    }

    pub fn regulator_delay(&self) -> Duration {
        Duration::from_micros(self.regulator_delay_us)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }
}

/// Sleep helper skipping zero delays.
pub(crate) fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
