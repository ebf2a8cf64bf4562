//! Device lifecycle state, as last reported by the firmware.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::protocol::uci;

/// Firmware state from the last DEVICE_STATUS notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Unknown,
    Ready,
    Active,
    Error,
}

impl DeviceState {
    /// Map a DEVICE_STATUS notification value.
    pub fn from_uci(value: u8) -> Self {
        match value {
            uci::UCI_DEVICE_STATE_READY => DeviceState::Ready,
            uci::UCI_DEVICE_STATE_ACTIVE => DeviceState::Active,
            uci::UCI_DEVICE_STATE_ERROR => DeviceState::Error,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unknown => write!(f, "UNKNOWN"),
            DeviceState::Ready => write!(f, "READY"),
            DeviceState::Active => write!(f, "ACTIVE"),
            DeviceState::Error => write!(f, "ERROR"),
        }
    }
}

/// Shared state with blocking waits for a given value.
#[derive(Default)]
pub struct StateCell {
    state: Mutex<DeviceState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: DeviceState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = %*current, to = %state, "Device state changed");
        }
        *current = state;
        self.changed.notify_all();
    }

    pub fn get(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Wait until the state equals `target`. Returns false on timeout.
    pub fn wait_for(&self, target: DeviceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.state.lock();
        while *current != target {
            if self.changed.wait_until(&mut current, deadline).timed_out() {
                return *current == target;
            }
        }
        true
    }
}
