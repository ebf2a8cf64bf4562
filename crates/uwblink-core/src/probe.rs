//! UCI probing of a freshly reset device.
//!
//! While probing, a temporary High priority handler owns the application
//! channel. It completes synchronous commands and tracks DEVICE_STATUS
//! notifications.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::device::DeviceCore;
use crate::dispatch::FrameHandler;
use crate::error::{LinkError, Result};
use crate::protocol::uci::{self, DeviceInfo};
use crate::protocol::{Frame, MessageType, Priority};
use crate::state::{DeviceState, StateCell};

#[derive(Default)]
struct Completion {
    /// A command was sent and its response not seen yet.
    waiting: bool,
    done: bool,
    status: u8,
    info: Option<DeviceInfo>,
}

/// Handler installed on the application channel during probing.
pub struct ProbeHandler {
    state: Arc<StateCell>,
    completion: Mutex<Completion>,
    cond: Condvar,
}

impl ProbeHandler {
    pub fn new(state: Arc<StateCell>) -> Self {
        Self {
            state,
            completion: Mutex::new(Completion::default()),
            cond: Condvar::new(),
        }
    }

    fn arm(&self) {
        *self.completion.lock() = Completion {
            waiting: true,
            ..Default::default()
        };
    }

    fn complete(&self, status: u8, info: Option<DeviceInfo>) {
        let mut completion = self.completion.lock();
        if !completion.waiting {
            debug!(status, "Response without pending command ignored");
            return;
        }
        completion.waiting = false;
        completion.done = true;
        completion.status = status;
        completion.info = info;
        self.cond.notify_all();
    }

    /// Wait for the response. A timeout reads as MESSAGE_RETRY.
    fn wait(&self, timeout: Duration) -> (u8, Option<DeviceInfo>) {
        let deadline = Instant::now() + timeout;
        let mut completion = self.completion.lock();
        while !completion.done {
            if self.cond.wait_until(&mut completion, deadline).timed_out() {
                break;
            }
        }
        completion.waiting = false;
        if !completion.done {
            return (uci::UCI_STATUS_MESSAGE_RETRY, None);
        }
        completion.done = false;
        (completion.status, completion.info.take())
    }
}

impl FrameHandler for ProbeHandler {
    fn handle(&self, frame: Frame) {
        let (packets, tail) = uci::split_packets(&frame.data);
        for packet in packets {
            let status = packet
                .payload
                .first()
                .copied()
                .unwrap_or(uci::UCI_STATUS_SYNTAX_ERROR);
            match packet.id {
                uci::DEVICE_RESET_RSP => {
                    // Firmware restarts: Ready must be reported again.
                    if status != uci::UCI_STATUS_REJECTED {
                        self.state.set(DeviceState::Unknown);
                    }
                    self.complete(status, None)
                }
                uci::GET_DEVICE_INFO_RSP => {
                    if status != uci::UCI_STATUS_OK {
                        self.complete(status, None);
                        continue;
                    }
                    match DeviceInfo::parse(&packet.payload[1..]) {
                        Some(info) => self.complete(status, Some(info)),
                        None => self.complete(uci::UCI_STATUS_SYNTAX_ERROR, None),
                    }
                }
                uci::DEVICE_STATUS_NTF => match packet.payload.first() {
                    Some(&value) => self.state.set(DeviceState::from_uci(value)),
                    None => warn!("Empty DEVICE_STATUS notification"),
                },
                id => info!(id = %format!("{id:#06x}"), "Unexpected UCI packet while probing"),
            }
        }
        if tail != 0 {
            warn!(tail, "Truncated UCI packet while probing");
        }
    }
}

/// Synchronous command runner used by probing.
pub struct Prober {
    lock: Mutex<()>,
    probe_timeout: Duration,
    state_timeout: Duration,
}

impl Prober {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            probe_timeout: config.probe_timeout(),
            state_timeout: config.state_timeout(),
        }
    }

    /// Wait for the firmware to report Ready and fetch its device info.
    ///
    /// `send` must write an application frame without going through the
    /// bypass claim check. The temporary handler is removed whatever the
    /// outcome.
    pub fn probe(&self, core: &DeviceCore, send: &dyn Fn(&[u8]) -> Result<()>) -> Result<DeviceInfo> {
        let handler = Arc::new(ProbeHandler::new(Arc::clone(&core.state)));
        let registered: Arc<dyn FrameHandler> = handler.clone();
        core.handlers
            .register(MessageType::Application, Priority::High, Arc::clone(&registered))?;

        let result = self.run(core, &handler, send);

        if let Err(e) = core
            .handlers
            .unregister(MessageType::Application, Priority::High, &registered)
        {
            warn!(error = %e, "Probe handler already gone");
        }
        result
    }

    fn run(
        &self,
        core: &DeviceCore,
        handler: &ProbeHandler,
        send: &dyn Fn(&[u8]) -> Result<()>,
    ) -> Result<DeviceInfo> {
        let mut soft_reset_sent = false;
        while !core.state.wait_for(DeviceState::Ready, self.state_timeout) {
            if soft_reset_sent {
                warn!("Device never reported ready");
                return Err(LinkError::Timeout);
            }
            info!("No ready notification, sending soft reset");
            match self.command(handler, send, &uci::device_reset_cmd()) {
                // Firmware without soft reset support.
                Ok(_) | Err(LinkError::Uci(uci::UCI_STATUS_REJECTED)) => {}
                Err(e) => {
                    core.state.set(DeviceState::Unknown);
                    warn!(error = %e, "Soft reset failed");
                    return Err(e);
                }
            }
            soft_reset_sent = true;
        }

        self.command(handler, send, &uci::device_info_cmd())?
            .ok_or(LinkError::Uci(uci::UCI_STATUS_SYNTAX_ERROR))
    }

    fn command(
        &self,
        handler: &ProbeHandler,
        send: &dyn Fn(&[u8]) -> Result<()>,
        cmd: &[u8],
    ) -> Result<Option<DeviceInfo>> {
        let _guard = self.lock.lock();
        handler.arm();
        send(cmd)?;
        let (status, info) = handler.wait(self.probe_timeout);
        if status != uci::UCI_STATUS_OK {
            debug!(status, "Command failed");
            return Err(LinkError::Uci(status));
        }
        Ok(info)
    }
}
