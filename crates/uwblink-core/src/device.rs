//! Device context and registration.
//!
//! A [`Device`] ties one transport to its handler table, lifecycle state and
//! bypass channel. Registration brings the device up (reset, probe, firmware
//! update) and announces it to the auxiliary modules through a [`Notifier`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bypass::Bypass;
use crate::config::LinkConfig;
use crate::dispatch::{FrameHandler, HandlerTable};
use crate::error::{LinkError, Result};
use crate::notifier::{DeviceEvent, Notifier};
use crate::protocol::{DeviceInfo, Frame, FwVersion, MessageType, Priority};
use crate::state::{DeviceState, StateCell};
use crate::transport::{Transport, UpdateOutcome};

/// State shared between a device and its transport.
///
/// The transport delivers inbound frames here; consumers register their
/// handlers here.
#[derive(Default)]
pub struct DeviceCore {
    pub handlers: HandlerTable,
    pub state: Arc<StateCell>,
    /// Users that keep the device from being unregistered.
    liveness: AtomicUsize,
}

impl DeviceCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one inbound frame.
    pub fn deliver(&self, frame: Frame) -> Result<()> {
        self.handlers.dispatch(frame)
    }

    pub(crate) fn hold(&self) {
        self.liveness.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        let previous = self.liveness.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "liveness underflow");
    }

    pub fn liveness(&self) -> usize {
        self.liveness.load(Ordering::SeqCst)
    }
}

pub struct Device {
    id: u32,
    core: Arc<DeviceCore>,
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    bypass: Bypass,
    info: Mutex<Option<DeviceInfo>>,
}

impl Device {
    /// `core` must be the one the transport delivers frames to.
    pub fn new(
        id: u32,
        transport: Arc<dyn Transport>,
        core: Arc<DeviceCore>,
        config: LinkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            bypass: Bypass::new(Arc::clone(&core), Arc::clone(&transport)),
            core,
            transport,
            config,
            info: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn bypass(&self) -> &Bypass {
        &self.bypass
    }

    pub fn state(&self) -> DeviceState {
        self.core.state.get()
    }

    /// Block until the firmware reports `target`. Returns false on timeout.
    pub fn wait_state(&self, target: DeviceState, timeout: Duration) -> bool {
        self.core.state.wait_for(target, timeout)
    }

    /// Device information from the last successful probe.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.info.lock().clone()
    }

    pub fn firmware_version(&self) -> Option<FwVersion> {
        self.info().and_then(|info| info.firmware()).map(|(v, _)| v)
    }

    /// Bring the device up and announce it.
    ///
    /// On failure the device is announced as deleted again and the
    /// transport's power reference is dropped.
    #[instrument(skip(self, notifier), fields(id = self.id))]
    pub fn register(self: &Arc<Self>, notifier: &Notifier) -> Result<()> {
        info!("Registering device");
        let _ = notifier.notify(DeviceEvent::NewDevice, self);

        if let Err(e) = self.transport.start() {
            warn!(error = %e, "Power up failed");
            self.announce_deleted(notifier);
            return Err(e);
        }

        if let Err(e) = self.bring_up() {
            warn!(error = %e, "Device bring-up failed");
            if let Err(e) = self.transport.stop() {
                debug!(error = %e, "Power down failed");
            }
            self.announce_deleted(notifier);
            return Err(e);
        }

        let _ = notifier.notify(DeviceEvent::DeviceOnline, self);
        // Powered on demand from now on.
        if let Err(e) = self.transport.stop() {
            warn!(error = %e, "Power down failed");
        }
        info!(state = %self.state(), "Device online");
        Ok(())
    }

    /// Announce removal. Refused while the bypass channel is open, or when
    /// a listener vetoes it.
    #[instrument(skip(self, notifier), fields(id = self.id))]
    pub fn unregister(self: &Arc<Self>, notifier: &Notifier) -> Result<()> {
        if self.core.liveness() > 0 {
            warn!(users = self.core.liveness(), "Device still in use");
            return Err(LinkError::Busy);
        }
        notifier.notify(DeviceEvent::DeviceDeleted, self)
    }

    fn announce_deleted(self: &Arc<Self>, notifier: &Notifier) {
        if let Err(e) = notifier.notify(DeviceEvent::DeviceDeleted, self) {
            warn!(error = %e, "Deletion vetoed after failed registration");
        }
    }

    /// Hard reset, probe and firmware update.
    ///
    /// Firmware update runs once, after the first probe. When it flashed an
    /// image or failed, the device is reset and probed a second time, and
    /// that second outcome is final.
    fn bring_up(&self) -> Result<()> {
        let mut rc = self.transport.reset(false);
        if self.config.no_probing {
            debug!("Probing disabled");
            return Ok(());
        }

        let mut current: Option<FwVersion> = None;
        let mut device_id = 0u16;
        let mut tried = false;
        loop {
            if tried {
                rc = self.transport.reset(false);
            }
            if rc.is_ok() {
                rc = self.transport.probe().map(|info| {
                    current = match info.firmware() {
                        Some((version, id)) => {
                            info!(%version, device_id = %format!("{id:#06x}"), "Firmware running");
                            device_id = id;
                            Some(version)
                        }
                        None => {
                            warn!("Device info carries no firmware version");
                            None
                        }
                    };
                    *self.info.lock() = Some(info);
                });
            }
            if tried {
                return rc;
            }
            if let Err(e) = &rc {
                warn!(error = %e, "First probe failed, trying a firmware update");
            }

            let again = match self.transport.fw_update(current, device_id, None) {
                Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
                Err(e) => {
                    warn!(error = %e, "Firmware update failed");
                    true
                }
                Ok(UpdateOutcome::Flashed) => {
                    info!("Firmware flashed, probing again");
                    true
                }
                Ok(outcome) => {
                    debug!(%outcome, "No firmware flashed");
                    false
                }
            };
            tried = true;
            if !again {
                return Ok(());
            }
        }
    }

    pub fn register_handler(
        &self,
        ty: MessageType,
        prio: Priority,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<()> {
        self.core.handlers.register(ty, prio, handler)
    }

    pub fn unregister_handler(
        &self,
        ty: MessageType,
        prio: Priority,
        handler: &Arc<dyn FrameHandler>,
    ) -> Result<()> {
        self.core.handlers.unregister(ty, prio, handler)
    }

    /// Send on behalf of an auxiliary module.
    ///
    /// Fails with `Busy` while the type is claimed by a High priority
    /// handler, which is how the bypass takes over a channel.
    pub fn send(&self, ty: MessageType, data: &[u8]) -> Result<()> {
        if self.core.handlers.has_high_priority(ty) {
            debug!(%ty, "Message type claimed, send refused");
            return Err(LinkError::Busy);
        }
        self.transport.send(ty, data)
    }
}
