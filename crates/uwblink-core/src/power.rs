//! Usage-counted power management.
//!
//! The device is runtime-suspended whenever nobody holds a usage reference
//! and no transfer is in flight. Suspending cuts the supply, masks the
//! interrupt and, when configured, holds the device in reset.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bus::Gpio;
use crate::config::{LinkConfig, pause};
use crate::error::{LinkError, Result};
use crate::worker::Worker;

/// Interrupt masking as seen by the power manager.
pub trait IrqLine: Send + Sync {
    fn enable(&self);
    fn disable(&self);
}

impl<C: Send + 'static> IrqLine for Worker<C> {
    fn enable(&self) {
        self.enable_irq();
    }

    fn disable(&self) {
        self.disable_irq();
    }
}

#[derive(Debug, Clone, Copy)]
struct PmState {
    usage: u32,
    suspended: bool,
    supply: u32,
}

pub struct PowerManager {
    gpio: Arc<dyn Gpio>,
    irq: Arc<dyn IrqLine>,
    config: LinkConfig,
    state: Mutex<PmState>,
}

impl PowerManager {
    /// The device starts suspended with its interrupt masked.
    pub fn new(gpio: Arc<dyn Gpio>, irq: Arc<dyn IrqLine>, config: LinkConfig) -> Self {
        Self {
            gpio,
            irq,
            config,
            state: Mutex::new(PmState {
                usage: 0,
                suspended: true,
                supply: 0,
            }),
        }
    }

    /// Take a usage reference, resuming the device if needed.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.suspended {
            self.runtime_resume(&mut state)?;
        }
        state.usage += 1;
        debug!(usage = state.usage, "Power reference taken");
        Ok(())
    }

    /// Drop a usage reference, suspending the device on the last one.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.usage == 0 {
            return Err(LinkError::InvalidArgument("power stop without start"));
        }
        state.usage -= 1;
        debug!(usage = state.usage, "Power reference dropped");
        if state.usage == 0 && !state.suspended {
            self.runtime_suspend(&mut state)?;
        }
        Ok(())
    }

    /// Resume for one transfer.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.suspended {
            self.runtime_resume(&mut state)?;
        }
        Ok(())
    }

    /// Transfer done: suspend again unless someone holds a reference.
    pub fn idle(&self) {
        let mut state = self.state.lock();
        if state.usage == 0
            && !state.suspended
            && let Err(e) = self.runtime_suspend(&mut state)
        {
            debug!(error = %e, "Suspend failed");
        }
    }

    pub fn started(&self) -> bool {
        self.state.lock().usage > 0
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    fn runtime_resume(&self, state: &mut PmState) -> Result<()> {
        trace!("Runtime resume");
        self.supply(state, true)?;
        self.irq.enable();
        if self.config.reset_on_suspend {
            self.gpio.set_reset(false)?;
            pause(self.config.reset_backoff());
        }
        state.suspended = false;
        Ok(())
    }

    fn runtime_suspend(&self, state: &mut PmState) -> Result<()> {
        trace!("Runtime suspend");
        self.supply(state, false)?;
        self.irq.disable();
        if self.config.reset_on_suspend {
            self.gpio.set_reset(true)?;
            pause(self.config.reset_duration());
        }
        state.suspended = true;
        Ok(())
    }

    /// Reference-counted supply switch; only 0 <-> 1 transitions reach the
    /// regulator.
    fn supply(&self, state: &mut PmState, on: bool) -> Result<()> {
        if on {
            state.supply += 1;
            if state.supply != 1 {
                return Ok(());
            }
        } else {
            if state.supply == 0 {
                return Ok(());
            }
            state.supply -= 1;
            if state.supply != 0 {
                return Ok(());
            }
        }
        self.gpio.set_supply(on)?;
        pause(self.config.regulator_delay());
        Ok(())
    }
}
