//! HSSPI framing engine.
//!
//! Turns (type, payload) pairs into correctly sequenced bus exchanges and
//! back. Every exchange is full-duplex: the host header goes out while the
//! device header comes back in the same four bytes.
//!
//! Reading is two-phase. A header-only *pre-read* learns the length of the
//! frame the device wants to send, then a *read* clocks exactly that many
//! bytes. A pre-read can also ride on a write, in which case the next
//! receive skips straight to the read phase.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bus::{Bus, Gpio};
use crate::config::{LinkConfig, pause};
use crate::error::{LinkError, Result};
use crate::protocol::*;

/// Result of a successful pre-read, consumed by the following read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingRead {
    pub awaiting: bool,
    pub announced: usize,
}

impl PendingRead {
    fn announce(length: u16) -> Self {
        Self {
            awaiting: true,
            announced: length as usize,
        }
    }
}

/// Outbound frame published by a sender so a concurrent read can carry it.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Identifies the publishing send; only it may act on `written`.
    pub ticket: u64,
    pub ty: u8,
    pub data: Arc<[u8]>,
    /// Set once the device acknowledged the frame in a combined exchange.
    pub written: bool,
}

/// Slot shared between the sender and the framing engine.
pub type OutboundSlot = Arc<Mutex<Option<OutboundFrame>>>;

/// Metadata of a received frame; the payload lands in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub ty: u8,
    pub flags: u8,
    pub len: usize,
}

pub struct Hsspi {
    bus: Arc<dyn Bus>,
    gpio: Arc<dyn Gpio>,
    config: LinkConfig,
    pending: PendingRead,
    outbound: OutboundSlot,
}

impl Hsspi {
    pub fn new(bus: Arc<dyn Bus>, gpio: Arc<dyn Gpio>, config: LinkConfig) -> Self {
        Self {
            bus,
            gpio,
            config,
            pending: PendingRead::default(),
            outbound: Arc::new(Mutex::new(None)),
        }
    }

    /// Slot used by the orchestrator to publish combined writes.
    pub fn outbound_slot(&self) -> OutboundSlot {
        Arc::clone(&self.outbound)
    }

    pub fn pending(&self) -> PendingRead {
        self.pending
    }

    /// Forget any pre-read so the next receive starts over.
    pub fn invalidate_pending(&mut self) {
        self.pending = PendingRead::default();
    }

    /// Full-duplex exchange of `host` followed by `data` zero-padded to
    /// `data_len`. Returns everything clocked in.
    fn transfer(&self, host: &LinkHeader, data: &[u8], data_len: usize) -> Result<Vec<u8>> {
        let mut tx = Vec::with_capacity(LinkHeader::SIZE + data_len);
        tx.extend_from_slice(&host.to_bytes());
        tx.extend_from_slice(data);
        tx.resize(LinkHeader::SIZE + data_len, 0);
        let mut rx = vec![0u8; tx.len()];
        trace!(?host, data_len, "HSSPI host header");
        self.bus.exchange(&tx, &mut rx)?;
        Ok(rx)
    }

    fn header_exchange(&self, host: LinkHeader) -> Result<LinkHeader> {
        let rx = self.transfer(&host, &[], 0)?;
        let soc = LinkHeader::from_bytes(&rx)?;
        trace!(?soc, "HSSPI device header");
        Ok(soc)
    }

    /// Wait until the device accepts a transaction.
    ///
    /// Polls the ready line, or the device header over the bus when
    /// configured and no line is wired. Without either, only the inter
    /// exchange delay is applied.
    pub fn wait_ready(&self) -> Result<()> {
        let lines = self.gpio.lines();
        if !lines.ready && !self.config.ready_check_over_bus {
            pause(self.config.hsspi_delay());
            return Ok(());
        }

        let poll = self.config.ready_poll_us.max(1);
        let mut polls = (self.config.ready_timeout_us / poll).max(1);
        let mut ready = false;
        while polls > 0 {
            ready = if lines.ready {
                self.gpio.read_ready()?
            } else {
                self.header_exchange(LinkHeader::default())?
                    .has(SOC_FLAG_RDY)
            };
            if ready {
                break;
            }
            pause(self.config.ready_poll());
            polls -= 1;
        }
        pause(self.config.hsspi_delay());
        if ready {
            Ok(())
        } else {
            debug!("Device not ready in time");
            Err(LinkError::NotReady)
        }
    }

    /// Wake the device up.
    ///
    /// With a low-power line, nothing is done while it reports the device
    /// awake. Without one, only a forced wake-up does anything.
    pub fn wakeup(&self, force: bool) -> Result<()> {
        let lines = self.gpio.lines();
        let awake = if lines.exton {
            self.gpio.read_low_power().unwrap_or(false)
        } else {
            !force
        };
        if awake {
            return Ok(());
        }

        debug!(force, "Waking device");
        if lines.wakeup {
            self.gpio.set_wake(true)?;
            pause(self.config.wakeup_duration());
            self.gpio.set_wake(false)?;
        } else {
            self.bus.exchange(&[], &mut [])?;
            pause(self.config.wakeup_duration());
        }
        pause(self.config.wakeup_delay());
        Ok(())
    }

    /// Write one frame, optionally asking for a pre-read in the same exchange.
    pub fn send(&mut self, ty: u8, payload: &[u8], pre_read: bool) -> Result<()> {
        if payload.is_empty() {
            return Err(LinkError::InvalidArgument("empty payload"));
        }
        if payload.len() > u16::MAX as usize {
            return Err(LinkError::MessageTooLarge {
                len: payload.len(),
                capacity: u16::MAX as usize,
            });
        }
        self.wait_ready()?;

        let mut flags = HOST_FLAG_WR;
        if pre_read {
            flags |= HOST_FLAG_PRD;
        }
        let host = LinkHeader::new(flags, ty, payload.len() as u16);
        let rx = self.transfer(&host, payload, payload.len())?;
        let soc = LinkHeader::from_bytes(&rx)?;
        trace!(?soc, "HSSPI device header");

        if soc.is_asleep() {
            return Err(LinkError::Busy);
        }
        if pre_read && soc.announces_data() {
            self.pending = PendingRead::announce(soc.length);
        }
        if !soc.has(SOC_FLAG_RDY) {
            return Err(LinkError::NotReady);
        }
        Ok(())
    }

    /// Header-only exchange with the pre-read bit set.
    fn pre_read(&mut self) -> Result<()> {
        let soc = self.header_exchange(LinkHeader::new(HOST_FLAG_PRD, 0, 0))?;
        if !soc.announces_data() {
            return Err(LinkError::NotReady);
        }
        self.pending = PendingRead::announce(soc.length);
        Ok(())
    }

    /// Read the device header without asking for anything.
    ///
    /// Leaves the pending pre-read untouched.
    pub fn read_flags(&mut self) -> Result<LinkHeader> {
        self.header_exchange(LinkHeader::default())
    }

    /// Receive one frame into `buf`.
    ///
    /// When combined writes are enabled and a published outbound frame fits
    /// in `buf`, it is written during the read exchange.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        if buf.is_empty() {
            return Err(LinkError::InvalidArgument("empty receive buffer"));
        }
        self.wait_ready()?;
        if !self.pending.awaiting {
            self.pre_read()?;
        }
        let length = self.pending.announced;
        if buf.len() < length {
            self.invalidate_pending();
            return Err(LinkError::MessageTooLarge {
                len: length,
                capacity: buf.len(),
            });
        }
        self.wait_ready()?;

        let mut host = LinkHeader::new(HOST_FLAG_RD, 0, 0);
        let mut out_data: Option<Arc<[u8]>> = None;
        if self.config.combined_write {
            let slot = self.outbound.lock();
            if let Some(out) = slot.as_ref()
                && !out.written
                && out.data.len() <= buf.len()
            {
                host.flags |= HOST_FLAG_WR;
                host.ty = out.ty;
                host.length = out.data.len() as u16;
                out_data = Some(Arc::clone(&out.data));
            }
        }
        let data_len = out_data
            .as_ref()
            .map_or(length, |data| data.len().max(length));
        let tx_data: &[u8] = out_data.as_deref().unwrap_or(&[]);
        let rx = self.transfer(&host, tx_data, data_len)?;
        let soc = LinkHeader::from_bytes(&rx)?;
        trace!(?soc, "HSSPI device header");

        if out_data.is_some() && soc.has(SOC_FLAG_RDY) {
            if let Some(out) = self.outbound.lock().as_mut() {
                out.written = true;
            }
            debug!("Combined write acknowledged");
        }

        let result = if soc.length as usize != length {
            Err(LinkError::ProtocolMismatch {
                announced: length,
                actual: soc.length as usize,
            })
        } else if !soc.has(SOC_FLAG_OA) {
            Err(LinkError::NotReady)
        } else {
            Ok(())
        };
        if matches!(result, Ok(()) | Err(LinkError::ProtocolMismatch { .. }))
            || soc.has(SOC_FLAG_ODW)
        {
            self.invalidate_pending();
        }
        result?;

        let start = LinkHeader::SIZE;
        buf[..length].copy_from_slice(&rx[start..start + length]);
        Ok(Received {
            ty: soc.ty,
            flags: soc.flags,
            len: length,
        })
    }
}
