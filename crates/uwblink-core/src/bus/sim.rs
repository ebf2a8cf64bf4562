//! Simulated peripheral speaking the HSSPI handshake.
//!
//! Stands in for real hardware in the CLI and in end-to-end tests: it answers
//! the link protocol, runs a tiny UCI core (reset, status, device info) and
//! raises its interrupt whenever it has a frame for the host. Frames of any
//! type other than UCI are looped back unchanged.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::traits::{Bus, BusError, Gpio, GpioLines};
use crate::protocol::uci::{self, DeviceInfo};
use crate::protocol::*;

type IrqCallback = Arc<dyn Fn() + Send + Sync>;

struct SimState {
    in_reset: bool,
    asleep: bool,
    chip_select_held: bool,
    /// Check exchanges still answered by the boot ROM after a reset.
    bootrom_polls_left: u32,
    boot_polls: u32,
    /// Writes to refuse (RDY cleared) before accepting again.
    refuse_writes: u32,
    outbound: VecDeque<(u8, Vec<u8>)>,
    received: Vec<(u8, Vec<u8>)>,
    info: DeviceInfo,
    reset_status: u8,
}

/// A fake QM35-like device implementing both [`Bus`] and [`Gpio`].
#[derive(Clone)]
pub struct SimPeripheral {
    lines: GpioLines,
    state: Arc<Mutex<SimState>>,
    irq: Arc<Mutex<Option<IrqCallback>>>,
}

impl SimPeripheral {
    pub fn new() -> Self {
        Self::with_lines(GpioLines::default())
    }

    pub fn with_lines(lines: GpioLines) -> Self {
        Self {
            lines,
            state: Arc::new(Mutex::new(SimState {
                in_reset: false,
                asleep: false,
                chip_select_held: false,
                bootrom_polls_left: 0,
                boot_polls: 0,
                refuse_writes: 0,
                outbound: VecDeque::new(),
                received: Vec::new(),
                info: default_info(),
                reset_status: uci::UCI_STATUS_OK,
            })),
            irq: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect the interrupt output to the host.
    pub fn attach_irq<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.irq.lock() = Some(Arc::new(callback));
    }

    /// Queue a device-originated frame and raise the interrupt.
    pub fn push_frame(&self, ty: MessageType, data: &[u8]) {
        self.state.lock().outbound.push_back((ty.as_u8(), data.to_vec()));
        self.raise_irq();
    }

    /// Put the device to sleep; it answers 0xFF until woken.
    pub fn sleep(&self) {
        self.state.lock().asleep = true;
    }

    pub fn is_asleep(&self) -> bool {
        self.state.lock().asleep
    }

    /// Answer the next `count` writes without the ready flag.
    pub fn refuse_writes(&self, count: u32) {
        self.state.lock().refuse_writes = count;
    }

    /// Number of check polls answered by the boot ROM after each reset.
    pub fn set_boot_polls(&self, polls: u32) {
        self.state.lock().boot_polls = polls;
    }

    /// Status returned to CORE_DEVICE_RESET.
    pub fn set_reset_status(&self, status: u8) {
        self.state.lock().reset_status = status;
    }

    pub fn set_device_info(&self, info: DeviceInfo) {
        self.state.lock().info = info;
    }

    /// Frames written by the host, in order.
    pub fn received(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().received.clone()
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().outbound.len()
    }

    fn raise_irq(&self) {
        let callback = self.irq.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Handle a host write; returns true when replies were queued.
    fn handle_write(state: &mut SimState, ty: u8, payload: &[u8]) -> bool {
        state.received.push((ty, payload.to_vec()));
        if ty != MessageType::Application.as_u8() {
            state.outbound.push_back((ty, payload.to_vec()));
            return true;
        }
        let (packets, tail) = uci::split_packets(payload);
        if tail != 0 {
            debug!(tail, "Sim: truncated UCI command ignored");
        }
        let app = MessageType::Application.as_u8();
        let mut queued = false;
        for packet in packets {
            let mt = packet.id >> 13;
            if mt != uci::UCI_MT_COMMAND {
                continue;
            }
            let gid = (packet.id >> 8) & 0x0F;
            let oid = packet.id & 0x3F;
            let rsp = uci::mt_gid_oid(uci::UCI_MT_RESPONSE, gid, oid);
            let mut body = Vec::new();
            match (gid, oid) {
                (uci::UCI_GID_CORE, uci::UCI_OID_CORE_DEVICE_RESET) => {
                    body.push(state.reset_status);
                    state
                        .outbound
                        .push_back((app, uci::build_packet(rsp, &body)));
                    if state.reset_status == uci::UCI_STATUS_OK {
                        state.outbound.push_back((
                            app,
                            uci::build_packet(
                                uci::DEVICE_STATUS_NTF,
                                &[uci::UCI_DEVICE_STATE_READY],
                            ),
                        ));
                    }
                }
                (uci::UCI_GID_CORE, uci::UCI_OID_CORE_GET_DEVICE_INFO) => {
                    body.push(uci::UCI_STATUS_OK);
                    body.extend(state.info.to_bytes());
                    state
                        .outbound
                        .push_back((app, uci::build_packet(rsp, &body)));
                }
                _ => {
                    body.push(uci::UCI_STATUS_OK);
                    state
                        .outbound
                        .push_back((app, uci::build_packet(rsp, &body)));
                }
            }
            queued = true;
        }
        queued
    }
}

impl Default for SimPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

fn default_info() -> DeviceInfo {
    let mut vendor = vec![0u8; DeviceInfo::VENDOR_FULL_SIZE];
    vendor[..4].copy_from_slice(&[1, 4, 0, 0]);
    vendor[47..49].copy_from_slice(&0x0440u16.to_le_bytes());
    DeviceInfo {
        uci_version: 0x0110,
        mac_version: 0x0110,
        phy_version: 0x0110,
        uci_test_version: 0x0110,
        vendor_data: vendor,
    }
}

impl Bus for SimPeripheral {
    fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        rx.fill(0);
        let mut state = self.state.lock();
        if tx.is_empty() {
            // Long chip-select pulse: wakes the device.
            state.asleep = false;
            return Ok(());
        }
        if state.in_reset || state.chip_select_held {
            return Ok(());
        }
        if state.asleep {
            rx.fill(0xFF);
            return Ok(());
        }
        let host = LinkHeader::from_bytes(tx).map_err(|e| BusError::Transfer(e.to_string()))?;
        trace!(?host, "Sim: host header");

        let mut soc = LinkHeader::new(SOC_FLAG_RDY, 0, 0);
        if host.flags == 0 && state.bootrom_polls_left > 0 {
            state.bootrom_polls_left -= 1;
            soc.flags |= SOC_FLAG_BOOTROM_RDY;
        }
        if let Some((ty, data)) = state.outbound.front() {
            soc.flags |= SOC_FLAG_ODW;
            soc.ty = *ty;
            soc.length = data.len() as u16;
        }

        let mut raise = false;
        if host.has(HOST_FLAG_WR) {
            if state.refuse_writes > 0 {
                state.refuse_writes -= 1;
                soc.flags &= !SOC_FLAG_RDY;
                soc.flags |= SOC_FLAG_ERR;
            } else {
                let end = (LinkHeader::SIZE + host.length as usize).min(tx.len());
                let payload = tx[LinkHeader::SIZE..end].to_vec();
                let was_empty = state.outbound.is_empty();
                let queued = Self::handle_write(&mut state, host.ty, &payload);
                raise = queued && was_empty && !host.has(HOST_FLAG_RD);
            }
        }
        if host.has(HOST_FLAG_RD) {
            match state.outbound.pop_front() {
                Some((ty, data)) => {
                    soc.flags |= SOC_FLAG_OA;
                    soc.ty = ty;
                    soc.length = data.len() as u16;
                    let n = data.len().min(rx.len().saturating_sub(LinkHeader::SIZE));
                    rx[LinkHeader::SIZE..LinkHeader::SIZE + n].copy_from_slice(&data[..n]);
                    if state.outbound.is_empty() {
                        soc.flags &= !SOC_FLAG_ODW;
                    } else {
                        raise = true;
                    }
                }
                None => {
                    soc.flags &= !SOC_FLAG_ODW;
                    soc.length = 0;
                }
            }
        }
        rx[..LinkHeader::SIZE].copy_from_slice(&soc.to_bytes());
        drop(state);

        if raise {
            self.raise_irq();
        }
        Ok(())
    }

    fn set_chip_select(&self, active: bool) -> Result<(), BusError> {
        self.state.lock().chip_select_held = active;
        Ok(())
    }
}

impl Gpio for SimPeripheral {
    fn lines(&self) -> GpioLines {
        self.lines
    }

    fn read_ready(&self) -> Result<bool, BusError> {
        let state = self.state.lock();
        Ok(!state.in_reset && !state.asleep)
    }

    fn set_wake(&self, level: bool) -> Result<(), BusError> {
        if level {
            self.state.lock().asleep = false;
        }
        Ok(())
    }

    fn set_reset(&self, level: bool) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if level {
            state.in_reset = true;
            state.outbound.clear();
            return Ok(());
        }
        if !state.in_reset {
            return Ok(());
        }
        state.in_reset = false;
        state.asleep = false;
        if state.chip_select_held {
            debug!("Sim: reset with chip-select held, staying in boot ROM");
            return Ok(());
        }
        state.bootrom_polls_left = state.boot_polls;
        state.outbound.push_back((
            MessageType::Application.as_u8(),
            uci::build_packet(uci::DEVICE_STATUS_NTF, &[uci::UCI_DEVICE_STATE_READY]),
        ));
        drop(state);
        self.raise_irq();
        Ok(())
    }

    fn read_low_power(&self) -> Result<bool, BusError> {
        Ok(!self.state.lock().asleep)
    }
}
