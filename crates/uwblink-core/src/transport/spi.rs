//! HSSPI transport.
//!
//! Every bus transaction runs on the worker thread through the framing
//! engine. This layer adds what a single exchange cannot do: retries with
//! exponential backoff, wake-up escalation, power references, hard resets
//! and interrupt-driven reception.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::Transport;
use super::firmware::{self, FirmwareFlasher, UpdateOutcome};
use crate::bus::{Bus, BusError, Gpio};
use crate::config::{LinkConfig, pause};
use crate::device::DeviceCore;
use crate::error::{LinkError, Result};
use crate::hsspi::{Hsspi, OutboundFrame, OutboundSlot, Received};
use crate::power::PowerManager;
use crate::probe::Prober;
use crate::protocol::*;
use crate::state::DeviceState;
use crate::worker::{CancelToken, Worker, WorkerOptions};

/// How the device came out of a hard reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetOutcome {
    /// Not waited for.
    Skipped,
    Ready,
    /// Firmware is up but has a core dump to deliver first.
    CoreDump,
}

pub struct SpiTransport {
    config: LinkConfig,
    bus: Arc<dyn Bus>,
    gpio: Arc<dyn Gpio>,
    core: Arc<DeviceCore>,
    worker: Arc<Worker<Hsspi>>,
    power: PowerManager,
    outbound: OutboundSlot,
    next_ticket: AtomicU64,
    /// Ask for a pre-read on the next write.
    should_read: AtomicBool,
    prober: Prober,
    flasher: Arc<dyn FirmwareFlasher>,
    fw_lock: Mutex<()>,
}

impl SpiTransport {
    /// Build the transport and start its worker thread.
    ///
    /// Frames received on interrupt are delivered to `core`.
    pub fn new(
        bus: Arc<dyn Bus>,
        gpio: Arc<dyn Gpio>,
        config: LinkConfig,
        core: Arc<DeviceCore>,
        flasher: Arc<dyn FirmwareFlasher>,
    ) -> Result<Arc<Self>> {
        let hsspi = Hsspi::new(Arc::clone(&bus), Arc::clone(&gpio), config.clone());
        let outbound = hsspi.outbound_slot();

        let slot: Arc<OnceLock<Weak<SpiTransport>>> = Arc::new(OnceLock::new());
        let isr_slot = Arc::clone(&slot);
        let options = WorkerOptions {
            name: "uwblink-hsspi".into(),
            cpu: config.cpu,
            realtime: config.realtime,
        };
        let worker = Worker::spawn(options, hsspi, move || {
            match isr_slot.get().and_then(Weak::upgrade) {
                Some(transport) => transport.handle_irq(),
                None => debug!("Interrupt before transport setup, ignored"),
            }
        })
        .map_err(BusError::from)?;
        let worker = Arc::new(worker);

        let power = PowerManager::new(Arc::clone(&gpio), worker.clone(), config.clone());
        let transport = Arc::new(Self {
            prober: Prober::new(&config),
            config,
            bus,
            gpio,
            core,
            worker,
            power,
            outbound,
            next_ticket: AtomicU64::new(1),
            should_read: AtomicBool::new(false),
            flasher,
            fw_lock: Mutex::new(()),
        });
        let _ = slot.set(Arc::downgrade(&transport));
        Ok(transport)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    /// Interrupt entry point, callable from any thread.
    pub fn irq(&self) {
        self.should_read.store(true, Ordering::SeqCst);
        self.worker.raise_irq();
    }

    /// Callback to wire into the platform interrupt source.
    pub fn irq_handler(self: &Arc<Self>) -> impl Fn() + Send + Sync + 'static {
        let weak = Arc::downgrade(self);
        move || {
            if let Some(transport) = weak.upgrade() {
                transport.irq();
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.power.is_suspended()
    }

    /// [`Transport::send`] that gives up waiting when `cancel` fires.
    #[instrument(skip(self, data, cancel), fields(len = data.len()))]
    pub fn send_interruptible(
        &self,
        ty: MessageType,
        data: &[u8],
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if data.len() > self.config.max_packet_size {
            return Err(LinkError::MessageTooLarge {
                len: data.len(),
                capacity: self.config.max_packet_size,
            });
        }
        let data: Arc<[u8]> = Arc::from(data);
        let ticket = if self.config.combined_write {
            self.publish(ty, &data)
        } else {
            None
        };

        let result = self
            .power
            .resume()
            .and_then(|()| self.send_with_retry(ty, &data, ticket, cancel));

        if let Some(ticket) = ticket {
            self.retract(ticket);
        }
        self.power.idle();
        if let Err(e) = &result {
            warn!(%ty, error = %e, "Send failed");
        }
        result
    }

    /// Offer `data` to a concurrent read. Only one frame is offered at a
    /// time; a sender finding the slot taken writes on its own.
    fn publish(&self, ty: MessageType, data: &Arc<[u8]>) -> Option<u64> {
        let mut slot = self.outbound.lock();
        if slot.is_some() {
            debug!("Combined write slot taken");
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        *slot = Some(OutboundFrame {
            ticket,
            ty: ty.as_u8(),
            data: Arc::clone(data),
            written: false,
        });
        Some(ticket)
    }

    fn retract(&self, ticket: u64) {
        let mut slot = self.outbound.lock();
        if slot.as_ref().is_some_and(|out| out.ticket == ticket) {
            *slot = None;
        }
    }

    fn send_with_retry(
        &self,
        ty: MessageType,
        data: &Arc<[u8]>,
        ticket: Option<u64>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let has_exton = self.gpio.lines().exton;
        let attempts = self.config.retry_count.max(1);
        let mut delay = self.config.retry_delay();
        let mut force_wakeup = false;
        let mut forced = false;
        let mut attempt = 1;
        loop {
            let result = self.enqueue_send(ty, data, ticket, force_wakeup, cancel);
            force_wakeup = false;
            match result {
                Err(e @ (LinkError::Busy | LinkError::NotReady)) if attempt < attempts => {
                    if matches!(e, LinkError::Busy) && !has_exton && !forced {
                        force_wakeup = true;
                        forced = true;
                    }
                    debug!(attempt, error = %e, "Send retry");
                    pause(delay);
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn enqueue_send(
        &self,
        ty: MessageType,
        data: &Arc<[u8]>,
        ticket: Option<u64>,
        force_wakeup: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let pre_read = self.should_read.load(Ordering::SeqCst);
        let slot = Arc::clone(&self.outbound);
        let data = Arc::clone(data);
        self.worker.enqueue(cancel, move |hs: &mut Hsspi| {
            if let Err(e) = hs.wakeup(force_wakeup) {
                debug!(error = %e, "Wake-up failed");
            }
            let owned = |out: &OutboundFrame| Some(out.ticket) == ticket;
            if slot.lock().as_ref().is_some_and(|out| owned(out) && out.written) {
                debug!("Frame already written by a combined exchange");
                return Ok(());
            }
            hs.send(ty.as_u8(), &data, pre_read)?;
            if let Some(out) = slot.lock().as_mut()
                && owned(out)
            {
                out.written = true;
            }
            Ok(())
        })
    }

    /// [`Transport::recv`] that gives up waiting when `cancel` fires.
    #[instrument(skip(self, buf, cancel), fields(capacity = buf.len()))]
    pub fn recv_interruptible(
        &self,
        buf: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> Result<Received> {
        if buf.is_empty() {
            return Err(LinkError::InvalidArgument("empty receive buffer"));
        }
        let result = self
            .power
            .resume()
            .and_then(|()| self.recv_with_retry(buf, cancel));
        self.power.idle();
        result
    }

    fn recv_with_retry(&self, buf: &mut [u8], cancel: Option<&CancelToken>) -> Result<Received> {
        let attempts = self.config.retry_count.max(1);
        let mut delay = self.config.retry_delay();
        let mut attempt = 1;
        let result = loop {
            match self.enqueue_recv(buf.len(), cancel) {
                Err(e @ (LinkError::NotReady | LinkError::ProtocolMismatch { .. }))
                    if attempt < attempts =>
                {
                    debug!(attempt, error = %e, "Receive retry");
                    pause(delay);
                    delay *= 2;
                    attempt += 1;
                }
                other => break other,
            }
        };

        match result {
            Ok((rx, data)) => {
                buf[..rx.len].copy_from_slice(&data);
                self.should_read.store(false, Ordering::SeqCst);
                Ok(rx)
            }
            Err(e) => {
                self.worker.with_context(Hsspi::invalidate_pending);
                debug!(error = %e, "Receive failed");
                Err(e)
            }
        }
    }

    fn enqueue_recv(
        &self,
        capacity: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<(Received, Vec<u8>)> {
        self.worker.enqueue(cancel, move |hs: &mut Hsspi| {
            if let Err(e) = hs.wakeup(false) {
                debug!(error = %e, "Wake-up failed");
            }
            let mut data = vec![0u8; capacity];
            let rx = hs.recv(&mut data)?;
            data.truncate(rx.len);
            Ok((rx, data))
        })
    }

    /// Runs on the worker thread for every serviced interrupt.
    ///
    /// Power references are not touched here: interrupts are only serviced
    /// while the device is resumed.
    fn handle_irq(&self) {
        let mut buf = vec![0u8; self.config.max_packet_size];
        let rx = match self.recv_with_retry(&mut buf, None) {
            Ok(rx) => rx,
            Err(e) => {
                debug!(error = %e, "Interrupt without frame");
                return;
            }
        };
        buf.truncate(rx.len);
        match MessageType::try_from(rx.ty) {
            Ok(ty) => {
                // Dropped frames are logged by the dispatcher.
                let _ = self.core.deliver(Frame::new(ty, rx.flags, buf));
            }
            Err(_) => warn!(ty = rx.ty, len = rx.len, "Unsupported message type, frame dropped"),
        }
    }

    /// Hard reset, optionally waiting for the firmware to come up.
    #[instrument(skip(self))]
    pub fn reset_wait_ready(&self, bootrom: bool, wait: bool) -> Result<()> {
        self.worker.disable_irq();
        let result = self.reset_locked(bootrom, wait);
        self.worker.enable_irq();

        match result {
            Ok(ResetOutcome::CoreDump) => {
                info!("Core dump announced after reset");
                pause(self.config.coredump_grace());
                Ok(())
            }
            Ok(outcome) => {
                debug!(?outcome, "Reset done");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Reset timed out");
                Err(e)
            }
        }
    }

    fn reset_locked(&self, bootrom: bool, wait: bool) -> Result<ResetOutcome> {
        if !self.config.no_reset {
            warn!(bootrom, "Resetting device");
            if bootrom {
                self.bus.set_chip_select(true)?;
            }
            self.gpio.set_reset(true)?;
            pause(self.config.reset_duration());
            self.gpio.set_reset(false)?;
            pause(self.config.reset_backoff());
            if bootrom {
                self.bus.set_chip_select(false)?;
            }
            self.core.state.set(DeviceState::Unknown);
            self.worker.with_context(Hsspi::invalidate_pending);
        }

        if !wait {
            return Ok(ResetOutcome::Skipped);
        }
        if bootrom {
            warn!("Ready wait skipped in boot ROM mode");
            return Ok(ResetOutcome::Skipped);
        }
        let polls = self.config.reset_ready_polls;
        let interval = self.config.reset_poll_interval();
        self.worker.enqueue(None, move |hs: &mut Hsspi| {
            for _ in 0..polls {
                pause(interval);
                let soc = hs.read_flags()?;
                if !soc.firmware_ready() {
                    continue;
                }
                let coredump =
                    soc.has(SOC_FLAG_ODW) && soc.ty == MessageType::CoreDump.as_u8();
                return Ok(if coredump {
                    ResetOutcome::CoreDump
                } else {
                    ResetOutcome::Ready
                });
            }
            Err(LinkError::Timeout)
        })
    }
}

impl Transport for SpiTransport {
    #[instrument(skip(self))]
    fn start(&self) -> Result<()> {
        self.power.start()
    }

    #[instrument(skip(self))]
    fn stop(&self) -> Result<()> {
        self.power.stop()
    }

    fn reset(&self, bootrom: bool) -> Result<()> {
        self.reset_wait_ready(bootrom, !bootrom)
    }

    fn power(&self, on: bool) -> Result<()> {
        let started = self.power.started();
        if on && !started {
            self.power.start()
        } else if !on && started {
            self.power.stop()
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self))]
    fn fw_update(
        &self,
        current: Option<FwVersion>,
        device_id: u16,
        name: Option<&str>,
    ) -> Result<UpdateOutcome> {
        let _guard = self.fw_lock.lock();
        self.worker.disable_irq();
        let result = firmware::update(
            self.flasher.as_ref(),
            &self.config,
            current.as_ref(),
            device_id,
            name,
        );
        self.worker.enable_irq();
        result
    }

    fn send(&self, ty: MessageType, data: &[u8]) -> Result<()> {
        self.send_interruptible(ty, data, None)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Received> {
        self.recv_interruptible(buf, None)
    }

    #[instrument(skip(self))]
    fn probe(&self) -> Result<DeviceInfo> {
        self.prober
            .probe(&self.core, &|cmd| self.send(MessageType::Application, cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBus, MockGpio, SimPeripheral};
    use crate::dispatch::FrameHandler;
    use crate::transport::{ImageLibrary, NoFirmware};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn sim_link(config: LinkConfig) -> (Arc<SpiTransport>, SimPeripheral) {
        let sim = SimPeripheral::new();
        let transport = SpiTransport::new(
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            config,
            Arc::new(DeviceCore::new()),
            Arc::new(NoFirmware),
        )
        .unwrap();
        sim.attach_irq(transport.irq_handler());
        (transport, sim)
    }

    fn mock_link(config: LinkConfig) -> (Arc<SpiTransport>, MockBus, MockGpio) {
        let bus = MockBus::new();
        let gpio = MockGpio::new();
        let transport = SpiTransport::new(
            Arc::new(bus.clone()),
            Arc::new(gpio.clone()),
            config,
            Arc::new(DeviceCore::new()),
            Arc::new(NoFirmware),
        )
        .unwrap();
        (transport, bus, gpio)
    }

    fn channel_handler() -> (Arc<dyn FrameHandler>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: Arc<dyn FrameHandler> = Arc::new(move |frame: Frame| {
            let _ = tx.lock().send(frame);
        });
        (handler, rx)
    }

    #[test]
    fn test_send_and_receive_on_interrupt() {
        let (transport, sim) = sim_link(LinkConfig::fast());
        let (handler, frames) = channel_handler();
        transport
            .core()
            .handlers
            .register(MessageType::Log, Priority::Normal, handler)
            .unwrap();

        transport.start().unwrap();
        transport.send(MessageType::Log, b"ping").unwrap();

        let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.ty, MessageType::Log);
        assert_eq!(frame.data, b"ping");
        assert_eq!(sim.received(), vec![(MessageType::Log.as_u8(), b"ping".to_vec())]);
        transport.stop().unwrap();
        assert!(transport.is_suspended());
    }

    #[test]
    fn test_send_busy_forces_one_wakeup() {
        let (transport, bus, _) = mock_link(LinkConfig::fast());
        // No replies queued: every exchange reads back as a sleeping device.
        let result = transport.send(MessageType::Application, &[1, 2]);
        assert!(matches!(result, Err(LinkError::Busy)));

        let exchanges = bus.exchanges();
        let wakeups = exchanges.iter().filter(|tx| tx.is_empty()).count();
        assert_eq!(wakeups, 1);
        assert_eq!(exchanges.len() - wakeups, 3);
        assert!(exchanges[1].is_empty());
    }

    #[test]
    fn test_send_wakes_sleeping_device() {
        let (transport, sim) = sim_link(LinkConfig::fast());
        transport.start().unwrap();
        sim.sleep();
        transport.send(MessageType::Trace, &[9]).unwrap();
        assert!(!sim.is_asleep());
        assert_eq!(sim.received().len(), 1);
    }

    #[test]
    fn test_send_not_ready_retries_then_succeeds() {
        let (transport, sim) = sim_link(LinkConfig::fast());
        transport.start().unwrap();
        sim.refuse_writes(2);
        transport.send(MessageType::Trace, &[1]).unwrap();
        assert_eq!(sim.received().len(), 1);

        sim.refuse_writes(3);
        assert!(matches!(
            transport.send(MessageType::Trace, &[2]),
            Err(LinkError::NotReady)
        ));
    }

    #[test]
    fn test_send_too_large() {
        let (transport, bus, _) = mock_link(LinkConfig::fast());
        let data = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            transport.send(MessageType::Application, &data),
            Err(LinkError::MessageTooLarge { .. })
        ));
        assert!(bus.exchanges().is_empty());
    }

    #[test]
    fn test_recv_polled() {
        let sim = SimPeripheral::new();
        let transport = SpiTransport::new(
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            LinkConfig::fast(),
            Arc::new(DeviceCore::new()),
            Arc::new(NoFirmware),
        )
        .unwrap();
        transport.start().unwrap();
        sim.push_frame(MessageType::Trace, b"abc");

        let mut buf = [0u8; 16];
        let rx = transport.recv(&mut buf).unwrap();
        assert_eq!(rx.ty, MessageType::Trace.as_u8());
        assert_eq!(&buf[..rx.len], b"abc");

        assert!(matches!(transport.recv(&mut buf), Err(LinkError::NotReady)));

        sim.push_frame(MessageType::Trace, &[0; 32]);
        let mut small = [0u8; 8];
        assert!(matches!(
            transport.recv(&mut small),
            Err(LinkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_reset_waits_for_firmware() {
        let (transport, sim) = sim_link(LinkConfig::fast());
        transport.start().unwrap();
        sim.set_boot_polls(5);
        transport.reset(false).unwrap();
        assert_eq!(transport.core().state.get(), DeviceState::Unknown);

        sim.set_boot_polls(1000);
        assert!(matches!(transport.reset(false), Err(LinkError::Timeout)));
    }

    #[test]
    fn test_reset_into_bootrom_holds_chip_select() {
        let (transport, bus, gpio) = mock_link(LinkConfig::fast());
        transport.start().unwrap();
        transport.reset(true).unwrap();
        assert_eq!(bus.chip_select_log(), vec![true, false]);
        assert_eq!(gpio.reset_log(), vec![false, true, false]);
        // No ready wait in boot ROM mode.
        assert!(bus.exchanges().is_empty());
    }

    #[test]
    fn test_reset_with_core_dump() {
        let (transport, bus, _) = mock_link(LinkConfig::fast());
        bus.queue_frame(SOC_FLAG_RDY | SOC_FLAG_BOOTROM_RDY, 0, 0, &[]);
        bus.queue_frame(
            SOC_FLAG_RDY | SOC_FLAG_ODW,
            MessageType::CoreDump.as_u8(),
            64,
            &[],
        );
        transport.reset(false).unwrap();
        assert_eq!(bus.host_headers().len(), 2);
    }

    #[test]
    fn test_reset_disabled_by_config() {
        let config = LinkConfig {
            no_reset: true,
            ..LinkConfig::fast()
        };
        let (transport, bus, gpio) = mock_link(config);
        bus.queue_frame(SOC_FLAG_RDY, 0, 0, &[]);
        transport.reset(false).unwrap();
        assert!(gpio.reset_log().is_empty());
    }

    #[test]
    fn test_power_toggle() {
        let (transport, _, gpio) = mock_link(LinkConfig::fast());
        transport.power(true).unwrap();
        transport.power(true).unwrap();
        assert!(!transport.is_suspended());
        transport.power(false).unwrap();
        assert!(transport.is_suspended());
        transport.power(false).unwrap();
        assert_eq!(gpio.supply_log(), vec![true, false]);
    }

    #[test]
    fn test_probe_after_reset() {
        let config = LinkConfig {
            state_timeout_ms: 50,
            ..LinkConfig::fast()
        };
        let (transport, _sim) = sim_link(config);
        transport.start().unwrap();
        transport.reset(false).unwrap();
        let info = transport.probe().unwrap();
        let (version, device_id) = info.firmware().unwrap();
        assert_eq!(device_id, 0x0440);
        assert_eq!((version.major, version.minor), (1, 4));
        assert_eq!(transport.core().state.get(), DeviceState::Ready);
    }

    #[test]
    fn test_fw_update_uses_flasher() {
        let library = Arc::new(ImageLibrary::new());
        library.add("qorvo/qm35.bin", None, vec![1, 2, 3]);
        let transport = SpiTransport::new(
            Arc::new(MockBus::new()),
            Arc::new(MockGpio::new()),
            LinkConfig::fast(),
            Arc::new(DeviceCore::new()),
            library.clone(),
        )
        .unwrap();
        let outcome = transport.fw_update(None, 0, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::Flashed);
        assert_eq!(library.flashed(), vec!["qorvo/qm35.bin".to_string()]);
    }

    #[test]
    fn test_combined_write_two_senders() {
        let config = LinkConfig {
            combined_write: true,
            ..LinkConfig::fast()
        };
        let (transport, bus, _) = mock_link(config);
        let log = MessageType::Log.as_u8();
        // Interrupt: pre-read, then a read carrying one outbound frame.
        bus.queue_frame(SOC_FLAG_RDY | SOC_FLAG_ODW, log, 1, &[]);
        bus.queue_frame(SOC_FLAG_RDY | SOC_FLAG_OA, log, 1, &[0x55]);
        // The frame left out of the combined read.
        bus.queue_frame(SOC_FLAG_RDY, 0, 0, &[]);
        transport.start().unwrap();

        // Hold the worker so both senders are queued before anything is written.
        let (started_tx, started) = mpsc::channel();
        let (release, gate) = mpsc::channel::<()>();
        let worker = Arc::clone(&transport.worker);
        let blocker = thread::spawn(move || {
            worker.enqueue(None, move |_: &mut Hsspi| {
                let _ = started_tx.send(());
                let _ = gate.recv();
                Ok(())
            })
        });
        started.recv_timeout(Duration::from_secs(2)).unwrap();

        let spawn_send = |ty: MessageType, byte: u8| {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.send(ty, &[byte]))
        };
        let first = spawn_send(MessageType::Application, 0xAA);
        for _ in 0..2000 {
            if transport.outbound.lock().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let second = spawn_send(MessageType::Log, 0xBB);
        thread::sleep(Duration::from_millis(50));
        // The second sender must not take over the published frame.
        assert_eq!(
            transport.outbound.lock().as_ref().map(|out| out.data.to_vec()),
            Some(vec![0xAA])
        );
        // Serviced before the queued sends once the worker is free.
        transport.irq();

        release.send(()).unwrap();
        blocker.join().unwrap().unwrap();
        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        let writes = |ty: MessageType, byte: u8| {
            bus.exchanges()
                .iter()
                .filter(|tx| {
                    LinkHeader::from_bytes(tx)
                        .is_ok_and(|h| h.has(HOST_FLAG_WR) && h.ty == ty.as_u8())
                        && tx.get(LinkHeader::SIZE) == Some(&byte)
                })
                .count()
        };
        assert_eq!(writes(MessageType::Application, 0xAA), 1);
        assert_eq!(writes(MessageType::Log, 0xBB), 1);
        assert_eq!(bus.pending_replies(), 0);
        assert!(transport.outbound.lock().is_none());
        transport.stop().unwrap();
    }

    #[test]
    fn test_cancelled_send() {
        let (transport, _, _) = mock_link(LinkConfig::fast());
        let token = CancelToken::new();
        token.cancel();
        // Already cancelled: returns without waiting on the worker.
        let result = transport.send_interruptible(MessageType::Log, &[1], Some(&token));
        assert!(matches!(result, Err(LinkError::Cancelled)));
    }
}
