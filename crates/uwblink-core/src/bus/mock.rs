//! Scripted bus and GPIO for testing the framing engine.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::traits::{Bus, BusError, Gpio, GpioLines};
use crate::protocol::LinkHeader;

/// Mock bus answering each exchange with the next queued reply.
///
/// An exchange with nothing queued reads back all zeroes, which the framing
/// engine interprets as a sleeping device.
#[derive(Clone, Default)]
pub struct MockBus {
    /// Queued device replies (header followed by data).
    replies: Arc<Mutex<VecDeque<Result<Vec<u8>, String>>>>,
    /// Captured host transmissions.
    tx_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Captured chip-select changes.
    cs_log: Arc<Mutex<Vec<bool>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes returned on the next exchange.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.replies.lock().push_back(Ok(bytes.to_vec()));
    }

    /// Queue a device header followed by `data`.
    pub fn queue_frame(&self, flags: u8, ty: u8, length: u16, data: &[u8]) {
        let mut bytes = LinkHeader::new(flags, ty, length).to_bytes().to_vec();
        bytes.extend_from_slice(data);
        self.queue_reply(&bytes);
    }

    /// Make the next exchange fail at the bus level.
    pub fn queue_failure(&self, message: &str) {
        self.replies.lock().push_back(Err(message.to_string()));
    }

    /// Get all captured transmissions.
    pub fn exchanges(&self) -> Vec<Vec<u8>> {
        self.tx_log.lock().clone()
    }

    /// Host headers of the captured transmissions (empty exchanges skipped).
    pub fn host_headers(&self) -> Vec<LinkHeader> {
        self.tx_log
            .lock()
            .iter()
            .filter_map(|tx| LinkHeader::from_bytes(tx).ok())
            .collect()
    }

    pub fn chip_select_log(&self) -> Vec<bool> {
        self.cs_log.lock().clone()
    }

    /// Number of queued replies not consumed yet.
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    /// Clear captured transmissions.
    pub fn clear(&self) {
        self.tx_log.lock().clear();
    }
}

impl Bus for MockBus {
    fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        self.tx_log.lock().push(tx.to_vec());
        rx.fill(0);
        if tx.is_empty() {
            return Ok(());
        }
        match self.replies.lock().pop_front() {
            Some(Ok(reply)) => {
                let n = reply.len().min(rx.len());
                rx[..n].copy_from_slice(&reply[..n]);
                Ok(())
            }
            Some(Err(message)) => Err(BusError::Transfer(message)),
            None => Ok(()),
        }
    }

    fn set_chip_select(&self, active: bool) -> Result<(), BusError> {
        self.cs_log.lock().push(active);
        Ok(())
    }
}

/// Mock GPIO block with configurable optional lines.
#[derive(Clone)]
pub struct MockGpio {
    lines: GpioLines,
    /// Scripted ready levels; `ready_default` once exhausted.
    ready: Arc<Mutex<VecDeque<bool>>>,
    ready_default: Arc<Mutex<bool>>,
    /// EXTON level (device awake).
    awake: Arc<Mutex<bool>>,
    wake_log: Arc<Mutex<Vec<bool>>>,
    reset_log: Arc<Mutex<Vec<bool>>>,
    supply_log: Arc<Mutex<Vec<bool>>>,
}

impl MockGpio {
    /// GPIO block with only the mandatory reset line.
    pub fn new() -> Self {
        Self::with_lines(GpioLines::default())
    }

    pub fn with_lines(lines: GpioLines) -> Self {
        Self {
            lines,
            ready: Arc::new(Mutex::new(VecDeque::new())),
            ready_default: Arc::new(Mutex::new(true)),
            awake: Arc::new(Mutex::new(true)),
            wake_log: Arc::new(Mutex::new(Vec::new())),
            reset_log: Arc::new(Mutex::new(Vec::new())),
            supply_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue ready-line levels returned by successive reads.
    pub fn queue_ready(&self, levels: &[bool]) {
        self.ready.lock().extend(levels.iter().copied());
    }

    pub fn set_ready_default(&self, level: bool) {
        *self.ready_default.lock() = level;
    }

    pub fn set_awake(&self, awake: bool) {
        *self.awake.lock() = awake;
    }

    /// Number of wake pulses issued on the dedicated line.
    pub fn wake_pulses(&self) -> usize {
        self.wake_log.lock().iter().filter(|&&level| level).count()
    }

    pub fn reset_log(&self) -> Vec<bool> {
        self.reset_log.lock().clone()
    }

    pub fn supply_log(&self) -> Vec<bool> {
        self.supply_log.lock().clone()
    }
}

impl Default for MockGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpio for MockGpio {
    fn lines(&self) -> GpioLines {
        self.lines
    }

    fn read_ready(&self) -> Result<bool, BusError> {
        let scripted = self.ready.lock().pop_front();
        Ok(scripted.unwrap_or(*self.ready_default.lock()))
    }

    fn set_wake(&self, level: bool) -> Result<(), BusError> {
        self.wake_log.lock().push(level);
        if level {
            *self.awake.lock() = true;
        }
        Ok(())
    }

    fn set_reset(&self, level: bool) -> Result<(), BusError> {
        self.reset_log.lock().push(level);
        Ok(())
    }

    fn read_low_power(&self) -> Result<bool, BusError> {
        Ok(*self.awake.lock())
    }

    fn set_supply(&self, on: bool) -> Result<(), BusError> {
        self.supply_log.lock().push(on);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HOST_FLAG_WR, SOC_FLAG_RDY};

    #[test]
    fn test_mock_reply_queue() {
        let bus = MockBus::new();
        bus.queue_frame(SOC_FLAG_RDY, 2, 3, &[1, 2, 3]);

        let tx = LinkHeader::new(HOST_FLAG_WR, 2, 3).to_bytes();
        let mut rx = [0u8; 7];
        let mut frame = tx.to_vec();
        frame.extend_from_slice(&[9, 9, 9]);
        bus.exchange(&frame, &mut rx).unwrap();
        assert_eq!(rx, [SOC_FLAG_RDY, 2, 3, 0, 1, 2, 3]);

        // Queue is empty now: the device reads as asleep.
        bus.exchange(&frame, &mut rx).unwrap();
        assert_eq!(rx, [0; 7]);
        assert_eq!(bus.host_headers().len(), 2);
    }

    #[test]
    fn test_mock_failure() {
        let bus = MockBus::new();
        bus.queue_failure("crc");
        let mut rx = [0u8; 4];
        assert!(bus.exchange(&[0; 4], &mut rx).is_err());
    }

    #[test]
    fn test_mock_gpio_ready_script() {
        let gpio = MockGpio::with_lines(GpioLines {
            ready: true,
            ..Default::default()
        });
        gpio.set_ready_default(false);
        gpio.queue_ready(&[true]);
        assert!(gpio.read_ready().unwrap());
        assert!(!gpio.read_ready().unwrap());

        gpio.set_wake(true).unwrap();
        gpio.set_wake(false).unwrap();
        assert_eq!(gpio.wake_pulses(), 1);
    }
}
