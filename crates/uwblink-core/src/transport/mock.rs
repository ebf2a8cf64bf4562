//! Mock transport for testing the device and bypass layers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Transport;
use super::firmware::UpdateOutcome;
use crate::error::{LinkError, Result};
use crate::hsspi::Received;
use crate::protocol::{DeviceInfo, FwVersion, MessageType};

/// A firmware update request as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwRequest {
    pub current: Option<FwVersion>,
    pub device_id: u16,
    pub name: Option<String>,
}

/// Scripted transport recording every call.
///
/// Results not queued default to success: probe returns an empty
/// [`DeviceInfo`] and firmware update reports [`UpdateOutcome::UpToDate`].
#[derive(Clone, Default)]
pub struct MockTransport {
    /// Call names in order ("start", "reset(false)", ...).
    calls: Arc<Mutex<Vec<String>>>,
    /// Captured sends.
    sent: Arc<Mutex<Vec<(MessageType, Vec<u8>)>>>,
    send_failures: Arc<Mutex<VecDeque<LinkError>>>,
    /// Frames returned by recv.
    inbound: Arc<Mutex<VecDeque<(MessageType, Vec<u8>)>>>,
    probe_results: Arc<Mutex<VecDeque<Result<DeviceInfo>>>>,
    reset_results: Arc<Mutex<VecDeque<Result<()>>>>,
    fw_results: Arc<Mutex<VecDeque<Result<UpdateOutcome>>>>,
    fw_requests: Arc<Mutex<Vec<FwRequest>>>,
    start_failure: Arc<Mutex<Option<LinkError>>>,
    usage: Arc<Mutex<u32>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_probe(&self, result: Result<DeviceInfo>) {
        self.probe_results.lock().push_back(result);
    }

    pub fn queue_reset(&self, result: Result<()>) {
        self.reset_results.lock().push_back(result);
    }

    pub fn queue_fw_update(&self, result: Result<UpdateOutcome>) {
        self.fw_results.lock().push_back(result);
    }

    /// Make the next send fail with `error`.
    pub fn queue_send_failure(&self, error: LinkError) {
        self.send_failures.lock().push_back(error);
    }

    /// Queue a frame returned by the next recv.
    pub fn queue_recv(&self, ty: MessageType, data: &[u8]) {
        self.inbound.lock().push_back((ty, data.to_vec()));
    }

    /// Make the next start fail with `error`.
    pub fn fail_next_start(&self, error: LinkError) {
        *self.start_failure.lock() = Some(error);
    }

    /// Get all recorded call names.
    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Get all captured sends.
    pub fn get_sent(&self) -> Vec<(MessageType, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn get_fw_requests(&self) -> Vec<FwRequest> {
        self.fw_requests.lock().clone()
    }

    /// Current start/stop balance.
    pub fn usage(&self) -> u32 {
        *self.usage.lock()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

impl Transport for MockTransport {
    fn start(&self) -> Result<()> {
        self.record("start");
        if let Some(error) = self.start_failure.lock().take() {
            return Err(error);
        }
        *self.usage.lock() += 1;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop");
        let mut usage = self.usage.lock();
        if *usage == 0 {
            return Err(LinkError::InvalidArgument("power stop without start"));
        }
        *usage -= 1;
        Ok(())
    }

    fn reset(&self, bootrom: bool) -> Result<()> {
        self.record(format!("reset({bootrom})"));
        self.reset_results.lock().pop_front().unwrap_or(Ok(()))
    }

    fn power(&self, on: bool) -> Result<()> {
        self.record(format!("power({on})"));
        let mut usage = self.usage.lock();
        if on && *usage == 0 {
            *usage = 1;
        } else if !on && *usage > 0 {
            *usage -= 1;
        }
        Ok(())
    }

    fn fw_update(
        &self,
        current: Option<FwVersion>,
        device_id: u16,
        name: Option<&str>,
    ) -> Result<UpdateOutcome> {
        self.record("fw_update");
        self.fw_requests.lock().push(FwRequest {
            current,
            device_id,
            name: name.map(str::to_string),
        });
        self.fw_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(UpdateOutcome::UpToDate))
    }

    fn send(&self, ty: MessageType, data: &[u8]) -> Result<()> {
        if let Some(error) = self.send_failures.lock().pop_front() {
            return Err(error);
        }
        self.sent.lock().push((ty, data.to_vec()));
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Received> {
        let mut inbound = self.inbound.lock();
        let Some((ty, data)) = inbound.front() else {
            return Err(LinkError::NotReady);
        };
        if data.len() > buf.len() {
            return Err(LinkError::MessageTooLarge {
                len: data.len(),
                capacity: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);
        let received = Received {
            ty: ty.as_u8(),
            flags: 0,
            len: data.len(),
        };
        inbound.pop_front();
        Ok(received)
    }

    fn probe(&self) -> Result<DeviceInfo> {
        self.record("probe");
        self.probe_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceInfo::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_calls() {
        let mock = MockTransport::new();
        mock.start().unwrap();
        mock.reset(false).unwrap();
        mock.stop().unwrap();
        assert!(mock.stop().is_err());
        assert_eq!(
            mock.get_calls(),
            vec!["start", "reset(false)", "stop", "stop"]
        );
    }

    #[test]
    fn test_mock_scripted_results() {
        let mock = MockTransport::new();
        mock.queue_probe(Err(LinkError::Timeout));
        mock.queue_fw_update(Ok(UpdateOutcome::Flashed));

        assert!(matches!(mock.probe(), Err(LinkError::Timeout)));
        assert!(mock.probe().is_ok());
        assert_eq!(mock.fw_update(None, 0x440, None).unwrap(), UpdateOutcome::Flashed);
        assert_eq!(mock.fw_update(None, 0x440, None).unwrap(), UpdateOutcome::UpToDate);
        assert_eq!(mock.get_fw_requests()[0].device_id, 0x440);
    }

    #[test]
    fn test_mock_recv_queue() {
        let mock = MockTransport::new();
        mock.queue_recv(MessageType::Log, b"abc");
        let mut small = [0u8; 2];
        assert!(mock.recv(&mut small).is_err());

        let mut buf = [0u8; 8];
        let rx = mock.recv(&mut buf).unwrap();
        assert_eq!(rx.len, 3);
        assert_eq!(&buf[..3], b"abc");
        assert!(matches!(mock.recv(&mut buf), Err(LinkError::NotReady)));
    }
}
