//! Exclusive pass-through channel.
//!
//! Opening the bypass claims the High priority slot of one message type, so
//! every inbound frame of that type is queued here instead of reaching the
//! normal consumers, and their sends are refused. Only the owner that opened
//! the channel may use it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::DeviceCore;
use crate::dispatch::FrameHandler;
use crate::error::{LinkError, Result};
use crate::hsspi::Received;
use crate::protocol::{Frame, MessageType, Priority};
use crate::state::DeviceState;
use crate::transport::{Transport, UpdateOutcome};

/// Identity of the party holding the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u32);

impl OwnerId {
    /// The calling process.
    pub fn current() -> Self {
        OwnerId(std::process::id())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Called after each frame queued on the channel.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Handler installed in the claimed slot.
struct QueueHandler {
    expected: Mutex<MessageType>,
    frames: Mutex<VecDeque<Frame>>,
    listener: Listener,
}

impl FrameHandler for QueueHandler {
    fn handle(&self, frame: Frame) {
        if frame.ty != *self.expected.lock() {
            debug!(ty = %frame.ty, "Unexpected type on bypass, frame dropped");
            return;
        }
        self.frames.lock().push_back(frame);
        (self.listener)();
    }
}

struct Claim {
    owner: OwnerId,
    handler: Arc<QueueHandler>,
    /// Same object as `handler`, as registered in the table.
    registered: Arc<dyn FrameHandler>,
}

pub struct Bypass {
    core: Arc<DeviceCore>,
    transport: Arc<dyn Transport>,
    claim: Mutex<Option<Claim>>,
}

impl Bypass {
    pub fn new(core: Arc<DeviceCore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            core,
            transport,
            claim: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.claim.lock().is_some()
    }

    /// Claim `ty` (the application channel by default) for `owner` and
    /// power the device.
    pub fn open(&self, owner: OwnerId, ty: Option<MessageType>, listener: Listener) -> Result<()> {
        let ty = ty.unwrap_or(MessageType::Application);
        {
            let mut claim = self.claim.lock();
            if claim.is_some() {
                return Err(LinkError::AlreadyOpen);
            }
            let handler = Arc::new(QueueHandler {
                expected: Mutex::new(ty),
                frames: Mutex::new(VecDeque::new()),
                listener,
            });
            let registered: Arc<dyn FrameHandler> = handler.clone();
            self.core
                .handlers
                .register(ty, Priority::High, Arc::clone(&registered))?;
            self.core.hold();
            *claim = Some(Claim {
                owner,
                handler,
                registered,
            });
        }
        info!(%owner, %ty, "Bypass opened");

        if let Err(e) = self.transport.start() {
            warn!(error = %e, "Power up failed, closing bypass");
            let mut claim = self.claim.lock();
            if let Some(claim) = claim.take() {
                self.release(claim);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Give the channel back. Frames left unread are discarded.
    pub fn close(&self, owner: OwnerId) -> Result<()> {
        let dropped = {
            let mut claim = self.claim.lock();
            check(&claim, owner)?;
            match claim.take() {
                Some(claim) => self.release(claim),
                None => 0,
            }
        };
        if dropped > 0 {
            warn!(dropped, "Bypass closed with frames still queued");
        }
        info!(%owner, "Bypass closed");
        if let Err(e) = self.transport.stop() {
            warn!(error = %e, "Power down failed");
        }
        Ok(())
    }

    /// Unregister the handler and drop the queue. Returns the number of
    /// frames discarded.
    fn release(&self, claim: Claim) -> usize {
        let ty = *claim.handler.expected.lock();
        if let Err(e) = self
            .core
            .handlers
            .unregister(ty, Priority::High, &claim.registered)
        {
            warn!(%ty, error = %e, "Bypass handler already gone");
        }
        self.core.release();
        let mut frames = claim.handler.frames.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }

    /// Whether frames are waiting to be read.
    pub fn queue_check(&self) -> bool {
        self.claim
            .lock()
            .as_ref()
            .is_some_and(|claim| !claim.handler.frames.lock().is_empty())
    }

    /// Write `data` under the claimed type, skipping the claim check.
    pub fn send(&self, owner: OwnerId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(LinkError::InvalidArgument("empty payload"));
        }
        let ty = self.with_claim(owner, |claim| *claim.handler.expected.lock())?;
        self.transport.send(ty, data)
    }

    /// Copy the head of the queue into `buf`.
    ///
    /// A frame larger than `buf` is consumed over several calls; `len` is
    /// what was copied this time.
    pub fn recv(&self, owner: OwnerId, buf: &mut [u8]) -> Result<Received> {
        self.with_claim(owner, |claim| {
            let mut frames = claim.handler.frames.lock();
            let Some(frame) = frames.front_mut() else {
                return Err(LinkError::NoData);
            };
            let len = buf.len().min(frame.data.len());
            buf[..len].copy_from_slice(&frame.data[..len]);
            let received = Received {
                ty: frame.ty.as_u8(),
                flags: frame.flags,
                len,
            };
            if len == frame.data.len() {
                frames.pop_front();
            } else {
                frame.data.drain(..len);
            }
            Ok(received)
        })?
    }

    pub fn expected_type(&self, owner: OwnerId) -> Result<MessageType> {
        self.with_claim(owner, |claim| *claim.handler.expected.lock())
    }

    /// Move the claim to `ty`. Returns the previously claimed type.
    ///
    /// The handler moves slots in a single table update, so no frame of
    /// either type reaches another consumer meanwhile.
    pub fn set_expected_type(&self, owner: OwnerId, ty: MessageType) -> Result<MessageType> {
        self.with_claim(owner, |claim| {
            let mut expected = claim.handler.expected.lock();
            let previous = *expected;
            self.core
                .handlers
                .swap(previous, ty, Priority::High, &claim.registered)?;
            *expected = ty;
            if previous != ty {
                debug!(from = %previous, to = %ty, "Bypass type changed");
            }
            Ok(previous)
        })?
    }

    /// Hard reset. The claim returns to the application channel first.
    pub fn reset(&self, owner: OwnerId, bootrom: bool) -> Result<()> {
        self.set_expected_type(owner, MessageType::Application)?;
        self.transport.reset(bootrom)
    }

    pub fn power(&self, owner: OwnerId, on: bool) -> Result<()> {
        self.with_claim(owner, |_| ())?;
        self.transport.power(on)
    }

    /// Flash `name`, or the default candidates, whatever runs now.
    pub fn fw_update(&self, owner: OwnerId, name: Option<&str>) -> Result<UpdateOutcome> {
        self.with_claim(owner, |_| ())?;
        self.transport.fw_update(None, 0, name)
    }

    pub fn state(&self, owner: OwnerId) -> Result<DeviceState> {
        self.with_claim(owner, |_| ())?;
        Ok(self.core.state.get())
    }

    fn with_claim<R>(&self, owner: OwnerId, f: impl FnOnce(&Claim) -> R) -> Result<R> {
        let claim = self.claim.lock();
        check(&claim, owner)?;
        match claim.as_ref() {
            Some(claim) => Ok(f(claim)),
            None => Err(LinkError::NotOpened),
        }
    }
}

fn check(claim: &Option<Claim>, owner: OwnerId) -> Result<()> {
    match claim {
        None => Err(LinkError::NotOpened),
        Some(claim) if claim.owner != owner => Err(LinkError::PermissionDenied),
        Some(_) => Ok(()),
    }
}
