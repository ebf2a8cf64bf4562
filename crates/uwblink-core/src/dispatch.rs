//! Inbound frame routing.
//!
//! Each message type has one High and one Normal slot. A frame goes to the
//! High handler when one is installed, otherwise to the Normal one. Exactly
//! one handler sees each frame.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{LinkError, Result};
use crate::protocol::{Frame, MessageType, Priority};

/// Consumer of inbound frames.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: Frame);
}

impl<F> FrameHandler for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn handle(&self, frame: Frame) {
        self(frame)
    }
}

const SLOTS: usize = MessageType::COUNT * Priority::COUNT;

fn slot(ty: MessageType, prio: Priority) -> usize {
    ty.index() * Priority::COUNT + prio.index()
}

/// Handler registry indexed by (message type, priority).
pub struct HandlerTable {
    slots: Mutex<[Option<Arc<dyn FrameHandler>>; SLOTS]>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    pub fn register(
        &self,
        ty: MessageType,
        prio: Priority,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot(ty, prio)];
        if entry.is_some() {
            return Err(LinkError::AlreadyExists);
        }
        *entry = Some(handler);
        trace!(%ty, ?prio, "Handler registered");
        Ok(())
    }

    /// Remove `handler`, which must be the one installed in the slot.
    pub fn unregister(
        &self,
        ty: MessageType,
        prio: Priority,
        handler: &Arc<dyn FrameHandler>,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot(ty, prio)];
        if !entry.as_ref().is_some_and(|current| same_handler(current, handler)) {
            return Err(LinkError::NotFound);
        }
        *entry = None;
        trace!(%ty, ?prio, "Handler unregistered");
        Ok(())
    }

    /// Move `handler` from `old` to `new` in one step.
    ///
    /// On failure the handler stays registered under `old`.
    pub fn swap(
        &self,
        old: MessageType,
        new: MessageType,
        prio: Priority,
        handler: &Arc<dyn FrameHandler>,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let mut slots = self.slots.lock();
        if !slots[slot(old, prio)]
            .as_ref()
            .is_some_and(|current| same_handler(current, handler))
        {
            return Err(LinkError::NotFound);
        }
        if slots[slot(new, prio)].is_some() {
            return Err(LinkError::AlreadyExists);
        }
        let moved = slots[slot(old, prio)].take();
        slots[slot(new, prio)] = moved;
        trace!(from = %old, to = %new, ?prio, "Handler moved");
        Ok(())
    }

    pub fn has_high_priority(&self, ty: MessageType) -> bool {
        self.slots.lock()[slot(ty, Priority::High)].is_some()
    }

    /// Hand `frame` to the handler in charge of its type.
    ///
    /// The handler runs without the table lock held, so it may register or
    /// unregister handlers itself.
    pub fn dispatch(&self, frame: Frame) -> Result<()> {
        let ty = frame.ty;
        let handler = {
            let slots = self.slots.lock();
            slots[slot(ty, Priority::High)]
                .clone()
                .or_else(|| slots[slot(ty, Priority::Normal)].clone())
        };
        match handler {
            Some(handler) => {
                handler.handle(frame);
                Ok(())
            }
            None => {
                warn!(%ty, len = frame.len(), "No handler, frame dropped");
                Err(LinkError::Unsupported(ty.as_u8()))
            }
        }
    }
}

/// Identity comparison on the handler object, ignoring vtables.
fn same_handler(a: &Arc<dyn FrameHandler>, b: &Arc<dyn FrameHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<dyn FrameHandler>, Arc<Mutex<Vec<Frame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn FrameHandler> = Arc::new(move |frame: Frame| sink.lock().push(frame));
        (handler, seen)
    }

    fn frame(ty: MessageType) -> Frame {
        Frame::new(ty, 0, vec![1, 2, 3])
    }

    #[test]
    fn test_high_shadows_normal() {
        let table = HandlerTable::new();
        let (normal, normal_seen) = recorder();
        let (high, high_seen) = recorder();
        table
            .register(MessageType::Application, Priority::Normal, Arc::clone(&normal))
            .unwrap();
        table.dispatch(frame(MessageType::Application)).unwrap();

        table
            .register(MessageType::Application, Priority::High, Arc::clone(&high))
            .unwrap();
        table.dispatch(frame(MessageType::Application)).unwrap();
        assert_eq!(normal_seen.lock().len(), 1);
        assert_eq!(high_seen.lock().len(), 1);

        table
            .unregister(MessageType::Application, Priority::High, &high)
            .unwrap();
        table.dispatch(frame(MessageType::Application)).unwrap();
        assert_eq!(normal_seen.lock().len(), 2);
    }

    #[test]
    fn test_register_occupied_slot() {
        let table = HandlerTable::new();
        for ty in MessageType::ALL {
            for prio in [Priority::High, Priority::Normal] {
                let (a, _) = recorder();
                let (b, _) = recorder();
                table.register(ty, prio, Arc::clone(&a)).unwrap();
                assert!(
                    matches!(table.register(ty, prio, Arc::clone(&b)), Err(LinkError::AlreadyExists)),
                    "{ty} {prio:?} accepted a second handler"
                );
                assert!(
                    matches!(table.unregister(ty, prio, &b), Err(LinkError::NotFound)),
                    "{ty} {prio:?} removed a foreign handler"
                );
                table.unregister(ty, prio, &a).unwrap();
                table.register(ty, prio, b).unwrap();
            }
        }
    }

    #[test]
    fn test_unregister_requires_same_handler() {
        let table = HandlerTable::new();
        let (a, _) = recorder();
        let (b, _) = recorder();
        table
            .register(MessageType::Trace, Priority::High, Arc::clone(&a))
            .unwrap();
        assert!(matches!(
            table.unregister(MessageType::Trace, Priority::High, &b),
            Err(LinkError::NotFound)
        ));
        assert!(table.has_high_priority(MessageType::Trace));
        table
            .unregister(MessageType::Trace, Priority::High, &a)
            .unwrap();
        assert!(!table.has_high_priority(MessageType::Trace));
    }

    #[test]
    fn test_dispatch_without_handler() {
        let table = HandlerTable::new();
        assert!(matches!(
            table.dispatch(frame(MessageType::CoreDump)),
            Err(LinkError::Unsupported(3))
        ));
    }

    #[test]
    fn test_swap_moves_registration() {
        let table = HandlerTable::new();
        let (h, seen) = recorder();
        table
            .register(MessageType::Application, Priority::High, Arc::clone(&h))
            .unwrap();
        table
            .swap(MessageType::Application, MessageType::Log, Priority::High, &h)
            .unwrap();
        assert!(!table.has_high_priority(MessageType::Application));
        table.dispatch(frame(MessageType::Log)).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_failed_swap_keeps_old_registration() {
        let table = HandlerTable::new();
        let (h, _) = recorder();
        let (other, _) = recorder();
        table
            .register(MessageType::Application, Priority::High, Arc::clone(&h))
            .unwrap();
        table
            .register(MessageType::Log, Priority::High, other)
            .unwrap();
        assert!(matches!(
            table.swap(MessageType::Application, MessageType::Log, Priority::High, &h),
            Err(LinkError::AlreadyExists)
        ));
        assert!(table.has_high_priority(MessageType::Application));
    }

    #[test]
    fn test_handler_may_reenter_table() {
        let table = Arc::new(HandlerTable::new());
        let inner = Arc::clone(&table);
        let handler: Arc<dyn FrameHandler> = Arc::new(move |_frame: Frame| {
            let (late, _) = recorder();
            let _ = inner.register(MessageType::Log, Priority::Normal, late);
        });
        table
            .register(MessageType::Trace, Priority::Normal, handler)
            .unwrap();
        table.dispatch(frame(MessageType::Trace)).unwrap();
        assert!(matches!(
            table.dispatch(frame(MessageType::Log)),
            Ok(())
        ));
    }
}
