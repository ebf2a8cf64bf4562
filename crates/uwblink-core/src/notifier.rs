//! Device lifecycle notifications for auxiliary modules.
//!
//! Listeners hear about every device in registration order. A listener may
//! refuse a deletion; the listeners already told are then brought back to
//! their previous view of the device.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::device::Device;
use crate::error::{LinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device exists; it is not usable yet.
    NewDevice,
    /// Registration completed.
    DeviceOnline,
    DeviceDeleted,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::NewDevice => write!(f, "New Device"),
            DeviceEvent::DeviceOnline => write!(f, "Device Online"),
            DeviceEvent::DeviceDeleted => write!(f, "Device Deleted"),
        }
    }
}

/// Auxiliary module interested in device lifecycle.
///
/// Implement this trait in log capture, core dump capture or pass-through
/// modules to attach to each device.
pub trait DeviceListener: Send + Sync {
    /// An error on [`DeviceEvent::DeviceDeleted`] vetoes the deletion; on the
    /// other events it is only logged.
    fn on_event(&self, event: DeviceEvent, device: &Arc<Device>) -> Result<()>;
}

/// Listener that logs events using tracing.
pub struct TracingListener;

impl DeviceListener for TracingListener {
    fn on_event(&self, event: DeviceEvent, device: &Arc<Device>) -> Result<()> {
        match event {
            DeviceEvent::DeviceDeleted => warn!(id = device.id(), "Device deleted"),
            _ => info!(id = device.id(), event = %event, "Device event"),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Notifier {
    listeners: Mutex<Vec<Arc<dyn DeviceListener>>>,
    /// Devices announced online and not deleted since.
    devices: Mutex<Vec<Arc<Device>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` and tell it about every device already online.
    pub fn register(&self, listener: Arc<dyn DeviceListener>) -> Result<()> {
        self.listeners.lock().push(Arc::clone(&listener));
        for device in self.devices() {
            for event in [DeviceEvent::NewDevice, DeviceEvent::DeviceOnline] {
                if let Err(e) = listener.on_event(event, &device) {
                    warn!(id = device.id(), %event, error = %e, "Listener refused existing device");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn unregister(&self, listener: &Arc<dyn DeviceListener>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
        if listeners.len() == before {
            return Err(LinkError::NotFound);
        }
        Ok(())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    /// Broadcast `event` about `device`.
    ///
    /// Only a deletion can fail. When a listener refuses it, the listeners
    /// notified before it get the device announced again, in reverse order,
    /// and the refusal is returned.
    pub fn notify(&self, event: DeviceEvent, device: &Arc<Device>) -> Result<()> {
        let listeners = self.listeners.lock().clone();
        for (index, listener) in listeners.iter().enumerate() {
            let Err(e) = listener.on_event(event, device) else {
                continue;
            };
            if event == DeviceEvent::DeviceDeleted {
                warn!(id = device.id(), error = %e, "Deletion refused, rolling back");
                self.roll_back(&listeners[..index], device);
                return Err(e);
            }
            warn!(id = device.id(), %event, error = %e, "Listener failed, listeners may disagree");
        }

        let mut devices = self.devices.lock();
        match event {
            DeviceEvent::DeviceOnline => devices.push(Arc::clone(device)),
            DeviceEvent::DeviceDeleted => devices.retain(|d| !Arc::ptr_eq(d, device)),
            DeviceEvent::NewDevice => {}
        }
        Ok(())
    }

    fn roll_back(&self, notified: &[Arc<dyn DeviceListener>], device: &Arc<Device>) {
        let online = self
            .devices
            .lock()
            .iter()
            .any(|d| Arc::ptr_eq(d, device));
        for listener in notified.iter().rev() {
            let mut events = vec![DeviceEvent::NewDevice];
            if online {
                events.push(DeviceEvent::DeviceOnline);
            }
            for event in events {
                if let Err(e) = listener.on_event(event, device) {
                    warn!(id = device.id(), %event, error = %e, "Rollback notification failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::device::DeviceCore;
    use crate::transport::MockTransport;

    type Log = Arc<Mutex<Vec<(&'static str, DeviceEvent)>>>;

    struct Named {
        name: &'static str,
        log: Log,
        veto_delete: bool,
    }

    impl DeviceListener for Named {
        fn on_event(&self, event: DeviceEvent, _device: &Arc<Device>) -> Result<()> {
            self.log.lock().push((self.name, event));
            if self.veto_delete && event == DeviceEvent::DeviceDeleted {
                return Err(LinkError::Busy);
            }
            Ok(())
        }
    }

    fn listener(name: &'static str, log: &Log, veto_delete: bool) -> Arc<dyn DeviceListener> {
        Arc::new(Named {
            name,
            log: Arc::clone(log),
            veto_delete,
        })
    }

    fn device() -> Arc<Device> {
        Device::new(
            3,
            Arc::new(MockTransport::new()),
            Arc::new(DeviceCore::new()),
            LinkConfig::fast(),
        )
    }

    #[test]
    fn test_registration_order() {
        let log: Log = Arc::default();
        let notifier = Notifier::new();
        notifier.register(listener("a", &log, false)).unwrap();
        notifier.register(listener("b", &log, false)).unwrap();

        let dev = device();
        notifier.notify(DeviceEvent::NewDevice, &dev).unwrap();
        assert_eq!(
            *log.lock(),
            vec![("a", DeviceEvent::NewDevice), ("b", DeviceEvent::NewDevice)]
        );
        assert!(notifier.devices().is_empty());
        notifier.notify(DeviceEvent::DeviceOnline, &dev).unwrap();
        assert_eq!(notifier.devices().len(), 1);
    }

    #[test]
    fn test_delete_veto_rolls_back_in_reverse() {
        let log: Log = Arc::default();
        let notifier = Notifier::new();
        notifier.register(listener("a", &log, false)).unwrap();
        notifier.register(listener("b", &log, false)).unwrap();
        notifier.register(listener("c", &log, true)).unwrap();
        notifier.register(listener("d", &log, false)).unwrap();

        let dev = device();
        notifier.notify(DeviceEvent::NewDevice, &dev).unwrap();
        log.lock().clear();

        let result = notifier.notify(DeviceEvent::DeviceDeleted, &dev);
        assert!(matches!(result, Err(LinkError::Busy)));
        assert_eq!(
            *log.lock(),
            vec![
                ("a", DeviceEvent::DeviceDeleted),
                ("b", DeviceEvent::DeviceDeleted),
                ("c", DeviceEvent::DeviceDeleted),
                ("b", DeviceEvent::NewDevice),
                ("a", DeviceEvent::NewDevice),
            ]
        );
    }

    #[test]
    fn test_late_listener_sees_existing_devices() {
        let log: Log = Arc::default();
        let notifier = Notifier::new();
        let dev = device();
        notifier.notify(DeviceEvent::NewDevice, &dev).unwrap();
        notifier.notify(DeviceEvent::DeviceOnline, &dev).unwrap();

        let late = listener("late", &log, false);
        notifier.register(Arc::clone(&late)).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                ("late", DeviceEvent::NewDevice),
                ("late", DeviceEvent::DeviceOnline)
            ]
        );

        notifier.unregister(&late).unwrap();
        assert!(matches!(
            notifier.unregister(&late),
            Err(LinkError::NotFound)
        ));
        notifier.notify(DeviceEvent::DeviceDeleted, &dev).unwrap();
        assert_eq!(log.lock().len(), 2);
        assert!(notifier.devices().is_empty());
    }

    #[test]
    fn test_tracing_listener_accepts_everything() {
        let dev = device();
        for event in [
            DeviceEvent::NewDevice,
            DeviceEvent::DeviceOnline,
            DeviceEvent::DeviceDeleted,
        ] {
            TracingListener.on_event(event, &dev).unwrap();
        }
    }
}
