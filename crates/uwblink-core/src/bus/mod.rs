//! Platform collaborators: the bus exchange primitive and GPIO lines.

pub mod mock;
pub mod sim;
pub mod traits;

pub use mock::{MockBus, MockGpio};
pub use sim::SimPeripheral;
pub use traits::{Bus, BusError, Gpio, GpioLines};
