//! The ebus module contains the components driving the bus itself: address
//! classification, symbol escaping and CRC, the serial device access, the
//! request queues, and the bus handler state machine.

pub mod address;
pub mod device;
pub mod handler;
pub mod queue;
pub mod request;
pub mod serial_mock;
pub mod symbol;

pub use device::{create_device, Device, NetworkDevice, RawControl, SerialDevice};
pub use handler::{BusConfig, BusHandler, BusState, BusWorker, GrabMode, Seen};
pub use symbol::{MasterCompare, SymbolString};
