//! # ebus-rs - eBUS daemon and protocol library
//!
//! The ebus-rs crate implements the eBUS protocol, a 2400 Bd multi-master
//! serial field bus used by domestic heating equipment, together with the
//! daemon (`ebusd`) that mediates between client applications and the bus.
//!
//! ## Features
//!
//! - Acquire the bus via carrier-sense arbitration against other masters
//! - Encode and decode framed telegrams with symbol escaping and CRC
//! - Interpret telegrams through a CSV-defined message catalog with typed
//!   fields, value maps, chained messages, and conditional availability
//! - Background polling with weighted priorities and slave scanning
//! - Expose read/write/scan/poll operations to clients over TCP and HTTP
//!
//! ## Usage
//!
//! ```no_run
//! use ebus_rs::catalog::MessageMap;
//! use ebus_rs::ebus::{create_device, BusConfig, BusHandler, BusWorker, RawControl};
//! use std::sync::{Arc, RwLock};
//!
//! let messages = Arc::new(RwLock::new(MessageMap::new(false)));
//! let handler = BusHandler::new(BusConfig::default(), messages);
//! let device = create_device("/dev/ttyUSB0", false, RawControl::new(), None, 100);
//! let mut worker = BusWorker::new(handler.clone(), device);
//! std::thread::spawn(move || worker.run());
//! ```

pub mod catalog;
pub mod constants;
pub mod ebus;
pub mod error;
pub mod logging;
pub mod net;

pub use catalog::message::Message;
pub use catalog::MessageMap;
pub use ebus::handler::{BusConfig, BusHandler, BusState, BusWorker};
pub use ebus::symbol::SymbolString;
pub use error::{Error, Result};
pub use logging::init_logger;
