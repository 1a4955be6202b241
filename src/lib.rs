//! Discover, mount and serialize access to chip drivers sharing one I2C bus.
//!
//! A [`BusManager`] probes the address range of a [`SharedBus`], looks up matching drivers in a
//! [`DriverRegistry`] and mounts each recognised chip as a [`DeviceController`] wrapped in a
//! [`DeviceScheduler`].  All schedulers of a bus share one [`BusLock`], so a command, its
//! settling delay and the response read are never interleaved with another device's traffic.
//!
//! Chip drivers are built from two cached protocol units:
//!
//! - [`Register`]: memory-mapped registers with typed fields and read-modify-write,
//! - [`Command`]: opcode based chips with CRC-checked responses and rate limiting.
//!
//! ```no_run
//! use i2c_mount::{BusManager, DriverRegistry, SharedBus};
//! use std::time::Duration;
//!
//! # let i2c = embedded_hal_mock::eh1::i2c::Mock::new(&[]);
//! let bus = SharedBus::new(1, i2c);
//! let mut manager = BusManager::new(bus, DriverRegistry::builtin());
//! let report = manager.scan(Duration::from_millis(5));
//! for address in report.ambiguous {
//!     println!("{address}: choose a driver with configure_device");
//! }
//!
//! let co2 = manager.require(0x62)?;
//! for reading in co2.readings()? {
//!     println!("{}: {} {}", reading.name, reading.value, reading.unit);
//! }
//! # Ok::<(), i2c_mount::Error>(())
//! ```

mod bus;
pub mod command;
mod config;
mod controller;
pub mod dev;
mod error;
mod lock;
mod manager;
pub mod register;
mod registry;
mod scheduler;

#[cfg(test)]
mod testing;

pub use bus::{AddressableDevice, BusDevice, DeviceAddress, SharedBus, StdDelay, MAX_BURST};
pub use command::{Command, Outcome};
pub use config::BusConfig;
pub use controller::{DeviceController, Direction, GpioPort, Reading, Reset, Sensor};
pub use error::{Error, Result};
#[cfg(any(test, feature = "critical-section"))]
pub use lock::CriticalSectionLock;
pub use lock::{BusLock, StdBusLock};
pub use manager::{BusManager, ScanReport};
pub use register::{Access, ByteOrder, Field, Register, RegisterData};
pub use registry::{DriverFactory, DriverRegistry};
pub use scheduler::DeviceScheduler;
