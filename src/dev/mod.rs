//! Compiled-in chip drivers.
//!
//! Each module exposes its driver type plus a `factory()` for the
//! [`DriverRegistry`](crate::DriverRegistry).  Applications normally reach the drivers through
//! the [`BusManager`](crate::BusManager) and the capability accessors of
//! [`DeviceController`](crate::DeviceController), not by naming these types.

pub mod mcp23017;
pub mod pca9554;
pub mod pca9685;
pub mod scd4x;
