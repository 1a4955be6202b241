use crate::{Error, Result};
use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use std::sync::{Arc, Mutex, PoisonError};

/// Largest register burst [`AddressableDevice::write_regs`] will put on the wire in one transfer.
pub const MAX_BURST: usize = 32;

/// Bus index and 7-bit slave address of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress {
    bus: u8,
    address: u8,
}

impl DeviceAddress {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }

    pub const fn bus(&self) -> u8 {
        self.bus
    }

    pub const fn address(&self) -> u8 {
        self.address
    }

    /// Parse `"0x62"`, `"98"` or `"1:0x62"`.  Without a `bus:` prefix the address is placed on
    /// `bus`.
    pub fn parse_on(bus: u8, s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_owned());
        let (bus, addr) = match s.split_once(':') {
            Some((b, a)) => (parse_number(b.trim()).ok_or_else(invalid)?, a),
            None => (bus, s),
        };
        let address = parse_number(addr.trim()).ok_or_else(invalid)?;
        if address > 0x7f {
            return Err(invalid());
        }
        Ok(Self::new(bus, address))
    }
}

fn parse_number(s: &str) -> Option<u8> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#04x}", self.bus, self.address)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_on(0, s)
    }
}

impl serde::Serialize for DeviceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One physical transport handle bound to a single slave.
///
/// Implementors only move bytes; all caching and bit manipulation lives in
/// [`Register`](crate::Register) and [`Command`](crate::Command).  The register helpers assume
/// the common "write register pointer, then read/write data" convention.
pub trait AddressableDevice {
    fn address(&self) -> DeviceAddress;

    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn write_read(&mut self, bytes: &[u8], buf: &mut [u8]) -> Result<()>;

    /// Block for a chip-mandated settling time.
    fn settle(&mut self, duration: Duration);

    fn read_reg<R: Into<u8>>(&mut self, reg: R) -> Result<u8>
    where
        Self: Sized,
    {
        let mut buf = [0x00];
        self.write_read(&[reg.into()], &mut buf)?;
        Ok(buf[0])
    }

    fn read_regs<R: Into<u8>>(&mut self, reg: R, buf: &mut [u8]) -> Result<()>
    where
        Self: Sized,
    {
        self.write_read(&[reg.into()], buf)
    }

    fn write_regs<R: Into<u8>>(&mut self, reg: R, bytes: &[u8]) -> Result<()>
    where
        Self: Sized,
    {
        if bytes.len() > MAX_BURST {
            return Err(Error::Unsupported("register burst longer than MAX_BURST"));
        }
        let frame: heapless::Vec<u8, { MAX_BURST + 1 }> = core::iter::once(reg.into())
            .chain(bytes.iter().copied())
            .collect();
        self.write(&frame)
    }
}

/// [`DelayNs`] backed by [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns.into()));
    }
}

/// A physical bus shared by every device mounted on it.
///
/// The transport mutex only makes single transfers exclusive.  Keeping a multi-step transaction
/// in one piece is the job of the bus-wide [`BusLock`](crate::BusLock) held by the
/// [`DeviceScheduler`](crate::DeviceScheduler).
pub struct SharedBus<I2C> {
    index: u8,
    transport: Arc<Mutex<I2C>>,
    delay: Arc<Mutex<dyn DelayNs + Send>>,
}

impl<I2C> Clone for SharedBus<I2C> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            transport: self.transport.clone(),
            delay: self.delay.clone(),
        }
    }
}

impl<I2C: I2c> SharedBus<I2C> {
    pub fn new(index: u8, i2c: I2C) -> Self {
        Self::with_delay(index, i2c, StdDelay)
    }

    pub fn with_delay<D: DelayNs + Send + 'static>(index: u8, i2c: I2C, delay: D) -> Self {
        Self {
            index,
            transport: Arc::new(Mutex::new(i2c)),
            delay: Arc::new(Mutex::new(delay)),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Handle for the slave at `address` on this bus.
    pub fn device(&self, address: u8) -> BusDevice<I2C> {
        BusDevice {
            address: DeviceAddress::new(self.index, address),
            transport: self.transport.clone(),
            delay: self.delay.clone(),
        }
    }

    /// Minimal presence check: a single-byte read.  Any failure means "nothing there".
    pub fn probe(&self, address: u8) -> bool {
        let mut buf = [0x00];
        let result = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(address, &mut buf);
        tracing::trace!(bus = self.index, address, ok = result.is_ok(), "probe");
        result.is_ok()
    }
}

/// [`AddressableDevice`] over a slave on a [`SharedBus`].
pub struct BusDevice<I2C> {
    address: DeviceAddress,
    transport: Arc<Mutex<I2C>>,
    delay: Arc<Mutex<dyn DelayNs + Send>>,
}

impl<I2C: I2c> BusDevice<I2C> {
    fn transfer<T>(&mut self, f: impl FnOnce(&mut I2C, u8) -> Result<T, I2C::Error>) -> Result<T> {
        let mut i2c = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut i2c, self.address.address()).map_err(|e| Error::transport(self.address, e))
    }
}

impl<I2C: I2c> AddressableDevice for BusDevice<I2C> {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.transfer(|i2c, addr| i2c.read(addr, buf))
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.transfer(|i2c, addr| i2c.write(addr, bytes))
    }

    fn write_read(&mut self, bytes: &[u8], buf: &mut [u8]) -> Result<()> {
        self.transfer(|i2c, addr| i2c.write_read(addr, bytes, buf))
    }

    fn settle(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let us = u32::try_from(duration.as_micros()).unwrap_or(u32::MAX);
        self.delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delay_us(us);
    }
}
