//! Compiled-in table of chip drivers.
//!
//! The registry is assembled once at startup and never changes afterwards.  New chip types are
//! added by listing their [`DriverFactory`] in [`DriverRegistry::builtin`] or by building a
//! custom registry with [`DriverRegistry::new`].
use crate::{BusDevice, DeviceController, Error, Result};
use embedded_hal::i2c::I2c;

pub type MountFn<I2C> = fn(BusDevice<I2C>) -> Result<Box<dyn DeviceController>>;
pub type ProbeFn<I2C> = fn(&mut BusDevice<I2C>) -> bool;

/// Everything needed to recognise and mount one kind of chip.
pub struct DriverFactory<I2C> {
    pub name: &'static str,
    /// Addresses the chip can be strapped to.
    pub addresses: &'static [u8],
    /// Driver-specific identification, run only on addresses that answered the presence probe.
    pub probe: ProbeFn<I2C>,
    pub mount: MountFn<I2C>,
}

impl<I2C> Clone for DriverFactory<I2C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I2C> Copy for DriverFactory<I2C> {}

impl<I2C> core::fmt::Debug for DriverFactory<I2C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DriverFactory")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .finish()
    }
}

impl<I2C> DriverFactory<I2C> {
    pub fn supports(&self, address: u8) -> bool {
        self.addresses.contains(&address)
    }

    /// Build the controller.  Any error is wrapped into [`Error::Mount`].
    pub fn mount(&self, device: BusDevice<I2C>) -> Result<Box<dyn DeviceController>> {
        (self.mount)(device).map_err(|reason| Error::Mount {
            driver: self.name,
            reason: Box::new(reason),
        })
    }
}

/// Probe for chips that cannot be told apart from others by reading them.
pub fn present<I2C>(_device: &mut BusDevice<I2C>) -> bool {
    true
}

pub struct DriverRegistry<I2C> {
    factories: Vec<DriverFactory<I2C>>,
}

impl<I2C> DriverRegistry<I2C> {
    pub fn new(factories: Vec<DriverFactory<I2C>>) -> Self {
        debug_assert!(
            factories
                .iter()
                .enumerate()
                .all(|(i, f)| factories[..i].iter().all(|g| g.name != f.name)),
            "duplicate driver names"
        );
        Self { factories }
    }

    /// Factories registered for `address`, in registration order.
    pub fn candidates(&self, address: u8) -> impl Iterator<Item = &DriverFactory<I2C>> + '_ {
        self.factories.iter().filter(move |f| f.supports(address))
    }

    /// Look a driver up by name, ignoring ASCII case.
    pub fn by_name(&self, name: &str) -> Option<&DriverFactory<I2C>> {
        self.factories
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.iter().map(|f| f.name)
    }
}

impl<I2C: I2c + Send + 'static> DriverRegistry<I2C> {
    /// All drivers compiled into this crate.
    pub fn builtin() -> Self {
        Self::new(vec![
            crate::dev::scd4x::factory(),
            crate::dev::pca9554::factory(),
            crate::dev::mcp23017::factory(),
            crate::dev::pca9685::factory(),
        ])
    }
}
