use crate::{DeviceAddress, Error, Result};

/// A mounted chip driver.
///
/// Controllers own their [`Register`](crate::Register)s and [`Command`](crate::Command)s and are
/// only ever called with the bus lock held (see [`DeviceScheduler`](crate::DeviceScheduler)).
/// Optional behaviour is exposed through capability accessors instead of downcasting: callers
/// ask for `as_sensor()` and get `None` if the chip does not produce readings.
pub trait DeviceController: Send {
    /// Registry name of the driver.
    fn name(&self) -> &'static str;

    fn address(&self) -> DeviceAddress;

    /// Check that the chip still answers like the part this driver was mounted for.
    fn detect(&mut self) -> Result<bool>;

    /// Static configuration as JSON.
    fn configuration(&mut self) -> Result<Vec<u8>>;

    /// Current state as JSON.
    fn state(&mut self) -> Result<Vec<u8>>;

    /// Apply a JSON payload to a writable device.
    fn set_payload(&mut self, _payload: &[u8]) -> Result<()> {
        Err(Error::Unsupported("device does not accept payloads"))
    }

    fn as_sensor(&mut self) -> Option<&mut dyn Sensor> {
        None
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Reset> {
        None
    }

    fn as_gpio(&mut self) -> Option<&mut dyn GpioPort> {
        None
    }
}

/// Map the result of a detection transfer: a transport failure means "not there".
pub(crate) fn responds<T>(result: Result<T>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_transport() => Ok(false),
        Err(e) => Err(e),
    }
}

/// A named, unit-tagged measurement.
///
/// A failed measurement is reported as a reading with `error` set rather than as an `Err`, so a
/// long-running monitor can skip one sample and carry on.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Reading {
    pub name: &'static str,
    pub unit: &'static str,
    pub value: f64,
    pub error: bool,
}

impl Reading {
    pub fn ok(name: &'static str, unit: &'static str, value: f64) -> Self {
        Self {
            name,
            unit,
            value,
            error: false,
        }
    }

    pub fn errored(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit,
            value: f64::NAN,
            error: true,
        }
    }
}

/// Produces periodic readings.
pub trait Sensor {
    /// Take (or reuse, when rate limited) one set of readings.  Failures turn into errored
    /// readings.
    fn readings(&mut self) -> Vec<Reading>;
}

/// Supports a chip-level reset.
pub trait Reset {
    /// Reset the chip and drop all cached register/command state.
    fn reset(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// Exposes GPIO pins.  Pins are addressed by bit masks, bit `n` is pin `n`.
pub trait GpioPort {
    fn pin_count(&self) -> u8;

    /// Set all pins in `mask_high` to HIGH and all pins in `mask_low` to LOW.
    ///
    /// The driver should implement this such that all pins change state at the same time.
    fn set(&mut self, mask_high: u32, mask_low: u32) -> Result<()>;

    /// Check whether pins in `mask_high` were set HIGH and pins in `mask_low` were set LOW.
    ///
    /// For each pin in either of the masks, the returned `u32` has a 1 if it meets the expected
    /// state and a 0 otherwise.  All other bits are 0.
    fn is_set(&mut self, mask_high: u32, mask_low: u32) -> Result<u32>;

    /// Check whether pins in `mask_high` are driven HIGH and pins in `mask_low` are driven LOW.
    ///
    /// Same result convention as [`GpioPort::is_set`].
    fn get(&mut self, mask_high: u32, mask_low: u32) -> Result<u32>;

    /// Set the direction for all pins in `mask`.
    ///
    /// When making pins outputs, they are put to `state` before switching to avoid glitches.
    fn set_direction(&mut self, mask: u32, dir: Direction, state: bool) -> Result<()>;

    fn toggle(&mut self, mask: u32) -> Result<()> {
        // for all pins which are currently low, make them high.
        let mask_high = self.is_set(0, mask)?;
        // for all pins which are currently high, make them low.
        let mask_low = self.is_set(mask, 0)?;
        self.set(mask_high, mask_low)
    }
}
