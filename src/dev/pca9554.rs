//! Support for the `PCA9554` "8-bit I2C-bus and SMBus I/O port with interrupt"
//!
//! The `PCA9554A` variant answers at `0x38..=0x3f` and is otherwise identical.
use crate::controller::responds;
use crate::registry::{present, DriverFactory};
use crate::{
    Access, AddressableDevice, BusDevice, DeviceAddress, DeviceController, Direction, GpioPort,
    Register, Result,
};
use embedded_hal::i2c::I2c;

pub const NAME: &str = "pca9554";

pub const ADDRESSES: &[u8] = &[
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, // PCA9554
    0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f, // PCA9554A
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regs {
    InputPort0 = 0x00,
    OutputPort0 = 0x01,
    PolarityInversion0 = 0x02,
    Configuration0 = 0x03,
}

/// JSON accepted by [`DeviceController::set_payload`].  Each field is a whole register value,
/// bit `n` is pin `n`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Payload {
    output: Option<u8>,
    polarity: Option<u8>,
    /// `1` = input, `0` = output, as on the chip.
    configuration: Option<u8>,
}

#[derive(serde::Serialize)]
struct Configuration {
    driver: &'static str,
    address: DeviceAddress,
    pins: u8,
    polarity: u8,
    configuration: u8,
}

#[derive(serde::Serialize)]
struct State {
    input: u8,
    output: u8,
}

pub struct Pca9554<I2C> {
    dev: BusDevice<I2C>,
    input: Register<u8>,
    output: Register<u8>,
    polarity: Register<u8>,
    configuration: Register<u8>,
}

impl<I2C: I2c> Pca9554<I2C> {
    pub fn new(dev: BusDevice<I2C>) -> Self {
        Self {
            dev,
            input: Register::byte(Regs::InputPort0 as u8).with_access(Access::ReadOnly),
            output: Register::byte(Regs::OutputPort0 as u8),
            polarity: Register::byte(Regs::PolarityInversion0 as u8),
            configuration: Register::byte(Regs::Configuration0 as u8),
        }
    }

    /// Create the driver and load the current port setup from the chip.
    pub fn mount(dev: BusDevice<I2C>) -> Result<Self> {
        let mut this = Self::new(dev);
        this.output.reload(&mut this.dev)?;
        this.polarity.reload(&mut this.dev)?;
        this.configuration.reload(&mut this.dev)?;
        Ok(this)
    }

    /// Invert the input level of all pins in `mask`.
    pub fn set_polarity(&mut self, mask: u32, inverted: bool) -> Result<()> {
        let mask = mask as u8;
        self.polarity.modify(&mut self.dev, |p| match inverted {
            true => *p |= mask,
            false => *p &= !mask,
        })
    }
}

impl<I2C: I2c> GpioPort for Pca9554<I2C> {
    fn pin_count(&self) -> u8 {
        8
    }

    fn set(&mut self, mask_high: u32, mask_low: u32) -> Result<()> {
        self.output.modify(&mut self.dev, |out| {
            *out |= mask_high as u8;
            *out &= !mask_low as u8;
        })
    }

    fn is_set(&mut self, mask_high: u32, mask_low: u32) -> Result<u32> {
        let out = u32::from(self.output.data()?);
        Ok((out & mask_high) | (!out & mask_low & 0xff))
    }

    fn get(&mut self, mask_high: u32, mask_low: u32) -> Result<u32> {
        let in_ = u32::from(self.input.read(&mut self.dev)?);
        Ok((in_ & mask_high) | (!in_ & mask_low & 0xff))
    }

    fn set_direction(&mut self, mask: u32, dir: Direction, state: bool) -> Result<()> {
        // set state before switching direction to prevent glitch
        if dir == Direction::Output {
            if state {
                self.set(mask, 0)?;
            } else {
                self.set(0, mask)?;
            }
        }

        let mask = mask as u8;
        self.configuration.modify(&mut self.dev, |c| match dir {
            Direction::Input => *c |= mask,
            Direction::Output => *c &= !mask,
        })
    }
}

impl<I2C: I2c + Send> DeviceController for Pca9554<I2C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn address(&self) -> DeviceAddress {
        self.dev.address()
    }

    fn detect(&mut self) -> Result<bool> {
        responds(self.configuration.reload(&mut self.dev))
    }

    fn configuration(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Configuration {
            driver: NAME,
            address: self.address(),
            pins: self.pin_count(),
            polarity: self.polarity.data()?,
            configuration: self.configuration.data()?,
        })?)
    }

    fn state(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&State {
            input: self.input.read(&mut self.dev)?,
            output: self.output.data()?,
        })?)
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let payload: Payload = serde_json::from_slice(payload)?;
        // outputs first, so pins switched to output start at the requested level
        if let Some(output) = payload.output {
            self.output.write(&mut self.dev, &output)?;
        }
        if let Some(polarity) = payload.polarity {
            self.polarity.write(&mut self.dev, &polarity)?;
        }
        if let Some(configuration) = payload.configuration {
            self.configuration.write(&mut self.dev, &configuration)?;
        }
        Ok(())
    }

    fn as_gpio(&mut self) -> Option<&mut dyn GpioPort> {
        Some(self)
    }
}

fn mount_controller<I2C: I2c + Send + 'static>(
    dev: BusDevice<I2C>,
) -> Result<Box<dyn DeviceController>> {
    Ok(Box::new(Pca9554::mount(dev)?))
}

/// The chip has no identification register, any answer at a supported address counts.
pub fn factory<I2C: I2c + Send + 'static>() -> DriverFactory<I2C> {
    DriverFactory {
        name: NAME,
        addresses: ADDRESSES,
        probe: present,
        mount: mount_controller,
    }
}
