//! Support for the `MCP23017` "16-Bit I/O Expander with Serial Interface"
//!
//! Datasheet: https://ww1.microchip.com/downloads/en/devicedoc/20001952c.pdf
//!
//! The MCP23017 offers two eight-bit GPIO ports.  It has three
//! address pins, so eight devices can coexist on an I2C bus.
//!
//! With `IOCON.BANK = 0` (the reset state, which this driver does not change) the A and B
//! registers of each function are adjacent, so every function is accessed as one 16-bit
//! little-endian register: the lower byte is port A (pins 7..0), the upper byte is port B.
use crate::controller::responds;
use crate::registry::{present, DriverFactory};
use crate::{
    Access, AddressableDevice, BusDevice, ByteOrder, DeviceAddress, DeviceController, Direction,
    GpioPort, Register, Result,
};
use embedded_hal::i2c::I2c;

pub const NAME: &str = "mcp23017";

pub const ADDRESSES: &[u8] = &[0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regs {
    // IODIR: input/output direction: 0=output; 1=input
    // IPOL: input polarity: 0=register values match input pins; 1=opposite
    // GPINTEN: interrupt-on-change: 0=disable; 1=enable
    // GPPU: GPIO pull-ups: enables weak internal pull-ups on each pin (when configured
    //   as an input)
    // INTF: interrupt flags: 0=no interrupt pending; 1=corresponding pin caused interrupt
    // INTCAP: interrupt captured value: reflects value of each pin at the time that they
    //   caused an interrupt.  Reading it clears the interrupt.
    // GPIO: reflects logic level on pins
    // OLAT: output latches: sets state for pins configured as outputs
    IODIR = 0x00,
    IPOL = 0x02,
    GPINTEN = 0x04,
    GPPU = 0x0c,
    INTF = 0x0e,
    INTCAP = 0x10,
    GPIO = 0x12,
    OLAT = 0x14,
}

const fn port(reg: Regs) -> Register<u16> {
    Register::new(reg as u8, 2, ByteOrder::LittleEndian)
}

/// Pins that raised an interrupt and their level at that time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct InterruptState {
    pub flags: u16,
    pub captured: u16,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Payload {
    output: Option<u16>,
    polarity: Option<u16>,
    pull_up: Option<u16>,
    interrupt_enable: Option<u16>,
    /// `1` = input, `0` = output, as on the chip.
    direction: Option<u16>,
}

#[derive(serde::Serialize)]
struct Configuration {
    driver: &'static str,
    address: DeviceAddress,
    pins: u8,
    direction: u16,
    polarity: u16,
    pull_up: u16,
    interrupt_enable: u16,
}

#[derive(serde::Serialize)]
struct State {
    input: u16,
    output: u16,
}

pub struct Mcp23017<I2C> {
    dev: BusDevice<I2C>,
    direction: Register<u16>,
    polarity: Register<u16>,
    interrupt_enable: Register<u16>,
    pull_up: Register<u16>,
    interrupt_flags: Register<u16>,
    interrupt_capture: Register<u16>,
    gpio: Register<u16>,
    latch: Register<u16>,
}

impl<I2C: I2c> Mcp23017<I2C> {
    pub fn new(dev: BusDevice<I2C>) -> Self {
        Self {
            dev,
            direction: port(Regs::IODIR),
            polarity: port(Regs::IPOL),
            interrupt_enable: port(Regs::GPINTEN),
            pull_up: port(Regs::GPPU),
            interrupt_flags: port(Regs::INTF).with_access(Access::ReadOnly),
            interrupt_capture: port(Regs::INTCAP).with_access(Access::ReadClears),
            gpio: port(Regs::GPIO).with_access(Access::ReadOnly),
            latch: port(Regs::OLAT),
        }
    }

    /// Create the driver and load the current port setup from the chip.
    pub fn mount(dev: BusDevice<I2C>) -> Result<Self> {
        let mut this = Self::new(dev);
        this.direction.reload(&mut this.dev)?;
        this.polarity.reload(&mut this.dev)?;
        this.interrupt_enable.reload(&mut this.dev)?;
        this.pull_up.reload(&mut this.dev)?;
        this.latch.reload(&mut this.dev)?;
        Ok(this)
    }

    /// Enable or disable the weak pull-ups of all pins in `mask`.
    pub fn set_pull_up(&mut self, mask: u32, enable: bool) -> Result<()> {
        let mask = mask as u16;
        self.pull_up.modify(&mut self.dev, |p| match enable {
            true => *p |= mask,
            false => *p &= !mask,
        })
    }

    pub fn set_polarity(&mut self, mask: u32, inverted: bool) -> Result<()> {
        let mask = mask as u16;
        self.polarity.modify(&mut self.dev, |p| match inverted {
            true => *p |= mask,
            false => *p &= !mask,
        })
    }

    /// Enable interrupt-on-change for all pins in `mask`.
    pub fn set_interrupt(&mut self, mask: u32, enable: bool) -> Result<()> {
        let mask = mask as u16;
        self.interrupt_enable.modify(&mut self.dev, |p| match enable {
            true => *p |= mask,
            false => *p &= !mask,
        })
    }

    /// Read which pins caused the pending interrupt and their captured levels.
    ///
    /// Reading the capture register clears the interrupt on the chip, so the same call will not
    /// return the same state twice.
    pub fn fetch_interrupt_state(&mut self) -> Result<InterruptState> {
        let flags = self.interrupt_flags.read(&mut self.dev)?;
        let captured = self.interrupt_capture.read(&mut self.dev)?;
        tracing::debug!(address = %self.dev.address(), flags, captured, "interrupt state");
        Ok(InterruptState { flags, captured })
    }
}

impl<I2C: I2c> GpioPort for Mcp23017<I2C> {
    fn pin_count(&self) -> u8 {
        16
    }

    fn set(&mut self, mask_high: u32, mask_low: u32) -> Result<()> {
        self.latch.modify(&mut self.dev, |out| {
            *out |= mask_high as u16;
            *out &= !mask_low as u16;
        })
    }

    fn is_set(&mut self, mask_high: u32, mask_low: u32) -> Result<u32> {
        let out = u32::from(self.latch.data()?);
        Ok((out & mask_high) | (!out & mask_low & 0xffff))
    }

    fn get(&mut self, mask_high: u32, mask_low: u32) -> Result<u32> {
        let in_ = u32::from(self.gpio.read(&mut self.dev)?);
        Ok((in_ & mask_high) | (!in_ & mask_low & 0xffff))
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

        let mask = mask as u16;
        self.direction.modify(&mut self.dev, |d| match dir {
            Direction::Input => *d |= mask,
            Direction::Output => *d &= !mask,
        })
    }
}

impl<I2C: I2c + Send> DeviceController for Mcp23017<I2C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn address(&self) -> DeviceAddress {
        self.dev.address()
    }

    fn detect(&mut self) -> Result<bool> {
        responds(self.direction.reload(&mut self.dev))
    }

    fn configuration(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Configuration {
            driver: NAME,
            address: self.address(),
            pins: self.pin_count(),
            direction: self.direction.data()?,
            polarity: self.polarity.data()?,
            pull_up: self.pull_up.data()?,
            interrupt_enable: self.interrupt_enable.data()?,
        })?)
    }

    fn state(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&State {
            input: self.gpio.read(&mut self.dev)?,
            output: self.latch.data()?,
        })?)
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let payload: Payload = serde_json::from_slice(payload)?;
        let writes = [
            (&mut self.latch, payload.output),
            (&mut self.polarity, payload.polarity),
            (&mut self.pull_up, payload.pull_up),
            (&mut self.interrupt_enable, payload.interrupt_enable),
            (&mut self.direction, payload.direction),
        ];
        for (register, value) in writes {
            if let Some(value) = value {
                register.write(&mut self.dev, &value)?;
            }
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
    Ok(Box::new(Mcp23017::mount(dev)?))
}

/// Shares its address range with the PCA9554 and cannot be told apart by probing.
pub fn factory<I2C: I2c + Send + 'static>() -> DriverFactory<I2C> {
    DriverFactory {
        name: NAME,
        addresses: ADDRESSES,
        probe: present,
        mount: mount_controller,
    }
}
