//! Support for the `PCA9685` "16-channel, 12-bit PWM Fm+ I2C-bus LED controller"
//!
//! Each channel is a 4-byte little-endian register `ON_L, ON_H, OFF_L, OFF_H`: the output goes
//! high at count `ON` and low at count `OFF` of a 4096-step cycle.  Bit 4 of `ON_H` / `OFF_H`
//! forces the output fully on / off.  Multi-byte access relies on `MODE1.AI` (auto-increment),
//! which is enabled at mount.
use crate::controller::responds;
use crate::registry::DriverFactory;
use crate::{
    Access, AddressableDevice, BusDevice, ByteOrder, DeviceAddress, DeviceController, Error,
    Field, Register, RegisterData, Reset, Result,
};
use core::time::Duration;
use embedded_hal::i2c::I2c;

pub const NAME: &str = "pca9685";

/// Strap range with `A5` and `A4` low.
pub const ADDRESSES: &[u8] = &[
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4c, 0x4d, 0x4e, 0x4f,
];

pub const CHANNELS: u8 = 16;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
/// Power-on prescale, about 200 Hz.
const DEFAULT_PRESCALE: u8 = 0x1e;
const MIN_PRESCALE: u8 = 0x03;
const OSCILLATOR_SETTLE: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regs {
    Mode1 = 0x00,
    Led0 = 0x06,
    AllLed = 0xfa,
    PreScale = 0xfe,
}

const RESTART: Field = Field::bit(7);
const EXTCLK: Field = Field::bit(6);
const AI: Field = Field::bit(5);
const SLEEP: Field = Field::bit(4);
const ALLCALL: Field = Field::bit(0);

/// `MODE1` without the sub-address enables, which are left as the chip has them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode1 {
    /// Reads 1 when PWM was running before the chip went to sleep.  Writing 1 restarts it,
    /// writing 0 has no effect.
    pub restart: bool,
    pub external_clock: bool,
    pub auto_increment: bool,
    pub sleep: bool,
    pub all_call: bool,
}

impl RegisterData for Mode1 {
    const MASK: u32 = RESTART.mask() | EXTCLK.mask() | AI.mask() | SLEEP.mask() | ALLCALL.mask();

    fn decode(raw: u32) -> Self {
        Self {
            restart: RESTART.extract(raw) != 0,
            external_clock: EXTCLK.extract(raw) != 0,
            auto_increment: AI.extract(raw) != 0,
            sleep: SLEEP.extract(raw) != 0,
            all_call: ALLCALL.extract(raw) != 0,
        }
    }

    fn encode(&self) -> u32 {
        [
            (RESTART, self.restart),
            (EXTCLK, self.external_clock),
            (AI, self.auto_increment),
            (SLEEP, self.sleep),
            (ALLCALL, self.all_call),
        ]
        .iter()
        .filter(|(_, set)| *set)
        .fold(0, |raw, (field, _)| raw | field.mask())
    }
}

const ON_COUNT: Field = Field::new(0, 12);
const FULL_ON: Field = Field::bit(12);
const OFF_COUNT: Field = Field::new(16, 12);
const FULL_OFF: Field = Field::bit(28);

/// On/off counts of one output.  `full_off` wins over `full_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub on: u16,
    pub off: u16,
    pub full_on: bool,
    pub full_off: bool,
}

impl Channel {
    pub const OFF: Self = Self {
        on: 0,
        off: 0,
        full_on: false,
        full_off: true,
    };

    pub const ON: Self = Self {
        on: 0,
        off: 0,
        full_on: true,
        full_off: false,
    };

    /// Channel switching on at count 0 with the given duty cycle in `0.0..=1.0`.
    pub fn from_duty(duty: f64) -> Self {
        if duty.is_nan() || duty <= 0.0 {
            Self::OFF
        } else if duty >= 1.0 {
            Self::ON
        } else {
            Self {
                on: 0,
                off: ((duty * 4096.0).round() as u16).clamp(1, 4095),
                full_on: false,
                full_off: false,
            }
        }
    }

    pub fn duty(&self) -> f64 {
        if self.full_off {
            0.0
        } else if self.full_on {
            1.0
        } else {
            f64::from(self.off.wrapping_sub(self.on) & 0x0fff) / 4096.0
        }
    }
}

impl RegisterData for Channel {
    const MASK: u32 = ON_COUNT.mask() | FULL_ON.mask() | OFF_COUNT.mask() | FULL_OFF.mask();

    fn decode(raw: u32) -> Self {
        Self {
            on: ON_COUNT.extract(raw) as u16,
            off: OFF_COUNT.extract(raw) as u16,
            full_on: FULL_ON.extract(raw) != 0,
            full_off: FULL_OFF.extract(raw) != 0,
        }
    }

    fn encode(&self) -> u32 {
        (u32::from(self.on & 0x0fff) << ON_COUNT.shift())
            | (u32::from(self.full_on) << FULL_ON.shift())
            | (u32::from(self.off & 0x0fff) << OFF_COUNT.shift())
            | (u32::from(self.full_off) << FULL_OFF.shift())
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct DutyCycle {
    channel: u8,
    duty: f64,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Payload {
    frequency_hz: Option<f64>,
    channels: Vec<DutyCycle>,
}

#[derive(serde::Serialize)]
struct Configuration {
    driver: &'static str,
    address: DeviceAddress,
    channels: u8,
    prescale: u8,
    frequency_hz: f64,
}

#[derive(serde::Serialize)]
struct State {
    sleeping: bool,
    frequency_hz: f64,
    duty: Vec<f64>,
}

pub struct Pca9685<I2C> {
    dev: BusDevice<I2C>,
    mode1: Register<Mode1>,
    prescale: Register<u8>,
    channels: Vec<Register<Channel>>,
    all: Register<Channel>,
}

impl<I2C: I2c> Pca9685<I2C> {
    pub fn new(dev: BusDevice<I2C>) -> Self {
        Self {
            dev,
            mode1: Register::byte(Regs::Mode1 as u8).with_access(Access::SelfClearing),
            prescale: Register::byte(Regs::PreScale as u8),
            channels: (0..CHANNELS)
                .map(|n| Register::new(Regs::Led0 as u8 + 4 * n, 4, ByteOrder::LittleEndian))
                .collect(),
            // the ALL_LED registers read back as zero
            all: Register::new(Regs::AllLed as u8, 4, ByteOrder::LittleEndian)
                .with_access(Access::WriteOnly)
                .with_reset_value(Channel::OFF.encode()),
        }
    }

    /// Create the driver and turn on register auto-increment.
    pub fn mount(dev: BusDevice<I2C>) -> Result<Self> {
        let mut this = Self::new(dev);
        this.mode1.modify(&mut this.dev, |m| m.auto_increment = true)?;
        this.prescale.reload(&mut this.dev)?;
        Ok(this)
    }

    /// PWM frequency the current prescale produces with the internal oscillator.
    pub fn frequency(&self) -> Result<f64> {
        Ok(OSCILLATOR_HZ / (4096.0 * (f64::from(self.prescale.data()?) + 1.0)))
    }

    /// Set the PWM frequency, about 24 Hz to 1526 Hz.
    pub fn set_frequency(&mut self, hz: f64) -> Result<()> {
        let prescale = (OSCILLATOR_HZ / (4096.0 * hz)).round() - 1.0;
        if !(f64::from(MIN_PRESCALE)..=255.0).contains(&prescale) {
            return Err(Error::Unsupported("PWM frequency out of range"));
        }
        self.set_prescale(prescale as u8)
    }

    /// The prescaler only accepts writes while the oscillator is off.
    fn set_prescale(&mut self, prescale: u8) -> Result<()> {
        self.mode1.modify(&mut self.dev, |m| {
            m.sleep = true;
            m.restart = false;
        })?;
        self.prescale.write(&mut self.dev, &prescale)?;
        self.wake()?;
        tracing::debug!(address = %self.dev.address(), prescale, "prescale set");
        Ok(())
    }

    fn wake(&mut self) -> Result<()> {
        self.mode1.modify(&mut self.dev, |m| {
            m.sleep = false;
            m.restart = false;
        })?;
        self.dev.settle(OSCILLATOR_SETTLE);
        if self.mode1.read(&mut self.dev)?.restart {
            self.mode1.modify(&mut self.dev, |m| m.restart = true)?;
        }
        Ok(())
    }

    pub fn set_channel(&mut self, channel: u8, value: &Channel) -> Result<()> {
        let index = channel_index(channel)?;
        self.channels[index].write(&mut self.dev, value)
    }

    pub fn set_duty(&mut self, channel: u8, duty: f64) -> Result<()> {
        self.set_channel(channel, &Channel::from_duty(duty))
    }

    pub fn duty(&mut self, channel: u8) -> Result<f64> {
        let index = channel_index(channel)?;
        Ok(self.channels[index].read(&mut self.dev)?.duty())
    }

    /// Set every channel at once through the `ALL_LED` registers.
    pub fn set_all(&mut self, value: &Channel) -> Result<()> {
        self.all.write(&mut self.dev, value)?;
        for channel in &mut self.channels {
            channel.invalidate();
        }
        Ok(())
    }
}

fn channel_index(channel: u8) -> Result<usize> {
    match channel < CHANNELS {
        true => Ok(usize::from(channel)),
        false => Err(Error::OutOfRange {
            value: channel.into(),
            bits: 4,
        }),
    }
}

impl<I2C: I2c> Reset for Pca9685<I2C> {
    /// All outputs off, power-on frequency.
    fn reset(&mut self) -> Result<()> {
        self.set_all(&Channel::OFF)?;
        self.set_prescale(DEFAULT_PRESCALE)
    }
}

impl<I2C: I2c + Send> DeviceController for Pca9685<I2C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn address(&self) -> DeviceAddress {
        self.dev.address()
    }

    fn detect(&mut self) -> Result<bool> {
        responds(self.prescale.reload(&mut self.dev))
    }

    fn configuration(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Configuration {
            driver: NAME,
            address: self.address(),
            channels: CHANNELS,
            prescale: self.prescale.data()?,
            frequency_hz: self.frequency()?,
        })?)
    }

    fn state(&mut self) -> Result<Vec<u8>> {
        let sleeping = self.mode1.read(&mut self.dev)?.sleep;
        let duty = (0..CHANNELS)
            .map(|c| self.duty(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_vec(&State {
            sleeping,
            frequency_hz: self.frequency()?,
            duty,
        })?)
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let payload: Payload = serde_json::from_slice(payload)?;
        if let Some(hz) = payload.frequency_hz {
            self.set_frequency(hz)?;
        }
        for DutyCycle { channel, duty } in payload.channels {
            self.set_duty(channel, duty)?;
        }
        Ok(())
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Reset> {
        Some(self)
    }
}

/// The hardware refuses prescale values below 3, so a lower value means "not a PCA9685".
fn probe<I2C: I2c>(dev: &mut BusDevice<I2C>) -> bool {
    dev.read_reg(Regs::PreScale as u8)
        .map_or(false, |prescale| prescale >= MIN_PRESCALE)
}

fn mount_controller<I2C: I2c + Send + 'static>(
    dev: BusDevice<I2C>,
) -> Result<Box<dyn DeviceController>> {
    Ok(Box::new(Pca9685::mount(dev)?))
}

pub fn factory<I2C: I2c + Send + 'static>() -> DriverFactory<I2C> {
    DriverFactory {
        name: NAME,
        addresses: ADDRESSES,
        probe,
        mount: mount_controller,
    }
}
