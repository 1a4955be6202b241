//! Support for the Sensirion `SCD40`/`SCD41` "CO₂, temperature and humidity sensor"
//!
//! The chip is command based: every interaction is a 16-bit opcode, optionally followed by
//! argument words, and answered with CRC-protected words (see [`crate::command`]).  While
//! periodic measurement runs the chip accepts only a handful of commands, so anything touching
//! the chip configuration stops it first and restarts it afterwards.
use crate::command::{Command, Response, Words};
use crate::controller::responds;
use crate::registry::{present, DriverFactory};
use crate::{
    AddressableDevice, BusDevice, DeviceAddress, DeviceController, Error, Reading, Reset, Result,
    Sensor,
};
use core::time::Duration;
use embedded_hal::i2c::I2c;

pub const NAME: &str = "scd4x";

pub const ADDRESSES: &[u8] = &[0x62];

pub const START_PERIODIC_MEASUREMENT: u16 = 0x21b1;
pub const READ_MEASUREMENT: u16 = 0xec05;
pub const STOP_PERIODIC_MEASUREMENT: u16 = 0x3f86;
pub const SET_AMBIENT_PRESSURE: u16 = 0xe000;
pub const GET_DATA_READY_STATUS: u16 = 0xe4b8;
pub const GET_SERIAL_NUMBER: u16 = 0x3682;
pub const PERFORM_FACTORY_RESET: u16 = 0x3632;

/// Periodic measurement produces a new sample this often.
pub const MEASUREMENT_INTERVAL: Duration = Duration::from_secs(5);

/// One sample of the periodic measurement.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Measurement {
    pub co2_ppm: u16,
    pub temperature_c: f64,
    pub humidity_rh: f64,
}

impl Response for Measurement {
    fn decode(words: &[u16]) -> Result<Self> {
        match *words {
            [co2, t, rh] => Ok(Self {
                co2_ppm: co2,
                temperature_c: -45.0 + 175.0 * f64::from(t) / 65535.0,
                humidity_rh: 100.0 * f64::from(rh) / 65535.0,
            }),
            _ => Err(Error::InvalidResponse("measurement is three words")),
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Payload {
    /// Pressure compensation, in hPa.
    ambient_pressure_hpa: Option<u16>,
}

#[derive(serde::Serialize)]
struct Configuration {
    driver: &'static str,
    address: DeviceAddress,
    serial: String,
    measurement_interval_s: u64,
}

pub struct Scd4x<I2C> {
    dev: BusDevice<I2C>,
    serial: u64,
    start_periodic: Command,
    stop_periodic: Command,
    read_measurement: Command<Measurement>,
    data_ready: Command<u16>,
    get_serial: Command<Words>,
    set_ambient_pressure: Command,
    factory_reset: Command,
}

impl<I2C: I2c> Scd4x<I2C> {
    pub fn new(dev: BusDevice<I2C>) -> Self {
        Self {
            dev,
            serial: 0,
            start_periodic: Command::new(START_PERIODIC_MEASUREMENT),
            stop_periodic: Command::new(STOP_PERIODIC_MEASUREMENT)
                .settle(Duration::from_millis(500)),
            read_measurement: Command::new(READ_MEASUREMENT)
                .settle(Duration::from_millis(1))
                .response_words(3)
                .min_interval(MEASUREMENT_INTERVAL),
            data_ready: Command::new(GET_DATA_READY_STATUS)
                .settle(Duration::from_millis(1))
                .response_words(1),
            get_serial: Command::new(GET_SERIAL_NUMBER)
                .settle(Duration::from_millis(1))
                .response_words(3),
            set_ambient_pressure: Command::new(SET_AMBIENT_PRESSURE)
                .settle(Duration::from_millis(1)),
            factory_reset: Command::new(PERFORM_FACTORY_RESET)
                .settle(Duration::from_millis(1200)),
        }
    }

    /// Identify the chip by its serial number and start periodic measurement.
    pub fn mount(dev: BusDevice<I2C>) -> Result<Self> {
        let mut this = Self::new(dev);
        this.stop_periodic.send(&mut this.dev)?;
        this.serial = this.read_serial()?;
        this.start_periodic.send(&mut this.dev)?;
        tracing::info!(
            address = %this.dev.address(),
            serial = %format!("{:012x}", this.serial),
            "scd4x ready"
        );
        Ok(this)
    }

    /// 48-bit serial number read at mount time.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn read_serial(&mut self) -> Result<u64> {
        let words = self.get_serial.execute(&mut self.dev, &[])?;
        Ok(words.iter().fold(0, |acc, w| (acc << 16) | u64::from(*w)))
    }

    /// Whether a new sample is waiting.
    pub fn data_ready(&mut self) -> Result<bool> {
        Ok(self.data_ready.execute(&mut self.dev, &[])? & 0x07ff != 0)
    }

    /// Read the latest sample.  Within [`MEASUREMENT_INTERVAL`] of the previous successful read
    /// the cached sample is returned without touching the bus.
    pub fn measure(&mut self) -> Result<Measurement> {
        self.read_measurement.execute(&mut self.dev, &[])
    }

    /// Last successfully read sample, even if a later read failed.
    pub fn last_measurement(&self) -> Option<&Measurement> {
        self.read_measurement.cached()
    }

    pub fn set_ambient_pressure(&mut self, hpa: u16) -> Result<()> {
        self.set_ambient_pressure.execute(&mut self.dev, &[hpa])
    }
}

impl<I2C: I2c> Sensor for Scd4x<I2C> {
    fn readings(&mut self) -> Vec<Reading> {
        match self.measure() {
            Ok(m) => vec![
                Reading::ok("co2", "ppm", f64::from(m.co2_ppm)),
                Reading::ok("temperature", "°C", m.temperature_c),
                Reading::ok("humidity", "%RH", m.humidity_rh),
            ],
            Err(e) => {
                tracing::debug!(address = %self.dev.address(), error = %e, "measurement failed");
                vec![
                    Reading::errored("co2", "ppm"),
                    Reading::errored("temperature", "°C"),
                    Reading::errored("humidity", "%RH"),
                ]
            }
        }
    }
}

impl<I2C: I2c> Reset for Scd4x<I2C> {
    /// Factory reset.  Erases calibration history and restarts periodic measurement.
    fn reset(&mut self) -> Result<()> {
        self.stop_periodic.send(&mut self.dev)?;
        self.factory_reset.send(&mut self.dev)?;
        self.read_measurement.clear();
        self.start_periodic.send(&mut self.dev)?;
        tracing::info!(address = %self.dev.address(), "scd4x factory reset");
        Ok(())
    }
}

impl<I2C: I2c + Send> DeviceController for Scd4x<I2C> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn address(&self) -> DeviceAddress {
        self.dev.address()
    }

    /// Works while periodic measurement runs, unlike re-reading the serial number.
    fn detect(&mut self) -> Result<bool> {
        responds(self.data_ready.execute(&mut self.dev, &[]))
    }

    fn configuration(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Configuration {
            driver: NAME,
            address: self.address(),
            serial: format!("{:012x}", self.serial),
            measurement_interval_s: MEASUREMENT_INTERVAL.as_secs(),
        })?)
    }

    fn state(&mut self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.measure()?)?)
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        let payload: Payload = serde_json::from_slice(payload)?;
        if let Some(hpa) = payload.ambient_pressure_hpa {
            self.set_ambient_pressure(hpa)?;
        }
        Ok(())
    }

    fn as_sensor(&mut self) -> Option<&mut dyn Sensor> {
        Some(self)
    }

    fn as_resettable(&mut self) -> Option<&mut dyn Reset> {
        Some(self)
    }
}

fn mount_controller<I2C: I2c + Send + 'static>(
    dev: BusDevice<I2C>,
) -> Result<Box<dyn DeviceController>> {
    Ok(Box::new(Scd4x::mount(dev)?))
}

/// The fixed address is specific enough; the serial number read during mount rejects
/// anything else.
pub fn factory<I2C: I2c + Send + 'static>() -> DriverFactory<I2C> {
    DriverFactory {
        name: NAME,
        addresses: ADDRESSES,
        probe: present,
        mount: mount_controller,
    }
}
