use crate::{DeviceAddress, Error, Result};
use core::ops::RangeInclusive;
use core::time::Duration;
use std::collections::BTreeMap;

/// First address probed by default; `0x00..=0x07` are reserved.
pub const DEFAULT_SCAN_START: u8 = 0x08;
/// Last address probed by default; `0x78..=0x7f` are reserved.
pub const DEFAULT_SCAN_END: u8 = 0x77;

/// Highest 7-bit slave address.
const MAX_ADDRESS: u8 = 0x7f;

/// A scan range must be non-empty and stay inside the 7-bit address space.
pub(crate) fn check_scan_range(range: &RangeInclusive<u8>) -> Result<()> {
    if range.start() > range.end() || *range.end() > MAX_ADDRESS {
        return Err(Error::InvalidAddress(format!(
            "{:#04x}..={:#04x}",
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

/// Per-bus configuration, usually deserialized from JSON:
///
/// ```
/// let config = i2c_mount::BusConfig::from_json(r#"{
///     "bus": 1,
///     "poll_delay_ms": 5,
///     "devices": { "0x20": "mcp23017", "0x21": "pca9554" }
/// }"#).unwrap();
/// assert_eq!(config.scan_range(), 0x08..=0x77);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub bus: u8,
    pub scan_start: u8,
    pub scan_end: u8,
    pub poll_delay_ms: u64,
    /// Explicit driver choice per address, for addresses several drivers claim.
    pub devices: BTreeMap<String, String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus: 0,
            scan_start: DEFAULT_SCAN_START,
            scan_end: DEFAULT_SCAN_END,
            poll_delay_ms: 0,
            devices: BTreeMap::new(),
        }
    }
}

impl BusConfig {
    /// Parse and validate a configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the scan range and the `devices` table.
    pub fn validate(&self) -> Result<()> {
        check_scan_range(&self.scan_range())?;
        self.device_map().map(drop)
    }

    pub fn scan_range(&self) -> RangeInclusive<u8> {
        self.scan_start..=self.scan_end
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Parsed `devices` table.  Entries naming another bus are rejected.
    pub fn device_map(&self) -> Result<BTreeMap<u8, &str>> {
        self.devices
            .iter()
            .map(|(addr, driver)| {
                let parsed = DeviceAddress::parse_on(self.bus, addr)?;
                if parsed.bus() != self.bus {
                    return Err(Error::InvalidAddress(addr.clone()));
                }
                Ok((parsed.address(), driver.as_str()))
            })
            .collect()
    }
}
